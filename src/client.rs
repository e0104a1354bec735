//! Client control engine (C9): control-connection handshake, directive
//! dispatch, and call lifecycle wiring between [`crate::call`]'s state
//! machine and the [`crate::capture_send`]/[`crate::receive_play`]
//! pipelines.
use std::io::Write;
use std::net::{IpAddr, SocketAddr, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_channel::{Receiver, Sender};
use dashmap::DashMap;
use tracing::{info, warn};

use crate::audio::{self, CaptureSource, CpalCapture, CpalPlayback, PlaybackSink};
use crate::call::{CallAction, CallEngine, CallEvent, CallSession, CallTargetName};
use crate::capture_send::{self, CaptureSendPipeline};
use crate::config::MEDIA_PORT_BASE;
use crate::error::{VoxError, VoxResult};
use crate::protocol::{ClientDirective, IpScope, LineCodec, ServerDirective};
use crate::receive_play::{ReceiveSendPipeline, SessionKind};

/// Events a UI/CLI layer consumes; the engine never blocks on a consumer
/// reading these (the channel is unbounded, matching directory/roster
/// traffic which is low-volume and must never be dropped).
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Online(Vec<String>),
    Leaving(String),
    GlobalChat { from: String, msg: String },
    Whisper { from: String, msg: String },
    JoinedGroup { name: String, members: Vec<String> },
    GroupMessage { sender: String, group: String, msg: String },
    ReceivedIps { ips: Vec<IpAddr>, scope: String },
    CallStarted,
    CallEnded(String),
    VoiceNoteSent { recipient: String },
    VoiceNoteFailed { recipient: String, reason: String },
    Disconnected,
}

struct ActiveCall {
    capture: capture_send::PipelineHandle,
    playback: crate::receive_play::PipelineHandle,
}

/// Client-local runtime state: directory/group views mirrored from server
/// broadcasts, plus the call engine and whatever pipelines a live call
/// currently owns.
pub struct ClientState {
    pub name: String,
    pub claimed_ip: IpAddr,
    control: Mutex<TcpStream>,
    pub directory: Arc<Mutex<Vec<String>>>,
    pub groups: Arc<DashMap<String, Vec<String>>>,
    call_engine: Mutex<CallEngine>,
    active_call: Mutex<Option<ActiveCall>>,
    /// The target last requested or accepted, kept around solely so
    /// `end_call` knows which wire routing string (`"global"` or a peer
    /// name) the server's `CALL ENDED` handling expects — `CallSession`
    /// itself carries no group/global name.
    last_target: Mutex<Option<CallTargetName>>,
    pub selected_voice_note: Arc<Mutex<Option<std::path::PathBuf>>>,
    running: Arc<AtomicBool>,
    /// Per-run scratch directory for outgoing recordings, removed on clean
    /// `/exit` by [`ClientState::disconnect`].
    scratch_dir: std::path::PathBuf,
}

/// Connect, perform the name/IP handshake, and spawn the reader thread
/// that turns inbound lines into [`ClientEvent`]s.
pub fn connect(
    server_ip: &str,
    port: u16,
    name: &str,
    local_ip: IpAddr,
) -> VoxResult<(Arc<ClientState>, Receiver<ClientEvent>)> {
    let stream = TcpStream::connect((server_ip, port)).map_err(VoxError::NetworkTransient)?;
    let mut write_stream = stream.try_clone().map_err(VoxError::NetworkTransient)?;
    let mut codec = LineCodec::new(stream.try_clone().map_err(VoxError::NetworkTransient)?)?;

    write_line(&mut write_stream, name)?;
    let reply = codec
        .read_line()?
        .ok_or_else(|| VoxError::NetworkFatal("server closed during handshake".into()))?;
    if reply.trim() != "Username accepted." {
        return Err(VoxError::ProtocolViolation(reply));
    }
    write_line(&mut write_stream, &local_ip.to_string())?;

    let scratch_dir = std::env::temp_dir().join(format!(".voxhub-scratch-{}", std::process::id()));
    std::fs::create_dir_all(&scratch_dir).map_err(VoxError::NetworkTransient)?;

    let state = Arc::new(ClientState {
        name: name.to_string(),
        claimed_ip: local_ip,
        control: Mutex::new(write_stream),
        directory: Arc::new(Mutex::new(Vec::new())),
        groups: Arc::new(DashMap::new()),
        call_engine: Mutex::new(CallEngine::new()),
        active_call: Mutex::new(None),
        last_target: Mutex::new(None),
        selected_voice_note: Arc::new(Mutex::new(None)),
        running: Arc::new(AtomicBool::new(true)),
        scratch_dir,
    });

    let (tx, rx) = crossbeam_channel::unbounded();
    let reader_state = state.clone();
    std::thread::spawn(move || reader_loop(codec, reader_state, tx));

    info!(%name, %server_ip, port, "connected to control server");
    Ok((state, rx))
}

fn reader_loop(mut codec: LineCodec, state: Arc<ClientState>, tx: Sender<ClientEvent>) {
    while state.running.load(Ordering::Relaxed) {
        match codec.read_line() {
            Ok(Some(line)) => handle_inbound(&state, &line, &tx),
            Ok(None) | Err(_) => break,
        }
    }
    state.running.store(false, Ordering::SeqCst);
    let _ = tx.send(ClientEvent::Disconnected);
}

fn handle_inbound(state: &Arc<ClientState>, line: &str, tx: &Sender<ClientEvent>) {
    match ServerDirective::parse(line) {
        Ok(ServerDirective::Online(names)) => {
            *state.directory.lock().unwrap() = names.clone();
            let _ = tx.send(ClientEvent::Online(names));
        }
        Ok(ServerDirective::Leaving(name)) => {
            let _ = tx.send(ClientEvent::Leaving(name));
        }
        Ok(ServerDirective::Whisper { from, msg }) => {
            let _ = tx.send(ClientEvent::Whisper { from, msg });
        }
        Ok(ServerDirective::JoinGroup { name, members }) => {
            state.groups.insert(name.clone(), members.clone());
            let _ = tx.send(ClientEvent::JoinedGroup { name, members });
        }
        Ok(ServerDirective::GroupMessage { sender, group, msg }) => {
            let _ = tx.send(ClientEvent::GroupMessage { sender, group, msg });
        }
        Ok(ServerDirective::ReceivedIps { ips, scope }) => {
            let parsed: Vec<IpAddr> = ips.iter().filter_map(|entry| entry.parse().ok()).collect();
            fan_out_voice_note(state, &parsed, tx);
            let _ = tx.send(ClientEvent::ReceivedIps { ips: parsed, scope });
        }
        Ok(ServerDirective::CallAcceptedPrivate { peer_ip, port, peer_name }) => {
            on_call_accepted_private(state, &peer_ip, port, &peer_name);
            let _ = tx.send(ClientEvent::CallStarted);
        }
        Ok(ServerDirective::CallAcceptedGlobal(members)) => {
            on_call_accepted_fanout(state, &members);
            let _ = tx.send(ClientEvent::CallStarted);
        }
        Ok(ServerDirective::CallEnded(who)) => {
            teardown_call(state);
            state.call_engine.lock().unwrap().transition(CallEvent::RemoteEnded);
            let _ = tx.send(ClientEvent::CallEnded(who));
        }
        Ok(ServerDirective::Terminate) => {
            state.running.store(false, Ordering::SeqCst);
        }
        Err(_) => {
            if let Some((from, msg)) = line.split_once(": ") {
                let _ = tx.send(ClientEvent::GlobalChat {
                    from: from.to_string(),
                    msg: msg.to_string(),
                });
            } else {
                warn!(line, "unrecognized server line");
            }
        }
    }
}

/// Second phase of the two-phase voice-note transaction: once
/// the server discloses recipient addresses, push the currently selected
/// file to each one on its own thread so one slow/unreachable recipient
/// cannot delay delivery to the rest.
fn fan_out_voice_note(state: &Arc<ClientState>, recipients: &[IpAddr], tx: &Sender<ClientEvent>) {
    let Some(path) = state.selected_voice_note.lock().unwrap().clone() else {
        return;
    };
    let sender_name = state.name.clone();
    for ip in recipients.iter().copied() {
        let path = path.clone();
        let sender_name = sender_name.clone();
        let tx = tx.clone();
        std::thread::spawn(move || {
            match crate::voicenote::send_voice_note(ip, Some(&sender_name), &path) {
                Ok(true) => {
                    let _ = tx.send(ClientEvent::VoiceNoteSent {
                        recipient: ip.to_string(),
                    });
                }
                Ok(false) | Err(_) => {
                    let _ = tx.send(ClientEvent::VoiceNoteFailed {
                        recipient: ip.to_string(),
                        reason: "delivery failed".to_string(),
                    });
                }
            }
        });
    }
}

fn on_call_accepted_private(state: &Arc<ClientState>, peer_ip: &str, local_port: u16, peer_name: &str) {
    let Ok(ip) = peer_ip.parse::<IpAddr>() else {
        warn!(peer_ip, "malformed call-accepted peer ip");
        return;
    };
    // The wire message carries *our own* bind port (the fixed private-call
    // pair, 5001/5002); the peer always binds the other one.
    let remote_port = if local_port == MEDIA_PORT_BASE {
        MEDIA_PORT_BASE + 1
    } else {
        MEDIA_PORT_BASE
    };
    let remote_addr = SocketAddr::new(ip, remote_port);
    let session = CallSession::Private {
        peer: peer_name.to_string(),
        remote_addr,
        remote_port,
        local_port,
    };
    state
        .call_engine
        .lock()
        .unwrap()
        .transition(CallEvent::Accepted(session));
    start_private_pipelines(state, remote_addr, local_port);
}

fn on_call_accepted_fanout(state: &Arc<ClientState>, members: &[(String, u16)]) {
    // The roster lists every party including ourselves; our
    // own entry (matched by claimed IP) gives the port we bind locally,
    // everyone else is a UDP destination.
    let local_port = members
        .iter()
        .find(|(ip, _)| ip.parse::<IpAddr>().map(|a| a == state.claimed_ip).unwrap_or(false))
        .map(|(_, port)| *port)
        .unwrap_or(MEDIA_PORT_BASE);

    let destinations: std::collections::HashMap<SocketAddr, u16> = members
        .iter()
        .filter(|(ip, _)| {
            ip.parse::<IpAddr>()
                .map(|a| a != state.claimed_ip)
                .unwrap_or(true)
        })
        .filter_map(|(ip, port)| Some((SocketAddr::new(ip.parse().ok()?, *port), *port)))
        .collect();

    let session = CallSession::Group {
        members: destinations.clone(),
        local_port,
    };
    state
        .call_engine
        .lock()
        .unwrap()
        .transition(CallEvent::Accepted(session));
    start_group_pipelines(state, destinations, local_port);
}

fn start_private_pipelines(state: &Arc<ClientState>, remote_addr: SocketAddr, local_port: u16) {
    let Ok((capture_dev, playback_dev)) = default_devices() else {
        warn!("no audio devices available, call media will be silent");
        return;
    };
    let Ok(send_socket) = UdpSocket::bind(("0.0.0.0", local_port)) else {
        warn!(local_port, "failed to bind call media socket");
        return;
    };
    let Ok(recv_socket) = send_socket.try_clone() else {
        return;
    };
    let destinations = Arc::new(Mutex::new(std::collections::HashMap::from([(
        remote_addr,
        remote_addr.port(),
    )])));
    let capture: Box<dyn CaptureSource> = match CpalCapture::open(&capture_dev) {
        Ok(c) => Box::new(c),
        Err(e) => {
            warn!(error = %e, "capture device open failed");
            return;
        }
    };
    let sink: Box<dyn PlaybackSink> = match CpalPlayback::open(&playback_dev) {
        Ok(p) => Box::new(p),
        Err(e) => {
            warn!(error = %e, "playback device open failed");
            return;
        }
    };
    let capture_handle = CaptureSendPipeline::spawn(capture, send_socket, destinations, true);
    let playback_handle = ReceiveSendPipeline::spawn(recv_socket, SessionKind::Private, sink);
    *state.active_call.lock().unwrap() = Some(ActiveCall {
        capture: capture_handle,
        playback: playback_handle,
    });
}

fn start_group_pipelines(
    state: &Arc<ClientState>,
    members: std::collections::HashMap<SocketAddr, u16>,
    local_port: u16,
) {
    let Ok((capture_dev, playback_dev)) = default_devices() else {
        warn!("no audio devices available, call media will be silent");
        return;
    };
    let Ok(send_socket) = UdpSocket::bind(("0.0.0.0", local_port)) else {
        warn!(local_port, "failed to bind call media socket");
        return;
    };
    let Ok(recv_socket) = send_socket.try_clone() else {
        return;
    };
    let destinations = Arc::new(Mutex::new(members));
    let capture: Box<dyn CaptureSource> = match CpalCapture::open(&capture_dev) {
        Ok(c) => Box::new(c),
        Err(e) => {
            warn!(error = %e, "capture device open failed");
            return;
        }
    };
    let sink: Box<dyn PlaybackSink> = match CpalPlayback::open(&playback_dev) {
        Ok(p) => Box::new(p),
        Err(e) => {
            warn!(error = %e, "playback device open failed");
            return;
        }
    };
    let capture_handle = CaptureSendPipeline::spawn(capture, send_socket, destinations, false);
    let playback_handle = ReceiveSendPipeline::spawn(recv_socket, SessionKind::Group, sink);
    *state.active_call.lock().unwrap() = Some(ActiveCall {
        capture: capture_handle,
        playback: playback_handle,
    });
}

fn default_devices() -> VoxResult<(cpal::Device, cpal::Device)> {
    let (inputs, outputs) = audio::list_devices()?;
    let input = inputs
        .into_iter()
        .next()
        .ok_or_else(|| VoxError::MediaHardwareFailure("no input device".into()))?;
    let output = outputs
        .into_iter()
        .next()
        .ok_or_else(|| VoxError::MediaHardwareFailure("no output device".into()))?;
    info!(
        input = %audio::device_name(&input),
        output = %audio::device_name(&output),
        "selected default audio devices for call"
    );
    Ok((input, output))
}

fn teardown_call(state: &Arc<ClientState>) {
    if let Some(active) = state.active_call.lock().unwrap().take() {
        active.capture.stop();
        active.playback.stop();
    }
}

impl ClientState {
    pub fn send_chat(&self, msg: &str) -> VoxResult<()> {
        self.send_directive(&ClientDirective::GlobalChat(msg.to_string()))
    }

    pub fn send_whisper(&self, to: &str, msg: &str) -> VoxResult<()> {
        self.send_directive(&ClientDirective::Whisper {
            to: to.to_string(),
            msg: msg.to_string(),
        })
    }

    pub fn create_group(&self, name: &str, members: Vec<String>) -> VoxResult<()> {
        self.send_directive(&ClientDirective::CreateGroup {
            name: name.to_string(),
            members,
        })
    }

    pub fn send_group_message(&self, group: &str, msg: &str) -> VoxResult<()> {
        self.send_directive(&ClientDirective::GroupMessage {
            group: group.to_string(),
            msg: msg.to_string(),
        })
    }

    /// First phase of a voice-note send: ask the server for the recipient
    /// scope's IPs; the caller pushes the file once `ClientEvent::ReceivedIps`
    /// arrives (a two-phase transaction).
    pub fn request_voice_note_ips(&self, scope: IpScope) -> VoxResult<()> {
        self.send_directive(&ClientDirective::GetIps(scope))
    }

    /// Request a new call. If one is already `InCall`, its pipelines are
    /// torn down first (spec.md §4.10: `InCall --Call<other>--> (teardown
    /// old) -> Pending`) before the new `Call` directive goes out.
    pub fn start_call(self: &Arc<Self>, target: CallTargetName) -> VoxResult<CallAction> {
        let wire_target = match &target {
            CallTargetName::Global => "global".to_string(),
            CallTargetName::Group(name) => name.clone(),
            CallTargetName::Peer(name) => name.clone(),
        };
        *self.last_target.lock().unwrap() = Some(target.clone());
        let action = self
            .call_engine
            .lock()
            .unwrap()
            .transition(CallEvent::RequestCall(target));
        if matches!(action, CallAction::TeardownThenPending(_)) {
            teardown_call(self);
        }
        self.send_directive(&ClientDirective::Call(wire_target))?;
        Ok(action)
    }

    pub fn end_call(self: &Arc<Self>) -> VoxResult<()> {
        let action = self.call_engine.lock().unwrap().transition(CallEvent::LocalStop);
        teardown_call(self);
        if matches!(action, CallAction::EmitCallEnded) {
            let target = self.last_target.lock().unwrap().take();
            let routing = match target {
                Some(CallTargetName::Peer(name)) => name,
                Some(CallTargetName::Group(_)) | Some(CallTargetName::Global) | None => {
                    "global".to_string()
                }
            };
            self.send_directive(&ClientDirective::CallEnded(routing))?;
        }
        Ok(())
    }

    pub fn is_in_call(&self) -> bool {
        self.call_engine.lock().unwrap().is_in_call()
    }

    pub fn scratch_dir(&self) -> &std::path::Path {
        &self.scratch_dir
    }

    /// Graceful leave (`/exit`): signals the reader loop to stop and
    /// removes the per-run scratch directory.
    pub fn disconnect(&self) {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.send_directive(&ClientDirective::Exit);
        let _ = std::fs::remove_dir_all(&self.scratch_dir);
    }

    fn send_directive(&self, directive: &ClientDirective) -> VoxResult<()> {
        let mut stream = self.control.lock().unwrap();
        write_line(&mut stream, &directive.to_string())
    }
}

fn write_line(stream: &mut TcpStream, line: &str) -> VoxResult<()> {
    stream
        .write_all(line.as_bytes())
        .and_then(|_| stream.write_all(b"\n"))
        .map_err(VoxError::NetworkTransient)
}
