//! Control-plane server (C8): session registry, group directory, and
//! call-setup mediation over the line-oriented TCP protocol in
//! [`crate::protocol`]. The server never touches media frames — calls are
//! always direct client-to-client UDP once ports are handed out.
use std::io::Write;
use std::net::{IpAddr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{info, warn};

use crate::call::{self, CallSetupError, CallTarget, PortPlan};
use crate::error::{VoxError, VoxResult};
use crate::protocol::{ClientDirective, IpScope, LineCodec, ServerDirective};
use crate::types::{Group, Peer};

/// Bound on the per-peer outbound queue: one slow writer must never stall
/// fan-out to everybody else.
const OUTBOUND_QUEUE_CAPACITY: usize = 256;

pub struct ServerState {
    pub peers: Arc<DashMap<String, Peer>>,
    pub groups: Arc<DashMap<String, Group>>,
    pub running: Arc<AtomicBool>,
}

impl ServerState {
    pub fn new() -> Self {
        Self {
            peers: Arc::new(DashMap::new()),
            groups: Arc::new(DashMap::new()),
            running: Arc::new(AtomicBool::new(true)),
        }
    }
}

impl Default for ServerState {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for ServerState {
    fn clone(&self) -> Self {
        Self {
            peers: self.peers.clone(),
            groups: self.groups.clone(),
            running: self.running.clone(),
        }
    }
}

/// Bind and run the control-plane listener. Blocks the calling thread
/// accepting connections; each connection gets its own handler thread.
pub fn run(bind_ip: &str, port: u16, state: ServerState) -> VoxResult<()> {
    let listener = TcpListener::bind((bind_ip, port)).map_err(VoxError::NetworkTransient)?;
    info!(bind_ip, port, "control server listening");
    while state.running.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, addr)) => {
                let st = state.clone();
                std::thread::spawn(move || {
                    if let Err(e) = handle_connection(stream, addr, st) {
                        warn!(%addr, error = %e, "control connection ended with error");
                    }
                });
            }
            Err(e) => warn!(error = %e, "accept failed"),
        }
    }
    Ok(())
}

pub fn stop(state: &ServerState) {
    state.running.store(false, Ordering::SeqCst);
}

/// Per-connection handshake + dispatch loop:
/// INIT -> READ_NAME -> READ_IP -> REGISTERED -> dispatch -> DISCONNECTED.
fn handle_connection(stream: TcpStream, addr: SocketAddr, state: ServerState) -> VoxResult<()> {
    let mut write_stream = stream.try_clone().map_err(VoxError::NetworkTransient)?;
    let mut codec = LineCodec::new(stream)?;

    let name = loop {
        let line = match codec.read_line()? {
            Some(l) => l,
            None => return Ok(()),
        };
        let candidate = line.trim().to_string();
        if candidate.is_empty() {
            write_line(&mut write_stream, "Username cannot be empty.")?;
            continue;
        }
        if state.peers.contains_key(&candidate) {
            write_line(&mut write_stream, "Username already taken.")?;
            continue;
        }
        write_line(&mut write_stream, "Username accepted.")?;
        break candidate;
    };

    let claimed_ip: IpAddr = match codec.read_line()? {
        Some(l) => l.trim().parse().unwrap_or(addr.ip()),
        None => return Ok(()),
    };

    let (tx, rx) = crossbeam_channel::bounded::<String>(OUTBOUND_QUEUE_CAPACITY);
    let writer_stop = Arc::new(AtomicBool::new(false));
    let writer_stop2 = writer_stop.clone();
    let writer_stream = write_stream.try_clone().map_err(VoxError::NetworkTransient)?;
    let writer_join = std::thread::spawn(move || {
        let mut ws = writer_stream;
        while !writer_stop2.load(Ordering::Relaxed) {
            match rx.recv_timeout(std::time::Duration::from_millis(200)) {
                Ok(line) => {
                    if write_line(&mut ws, &line).is_err() {
                        break;
                    }
                }
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
            }
        }
    });

    state.peers.insert(
        name.clone(),
        Peer {
            name: name.clone(),
            control_addr: addr,
            claimed_ip,
            outbound: tx.clone(),
        },
    );
    broadcast_online(&state);
    info!(%name, %addr, "peer registered");

    loop {
        let line = match codec.read_line() {
            Ok(Some(l)) => l,
            Ok(None) => break,
            Err(_) => break,
        };
        if let Err(e) = dispatch(&state, &name, ClientDirective::parse(&line)) {
            warn!(%name, error = %e, "directive dispatch failed");
        }
    }

    state.peers.remove(&name);
    for mut group in state.groups.iter_mut() {
        group.members.retain(|m| m != &name);
    }
    broadcast_online(&state);
    broadcast(&state, &ServerDirective::Leaving(name.clone()));
    info!(%name, "peer disconnected");

    writer_stop.store(true, Ordering::SeqCst);
    let _ = writer_join.join();
    write_stream.shutdown(Shutdown::Both).ok();
    Ok(())
}

fn dispatch(state: &ServerState, from: &str, directive: ClientDirective) -> VoxResult<()> {
    match directive {
        ClientDirective::GlobalChat(msg) => {
            broadcast_line(state, &format!("{from}: {msg}"));
        }
        ClientDirective::Whisper { to, msg } => {
            send(
                state,
                &to,
                &ServerDirective::Whisper {
                    from: from.to_string(),
                    msg,
                },
            );
        }
        ClientDirective::CreateGroup { name, members } => {
            let mut all_members = members;
            if !all_members.iter().any(|m| m == from) {
                all_members.push(from.to_string());
            }
            let directive = ServerDirective::JoinGroup {
                name: name.clone(),
                members: all_members.clone(),
            };
            for member in &all_members {
                send(state, member, &directive);
            }
            state.groups.insert(name.clone(), Group::new(name, all_members));
        }
        ClientDirective::GroupMessage { group, msg } => {
            if let Some(g) = state.groups.get(&group) {
                if !g.contains(from) {
                    warn!(%from, %group, "group message from a non-member, dropping");
                    return Ok(());
                }
                let directive = ServerDirective::GroupMessage {
                    sender: from.to_string(),
                    group: group.clone(),
                    msg,
                };
                for member in &g.members {
                    if member != from {
                        send(state, member, &directive);
                    }
                }
            }
        }
        ClientDirective::GetIps(scope) => handle_get_ips(state, from, scope),
        ClientDirective::Call(target) => {
            let target = parse_target(state, &target);
            handle_call(state, from, target);
        }
        ClientDirective::CallEnded(target) => {
            broadcast_call_ended(state, from, &target);
        }
        ClientDirective::Exit => {}
    }
    Ok(())
}

fn parse_target(state: &ServerState, raw: &str) -> CallTarget {
    if raw.eq_ignore_ascii_case("global") {
        CallTarget::Global
    } else if state.groups.contains_key(raw) {
        CallTarget::Group(raw.to_string())
    } else {
        CallTarget::Peer(raw.to_string())
    }
}

/// Resolve IP addresses for a scope: global -> every registered peer,
/// group -> that group's members, peer -> a single name. The wire payload
/// is a bare CSV of IPs (spec.md §4.7/§8 scenario 6), so a recipient's name
/// is not disclosed here — only its claimed address.
fn handle_get_ips(state: &ServerState, from: &str, scope: IpScope) {
    let ips: Vec<IpAddr> = match &scope {
        IpScope::Global => state
            .peers
            .iter()
            .filter(|p| p.key() != from)
            .map(|p| p.claimed_ip)
            .collect(),
        IpScope::Group(group_name) => state
            .groups
            .get(group_name)
            .map(|g| {
                g.members
                    .iter()
                    .filter(|m| *m != from)
                    .filter_map(|m| state.peers.get(m).map(|p| p.claimed_ip))
                    .collect()
            })
            .unwrap_or_default(),
        IpScope::Peer(peer_name) => state
            .peers
            .get(peer_name)
            .map(|p| vec![p.claimed_ip])
            .unwrap_or_default(),
    };
    let rendered: Vec<String> = ips.iter().map(|ip| ip.to_string()).collect();
    send(
        state,
        from,
        &ServerDirective::ReceivedIps {
            ips: rendered,
            scope: scope.bare_name().to_string(),
        },
    );
}

fn handle_call(state: &ServerState, from: &str, target: CallTarget) {
    if let Err(CallSetupError::SelfCall) = call::validate_target(from, &target) {
        send(state, from, &ServerDirective::CallEnded(from.to_string()));
        return;
    }

    let members: Vec<(String, SocketAddr)> = match &target {
        CallTarget::Peer(name) => state
            .peers
            .get(name)
            .map(|p| vec![(p.name.clone(), p.control_addr)])
            .unwrap_or_default(),
        CallTarget::Group(name) => state
            .groups
            .get(name)
            .map(|g| {
                let mut members: Vec<(String, SocketAddr)> = g
                    .members
                    .iter()
                    .filter_map(|m| state.peers.get(m).map(|p| (p.name.clone(), p.control_addr)))
                    .collect();
                // The initiator is a full call participant too (spec.md §3
                // `Global{members: map<addr,port>}` is a full-mesh roster);
                // make sure they get a port even if the group listing
                // happened not to include them already.
                if !members.iter().any(|(n, _)| n == from) {
                    if let Some(p) = state.peers.get(from) {
                        members.push((p.name.clone(), p.control_addr));
                    }
                }
                members
            })
            .unwrap_or_default(),
        CallTarget::Global => state
            .peers
            .iter()
            .map(|p| (p.name.clone(), p.control_addr))
            .collect(),
    };

    match call::allocate_ports(&target, &members) {
        None => {
            send(state, from, &ServerDirective::CallEnded(from.to_string()));
        }
        Some(PortPlan::Private {
            target_port,
            initiator_port,
        }) => {
            if let CallTarget::Peer(peer_name) = &target {
                let initiator_ip = state.peers.get(from).map(|p| p.claimed_ip);
                let target_ip = state.peers.get(peer_name).map(|p| p.claimed_ip);
                if let (Some(initiator_ip), Some(target_ip)) = (initiator_ip, target_ip) {
                    send(
                        state,
                        peer_name,
                        &ServerDirective::CallAcceptedPrivate {
                            peer_ip: initiator_ip.to_string(),
                            port: target_port,
                            peer_name: from.to_string(),
                        },
                    );
                    send(
                        state,
                        from,
                        &ServerDirective::CallAcceptedPrivate {
                            peer_ip: target_ip.to_string(),
                            port: initiator_port,
                            peer_name: peer_name.clone(),
                        },
                    );
                } else {
                    send(state, from, &ServerDirective::CallEnded(from.to_string()));
                }
            }
        }
        Some(PortPlan::Fanout(entries)) => {
            let roster: Vec<(String, u16)> = entries
                .iter()
                .filter_map(|(name, _, port)| {
                    state.peers.get(name).map(|p| (p.claimed_ip.to_string(), *port))
                })
                .collect();
            let directive = ServerDirective::CallAcceptedGlobal(roster);
            for (name, _, _) in &entries {
                send(state, name, &directive);
            }
            // `entries` already includes the initiator for a global call and
            // for any group the initiator is a member of; only a call into a
            // group the initiator isn't part of still needs this fallback.
            if !entries.iter().any(|(name, _, _)| name == from) {
                send(state, from, &directive);
            }
        }
    }
}

fn broadcast_call_ended(state: &ServerState, from: &str, target: &str) {
    let directive = ServerDirective::CallEnded(from.to_string());
    if target.eq_ignore_ascii_case("global") {
        broadcast(state, &directive);
    } else if let Some(group) = state.groups.get(target) {
        for member in &group.members {
            if member != from {
                send(state, member, &directive);
            }
        }
    } else {
        send(state, target, &directive);
    }
}

fn broadcast_online(state: &ServerState) {
    let names: Vec<String> = state.peers.iter().map(|p| p.name.clone()).collect();
    broadcast(state, &ServerDirective::Online(names));
}

fn broadcast(state: &ServerState, directive: &ServerDirective) {
    broadcast_line(state, &directive.to_string());
}

fn broadcast_line(state: &ServerState, line: &str) {
    for peer in state.peers.iter() {
        let _ = peer.outbound.try_send(line.to_string());
    }
}

fn send(state: &ServerState, name: &str, directive: &ServerDirective) {
    if let Some(peer) = state.peers.get(name) {
        let _ = peer.outbound.try_send(directive.to_string());
    }
}

fn write_line(stream: &mut TcpStream, line: &str) -> VoxResult<()> {
    stream
        .write_all(line.as_bytes())
        .and_then(|_| stream.write_all(b"\n"))
        .map_err(VoxError::NetworkTransient)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader};
    use std::net::TcpStream as StdTcpStream;

    fn connect_and_register(port: u16, name: &str) -> (StdTcpStream, BufReader<StdTcpStream>) {
        let mut stream = StdTcpStream::connect(("127.0.0.1", port)).unwrap();
        let mut reader = BufReader::new(stream.try_clone().unwrap());
        let mut line = String::new();
        stream.write_all(format!("{name}\n").as_bytes()).unwrap();
        reader.read_line(&mut line).unwrap();
        assert_eq!(line.trim(), "Username accepted.");
        stream.write_all(b"127.0.0.1\n").unwrap();
        (stream, reader)
    }

    #[test]
    fn duplicate_name_is_rejected() {
        let state = ServerState::new();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let st = state.clone();
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let stream = stream.unwrap();
                let addr = stream.peer_addr().unwrap();
                let st2 = st.clone();
                std::thread::spawn(move || {
                    let _ = handle_connection(stream, addr, st2);
                });
            }
        });

        let (_s1, _r1) = connect_and_register(port, "alice");
        std::thread::sleep(std::time::Duration::from_millis(50));

        let mut s2 = StdTcpStream::connect(("127.0.0.1", port)).unwrap();
        let mut r2 = BufReader::new(s2.try_clone().unwrap());
        s2.write_all(b"alice\n").unwrap();
        let mut line = String::new();
        r2.read_line(&mut line).unwrap();
        assert_eq!(line.trim(), "Username already taken.");
    }

    #[test]
    fn global_chat_is_broadcast_to_other_peers() {
        let state = ServerState::new();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let st = state.clone();
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let stream = stream.unwrap();
                let addr = stream.peer_addr().unwrap();
                let st2 = st.clone();
                std::thread::spawn(move || {
                    let _ = handle_connection(stream, addr, st2);
                });
            }
        });

        let (_s1, mut r1) = connect_and_register(port, "alice");
        let (mut s2, mut r2) = connect_and_register(port, "bob");
        std::thread::sleep(std::time::Duration::from_millis(50));

        // drain the ONLINE broadcasts triggered by alice's own join and by
        // bob's (one each).
        for _ in 0..2 {
            let mut online = String::new();
            r1.read_line(&mut online).unwrap();
            assert!(online.starts_with("ONLINE:"));
        }

        s2.write_all(b"hello everyone\n").unwrap();
        let mut line = String::new();
        r1.read_line(&mut line).unwrap();
        assert_eq!(line.trim(), "bob: hello everyone");
    }

    fn spawn_acceptor(state: &ServerState, listener: TcpListener) {
        let st = state.clone();
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let stream = stream.unwrap();
                let addr = stream.peer_addr().unwrap();
                let st2 = st.clone();
                std::thread::spawn(move || {
                    let _ = handle_connection(stream, addr, st2);
                });
            }
        });
    }

    /// Spec scenario 1: a whisper is delivered exactly once to its target,
    /// with no broadcast to other peers.
    #[test]
    fn whisper_delivers_exactly_once_to_target() {
        let state = ServerState::new();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        spawn_acceptor(&state, listener);

        let (_s1, mut r1) = connect_and_register(port, "a");
        let (mut s2, mut r2) = connect_and_register(port, "b");
        std::thread::sleep(std::time::Duration::from_millis(50));

        // drain the ONLINE broadcasts triggered by a's own join and by b's.
        for _ in 0..2 {
            let mut online = String::new();
            r1.read_line(&mut online).unwrap();
        }

        s2.write_all(b"@a hello\n").unwrap();
        let mut line = String::new();
        r1.read_line(&mut line).unwrap();
        assert_eq!(line.trim(), "Whisper from b: hello");

        // b only ever saw its own join's ONLINE: broadcast; confirm the
        // whisper is not echoed back by attempting a short, bounded read.
        let mut b_online = String::new();
        r2.read_line(&mut b_online).unwrap();
        assert!(b_online.starts_with("ONLINE:"));
        r2.get_ref()
            .set_read_timeout(Some(std::time::Duration::from_millis(50)))
            .unwrap();
        let mut extra = String::new();
        let res = r2.read_line(&mut extra);
        assert!(res.is_err() || extra.is_empty());
    }

    /// Spec scenario 2: the most recent ONLINE: line reflects registry
    /// (insertion) order after three peers join in sequence.
    #[test]
    fn directory_online_snapshot_reflects_registration_order() {
        let state = ServerState::new();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        spawn_acceptor(&state, listener);

        let (_s1, mut r1) = connect_and_register(port, "a");
        let (_s2, _r2) = connect_and_register(port, "b");
        std::thread::sleep(std::time::Duration::from_millis(30));
        let (_s3, _r3) = connect_and_register(port, "c");
        std::thread::sleep(std::time::Duration::from_millis(30));

        // a observes one ONLINE: broadcast per join (its own, b's, c's);
        // the last one is the settled three-peer directory.
        let mut last = String::new();
        for _ in 0..3 {
            let mut line = String::new();
            r1.read_line(&mut line).unwrap();
            assert!(line.starts_with("ONLINE:"));
            last = line;
        }
        assert_eq!(last.trim(), "ONLINE:a,b,c");
    }

    /// Spec scenario 6: a group's voice-note address disclosure resolves to
    /// every other member's claimed IP, keyed by the group's own name.
    #[test]
    fn group_get_ips_resolves_member_addresses_excluding_requester() {
        let state = ServerState::new();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        spawn_acceptor(&state, listener);

        let (mut s1, mut r1) = connect_and_register(port, "a");
        let (_s2, _r2) = connect_and_register(port, "b");
        let (_s3, _r3) = connect_and_register(port, "c");
        std::thread::sleep(std::time::Duration::from_millis(50));

        // drain the ONLINE broadcasts triggered by a's own join, then b's
        // and c's (one each).
        for _ in 0..3 {
            let mut line = String::new();
            r1.read_line(&mut line).unwrap();
        }

        s1.write_all(b"/creategroup@devs-a,b,c\n").unwrap();
        let mut join_line = String::new();
        r1.read_line(&mut join_line).unwrap();
        assert_eq!(join_line.trim(), "Join Group: @devs-a,b,c");

        s1.write_all(b"/getIps @devs\n").unwrap();
        let mut ips_line = String::new();
        r1.read_line(&mut ips_line).unwrap();
        assert_eq!(ips_line.trim(), "receivedIPs voicenote:127.0.0.1,127.0.0.1@devs");
    }

    /// A `global` call's roster must include the initiator's own `ip:port`
    /// entry, not just the other participants — every client (initiator
    /// included) needs a port to bind and a full destination table.
    #[test]
    fn global_call_roster_includes_the_initiator() {
        let state = ServerState::new();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        spawn_acceptor(&state, listener);

        let (mut s1, mut r1) = connect_and_register(port, "a");
        let (_s2, _r2) = connect_and_register(port, "b");
        std::thread::sleep(std::time::Duration::from_millis(50));

        // drain the ONLINE broadcasts triggered by a's own join and by b's.
        for _ in 0..2 {
            let mut line = String::new();
            r1.read_line(&mut line).unwrap();
        }

        s1.write_all(b"Call global\n").unwrap();
        let mut accepted = String::new();
        r1.read_line(&mut accepted).unwrap();
        let accepted = accepted.trim();
        assert!(accepted.starts_with("CALL ACCEPTED (global): "));
        let roster = accepted.trim_start_matches("CALL ACCEPTED (global): ");
        let entries: Vec<&str> = roster.split(',').collect();
        assert_eq!(entries.len(), 2, "roster must include both a and b: {roster}");
        let ports: std::collections::HashSet<&str> = entries
            .iter()
            .map(|e| e.rsplit_once(':').unwrap().1)
            .collect();
        assert_eq!(ports.len(), 2, "a and b must get distinct ports: {roster}");
    }
}
