//! Receive -> Play pipeline (C4): reads inbound datagrams, runs each
//! sender through its own jitter buffer, and hands frames to a
//! `PlaybackSink` — a single stream for private calls, a per-tick mix of
//! every sender for group/global calls.
use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use dashmap::DashMap;
use tracing::{debug, trace};

use crate::audio::{self, AudioFrame, PlaybackSink};
use crate::config::{JITTER_WINDOW_GROUP, JITTER_WINDOW_PRIVATE, UDP_RECV_TIMEOUT_MS};
use crate::jitter::JitterBuffer;

/// Which consumer policy a receive pipeline runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Private,
    Group,
}

pub struct PipelineHandle {
    stop_flag: Arc<AtomicBool>,
    join: Option<std::thread::JoinHandle<()>>,
    completion_rx: crossbeam_channel::Receiver<()>,
}

impl PipelineHandle {
    /// Signal the receive loop to stop and wait up to the spec's 1-second
    /// call-teardown bound for it to finish; past that bound the
    /// `JoinHandle` is dropped rather than blocked on.
    pub fn stop(mut self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        if crate::call::join_with_teardown_bound("receive-play", self.completion_rx.clone()) {
            if let Some(j) = self.join.take() {
                let _ = j.join();
            }
        }
    }
}

pub struct ReceiveSendPipeline;

impl ReceiveSendPipeline {
    pub fn spawn(
        socket: UdpSocket,
        kind: SessionKind,
        mut sink: Box<dyn PlaybackSink>,
    ) -> PipelineHandle {
        let stop_flag = Arc::new(AtomicBool::new(false));
        let thread_stop = stop_flag.clone();
        let (done_tx, done_rx) = crossbeam_channel::bounded::<()>(1);
        socket
            .set_read_timeout(Some(Duration::from_millis(UDP_RECV_TIMEOUT_MS)))
            .ok();
        let join: JoinHandle<()> = std::thread::spawn(move || {
            debug!(?kind, "receive-play pipeline started");
            match kind {
                SessionKind::Private => {
                    run_private(&socket, &thread_stop, sink.as_mut());
                }
                SessionKind::Group => {
                    run_group(&socket, &thread_stop, sink.as_mut());
                }
            }
            debug!(?kind, "receive-play pipeline stopped");
            let _ = done_tx.send(());
        });
        PipelineHandle {
            stop_flag,
            join: Some(join),
            completion_rx: done_rx,
        }
    }
}

/// Decode one inbound datagram. A payload longer than one bare frame is
/// assumed sequenced (4-byte big-endian seq + frame); a payload of exactly
/// `FRAME_BYTES` is treated as raw/unsequenced with an implicit `seq=0`
/// (spec.md §4.4 backward-compatibility clause for senders that predate
/// sequencing).
fn decode_datagram(buf: &[u8]) -> Option<(u32, AudioFrame)> {
    if buf.len() > audio::FRAME_BYTES {
        let seq = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let frame = AudioFrame::from_exact(&buf[4..])?;
        Some((seq, frame))
    } else {
        let frame = AudioFrame::from_exact(buf)?;
        Some((0, frame))
    }
}

/// Private-call consumer: single jitter buffer, drained in-order on every
/// inbound packet; on a read timeout the oldest buffered frame is popped
/// (advancing the cursor) so playback keeps moving through loss, and an
/// empty buffer plays one frame (20ms) of silence.
fn run_private(socket: &UdpSocket, stop: &AtomicBool, sink: &mut dyn PlaybackSink) {
    let jitter = JitterBuffer::new(JITTER_WINDOW_PRIVATE);
    let mut buf = [0u8; 4 + audio::FRAME_BYTES + 16];
    while !stop.load(Ordering::Relaxed) {
        match socket.recv(&mut buf) {
            Ok(n) => {
                if let Some((seq, frame)) = decode_datagram(&buf[..n]) {
                    jitter.insert(seq, frame);
                    while let Some(f) = jitter.pop_expected() {
                        sink.write_frame(&f);
                    }
                }
            }
            Err(_) => {
                // Timeout or transient read error: keep the stream moving.
                match jitter.pop_expected() {
                    Some(f) => sink.write_frame(&f),
                    None => match jitter.pop_oldest() {
                        Some(f) => sink.write_frame(&f),
                        None => sink.write_frame(&AudioFrame::silence()),
                    },
                }
            }
        }
    }
}

/// Group/global consumer: one jitter buffer per sender address, mixed
/// every tick via `audio::mix`.
fn run_group(socket: &UdpSocket, stop: &AtomicBool, sink: &mut dyn PlaybackSink) {
    let buffers: DashMap<String, JitterBuffer> = DashMap::new();
    let mut buf = [0u8; 4 + audio::FRAME_BYTES + 16];
    while !stop.load(Ordering::Relaxed) {
        match socket.recv_from(&mut buf) {
            Ok((n, from)) => {
                if let Some((seq, frame)) = decode_datagram(&buf[..n]) {
                    let key = from.to_string();
                    buffers
                        .entry(key)
                        .or_insert_with(|| JitterBuffer::new(JITTER_WINDOW_GROUP))
                        .insert(seq, frame);
                }
            }
            Err(_) => {
                trace!("group receive tick timeout");
            }
        }
        let mut tick_frames = Vec::with_capacity(buffers.len());
        for entry in buffers.iter() {
            if let Some(f) = entry.value().pop_expected() {
                tick_frames.push(f);
            } else if let Some(f) = entry.value().pop_oldest() {
                tick_frames.push(f);
            }
        }
        if tick_frames.is_empty() {
            sink.write_frame(&AudioFrame::silence());
        } else {
            sink.write_frame(&audio::mix(&tick_frames));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct CollectingSink {
        frames: Arc<StdMutex<Vec<AudioFrame>>>,
    }

    impl PlaybackSink for CollectingSink {
        fn write_frame(&mut self, frame: &AudioFrame) {
            self.frames.lock().unwrap().push(*frame);
        }
    }

    #[test]
    fn decode_datagram_rejects_wrong_length() {
        assert!(decode_datagram(&[0u8; 3]).is_none());
        let mut buf = vec![0u8; 4 + audio::FRAME_BYTES];
        buf[3] = 7;
        let (seq, _) = decode_datagram(&buf).unwrap();
        assert_eq!(seq, 7);
    }

    #[test]
    fn private_pipeline_plays_silence_on_idle_socket() {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let frames = Arc::new(StdMutex::new(Vec::new()));
        let sink = Box::new(CollectingSink {
            frames: frames.clone(),
        });
        let handle = ReceiveSendPipeline::spawn(socket, SessionKind::Private, sink);
        std::thread::sleep(Duration::from_millis(50));
        handle.stop();
        let collected = frames.lock().unwrap();
        assert!(!collected.is_empty());
        assert!(collected.iter().all(|f| *f == AudioFrame::silence()));
    }

    #[test]
    fn group_pipeline_mixes_two_senders() {
        let recv_socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let recv_addr = recv_socket.local_addr().unwrap();
        let sender_a = UdpSocket::bind("127.0.0.1:0").unwrap();
        let sender_b = UdpSocket::bind("127.0.0.1:0").unwrap();

        let mut datagram = Vec::new();
        datagram.extend_from_slice(&0u32.to_be_bytes());
        datagram.extend_from_slice(AudioFrame::silence().as_bytes());
        sender_a.send_to(&datagram, recv_addr).unwrap();
        sender_b.send_to(&datagram, recv_addr).unwrap();

        let frames = Arc::new(StdMutex::new(Vec::new()));
        let sink = Box::new(CollectingSink {
            frames: frames.clone(),
        });
        let handle = ReceiveSendPipeline::spawn(recv_socket, SessionKind::Group, sink);
        std::thread::sleep(Duration::from_millis(50));
        handle.stop();
        assert!(!frames.lock().unwrap().is_empty());
    }
}
