//! Capture -> Send pipeline (C3): pulls frames from a `CaptureSource` and
//! fans each one out over UDP to every current destination, prefixed with
//! a 4-byte big-endian sequence number shared across all destinations.
use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use tracing::{debug, warn};

use crate::audio::CaptureSource;

/// Handle to a running pipeline thread. Dropping it does not stop the
/// thread; callers must call `stop()` explicitly.
pub struct PipelineHandle {
    stop_flag: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
    completion_rx: crossbeam_channel::Receiver<()>,
}

impl PipelineHandle {
    /// Signal the capture loop to stop and wait up to the spec's 1-second
    /// call-teardown bound (`call::join_with_teardown_bound`) for it to
    /// finish. If the bound is exceeded the `JoinHandle` is dropped instead
    /// of blocked on, matching the teardown invariant's "released" wording.
    pub fn stop(mut self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        if crate::call::join_with_teardown_bound("capture-send", self.completion_rx.clone()) {
            if let Some(j) = self.join.take() {
                let _ = j.join();
            }
        }
    }
}

/// Runs capture and UDP fan-out on its own thread until stopped.
///
/// `destinations` maps each current peer address to the UDP port the
/// frame must be sent to; it is shared with the call coordinator so a
/// group roster change takes effect on the very next tick without
/// restarting the pipeline. `is_private` only affects logging context,
/// the wire format is identical for both call kinds.
pub struct CaptureSendPipeline;

impl CaptureSendPipeline {
    pub fn spawn(
        mut capture: Box<dyn CaptureSource>,
        socket: UdpSocket,
        destinations: Arc<Mutex<HashMap<SocketAddr, u16>>>,
        is_private: bool,
    ) -> PipelineHandle {
        let stop_flag = Arc::new(AtomicBool::new(false));
        let thread_stop = stop_flag.clone();
        let (done_tx, done_rx) = crossbeam_channel::bounded::<()>(1);
        let join = std::thread::spawn(move || {
            let mut socket = socket;
            let mut seq: u32 = 0;
            debug!(is_private, "capture-send pipeline started");
            while !thread_stop.load(Ordering::Relaxed) {
                let frame = match capture.read_frame() {
                    Some(f) => f,
                    None => continue,
                };
                let targets: Vec<(SocketAddr, u16)> = {
                    let guard = destinations.lock().unwrap();
                    guard.iter().map(|(addr, port)| (*addr, *port)).collect()
                };
                if targets.is_empty() {
                    seq = seq.wrapping_add(1);
                    continue;
                }
                let mut datagram = Vec::with_capacity(4 + frame.as_bytes().len());
                datagram.extend_from_slice(&seq.to_be_bytes());
                datagram.extend_from_slice(frame.as_bytes());
                for (addr, port) in targets {
                    let dest = SocketAddr::new(addr.ip(), port);
                    if socket.send_to(&datagram, dest).is_err() {
                        match re_resolve(dest) {
                            Some(resolved) => {
                                if socket.send_to(&datagram, resolved).is_err() {
                                    socket = rebind_or_keep(socket);
                                }
                            }
                            None => warn!(%dest, "could not re-resolve call destination"),
                        }
                    }
                }
                seq = seq.wrapping_add(1);
            }
            debug!(is_private, "capture-send pipeline stopped");
            let _ = done_tx.send(());
        });
        PipelineHandle {
            stop_flag,
            join: Some(join),
            completion_rx: done_rx,
        }
    }
}

fn re_resolve(dest: SocketAddr) -> Option<SocketAddr> {
    dest.to_socket_addrs().ok()?.next()
}

fn rebind_or_keep(old: UdpSocket) -> UdpSocket {
    match UdpSocket::bind("0.0.0.0:0") {
        Ok(fresh) => {
            warn!("rebound outbound call socket after send failure");
            fresh
        }
        Err(e) => {
            warn!(error = %e, "failed to rebind outbound call socket, keeping old one");
            old
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::AudioFrame;
    use std::sync::atomic::AtomicUsize;

    struct CountingCapture {
        remaining: usize,
        produced: Arc<AtomicUsize>,
    }

    impl CaptureSource for CountingCapture {
        fn read_frame(&mut self) -> Option<AudioFrame> {
            if self.remaining == 0 {
                std::thread::sleep(std::time::Duration::from_millis(1));
                return None;
            }
            self.remaining -= 1;
            self.produced.fetch_add(1, Ordering::SeqCst);
            Some(AudioFrame::silence())
        }
    }

    #[test]
    fn stop_joins_thread_with_no_destinations() {
        let produced = Arc::new(AtomicUsize::new(0));
        let capture = Box::new(CountingCapture {
            remaining: 5,
            produced: produced.clone(),
        });
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let destinations = Arc::new(Mutex::new(HashMap::new()));
        let handle = CaptureSendPipeline::spawn(capture, socket, destinations, true);
        std::thread::sleep(std::time::Duration::from_millis(20));
        handle.stop();
        assert!(produced.load(Ordering::SeqCst) >= 5);
    }

    #[test]
    fn sends_sequence_prefixed_datagram_to_registered_destination() {
        let recv_sock = UdpSocket::bind("127.0.0.1:0").unwrap();
        recv_sock
            .set_read_timeout(Some(std::time::Duration::from_millis(200)))
            .unwrap();
        let recv_addr = recv_sock.local_addr().unwrap();

        let produced = Arc::new(AtomicUsize::new(0));
        let capture = Box::new(CountingCapture {
            remaining: 1,
            produced: produced.clone(),
        });
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let mut dest_map = HashMap::new();
        dest_map.insert(recv_addr, recv_addr.port());
        let destinations = Arc::new(Mutex::new(dest_map));
        let handle = CaptureSendPipeline::spawn(capture, socket, destinations, true);

        let mut buf = [0u8; 1024];
        let (n, _) = recv_sock.recv_from(&mut buf).unwrap();
        handle.stop();

        assert_eq!(n, 4 + crate::audio::FRAME_BYTES);
        assert_eq!(&buf[0..4], &0u32.to_be_bytes());
    }
}
