//! Voice-note listener (C6): accepts voice-note pushes, validates the
//! envelope, and persists each payload atomically under the received
//! voice-notes directory.
use std::fs::{self, File};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{info, warn};

use crate::error::{VoxError, VoxResult};

/// Reject envelopes claiming zero bytes or more than 2 GiB.
const MAX_VOICE_NOTE_BYTES: u64 = 2 * 1024 * 1024 * 1024;

pub struct VoiceNoteListener {
    local_port: u16,
    stop_flag: Arc<AtomicBool>,
    accept_join: Option<std::thread::JoinHandle<()>>,
}

impl VoiceNoteListener {
    pub fn bind(port: u16, out_dir: PathBuf) -> VoxResult<Self> {
        fs::create_dir_all(&out_dir).map_err(VoxError::NetworkTransient)?;
        let listener =
            TcpListener::bind(("0.0.0.0", port)).map_err(VoxError::NetworkTransient)?;
        let local_port = listener.local_addr().map_err(VoxError::NetworkTransient)?.port();
        listener
            .set_nonblocking(true)
            .map_err(VoxError::NetworkTransient)?;
        let stop_flag = Arc::new(AtomicBool::new(false));
        let thread_stop = stop_flag.clone();
        let counter = Arc::new(AtomicU64::new(0));
        let accept_join = std::thread::spawn(move || {
            info!(port, "voice note listener started");
            while !thread_stop.load(Ordering::Relaxed) {
                match listener.accept() {
                    Ok((stream, peer)) => {
                        let dir = out_dir.clone();
                        let id = counter.fetch_add(1, Ordering::Relaxed);
                        std::thread::spawn(move || {
                            if let Err(e) = handle_connection(stream, &dir, id) {
                                warn!(%peer, error = %e, "voice note transfer failed");
                            }
                        });
                    }
                    Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        std::thread::sleep(std::time::Duration::from_millis(20));
                    }
                    Err(e) => {
                        warn!(error = %e, "voice note accept failed");
                    }
                }
            }
            info!("voice note listener stopped");
        });
        Ok(Self {
            local_port,
            stop_flag,
            accept_join: Some(accept_join),
        })
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn stop(mut self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        if let Some(j) = self.accept_join.take() {
            let _ = j.join();
        }
    }
}

fn handle_connection(mut stream: TcpStream, out_dir: &Path, conn_id: u64) -> VoxResult<()> {
    stream
        .set_nonblocking(false)
        .map_err(VoxError::NetworkTransient)?;

    let mut has_sender = [0u8; 1];
    stream
        .read_exact(&mut has_sender)
        .map_err(VoxError::NetworkTransient)?;

    let sender_name = if has_sender[0] != 0 {
        let mut len_buf = [0u8; 4];
        stream
            .read_exact(&mut len_buf)
            .map_err(VoxError::NetworkTransient)?;
        let name_len = u32::from_be_bytes(len_buf) as usize;
        let mut name_buf = vec![0u8; name_len];
        stream
            .read_exact(&mut name_buf)
            .map_err(VoxError::NetworkTransient)?;
        Some(
            String::from_utf8(name_buf)
                .map_err(|e| VoxError::ProtocolViolation(e.to_string()))?,
        )
    } else {
        None
    };

    let mut len_buf = [0u8; 8];
    stream
        .read_exact(&mut len_buf)
        .map_err(VoxError::NetworkTransient)?;
    let file_len = u64::from_be_bytes(len_buf);
    if file_len == 0 || file_len > MAX_VOICE_NOTE_BYTES {
        return Err(VoxError::ProtocolViolation(format!(
            "invalid voice note length: {file_len}"
        )));
    }

    let stem = sender_name.as_deref().unwrap_or("unknown");
    let staging_path = out_dir.join(format!(".incoming-{conn_id}"));
    let mut staging = File::create(&staging_path).map_err(VoxError::NetworkTransient)?;

    let mut remaining = file_len;
    let mut buf = [0u8; 4096];
    while remaining > 0 {
        let want = buf.len().min(remaining as usize);
        stream
            .read_exact(&mut buf[..want])
            .map_err(VoxError::NetworkTransient)?;
        staging
            .write_all(&buf[..want])
            .map_err(VoxError::NetworkTransient)?;
        remaining -= want as u64;
    }
    staging.flush().map_err(VoxError::NetworkTransient)?;
    drop(staging);

    let unix_ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let final_path = out_dir.join(format!("{stem}-{unix_ts}.wav"));
    fs::rename(&staging_path, &final_path).map_err(VoxError::NetworkTransient)?;
    info!(path = %final_path.display(), bytes = file_len, "voice note received");
    Ok(())
}
