//! Voice-note transfer (C5): a short-lived TCP push of one WAV file,
//! opaque to this crate beyond its length, to a peer's voice-note
//! listener.
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::net::{IpAddr, SocketAddr, TcpStream};
use std::path::Path;

use tracing::info;

use crate::config::VOICE_NOTE_PORT;
use crate::error::{VoxError, VoxResult};

const CHUNK_SIZE: usize = 4096;

/// Push `file_path` to `recipient_ip` on the fixed voice-note port.
///
/// Envelope: `has_sender:1 | [sender name, length-prefixed UTF-8] |
/// file_len:8 (big-endian) | payload`. Returns `Ok(true)` once the whole
/// payload has been written and flushed.
pub fn send_voice_note(
    recipient_ip: IpAddr,
    sender_name: Option<&str>,
    file_path: &Path,
) -> VoxResult<bool> {
    let file = File::open(file_path).map_err(VoxError::NetworkTransient)?;
    let file_len = file
        .metadata()
        .map_err(VoxError::NetworkTransient)?
        .len();
    let mut reader = BufReader::new(file);

    let addr = SocketAddr::new(recipient_ip, VOICE_NOTE_PORT);
    let mut stream = TcpStream::connect(addr).map_err(VoxError::NetworkTransient)?;

    match sender_name {
        Some(name) => {
            stream.write_all(&[1u8]).map_err(VoxError::NetworkTransient)?;
            let name_bytes = name.as_bytes();
            stream
                .write_all(&(name_bytes.len() as u32).to_be_bytes())
                .map_err(VoxError::NetworkTransient)?;
            stream.write_all(name_bytes).map_err(VoxError::NetworkTransient)?;
        }
        None => {
            stream.write_all(&[0u8]).map_err(VoxError::NetworkTransient)?;
        }
    }
    stream
        .write_all(&file_len.to_be_bytes())
        .map_err(VoxError::NetworkTransient)?;

    let mut chunk = [0u8; CHUNK_SIZE];
    loop {
        let n = reader.read(&mut chunk).map_err(VoxError::NetworkTransient)?;
        if n == 0 {
            break;
        }
        stream
            .write_all(&chunk[..n])
            .map_err(VoxError::NetworkTransient)?;
    }
    stream.flush().map_err(VoxError::NetworkTransient)?;
    stream.shutdown(std::net::Shutdown::Write).ok();
    info!(%addr, bytes = file_len, "voice note sent");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use std::net::{TcpListener, TcpStream as StdTcpStream};

    #[test]
    fn envelope_with_sender_round_trips_over_a_raw_socket() {
        // Exercise the same write sequence send_voice_note uses, against a
        // manual reader, without going through the fixed VOICE_NOTE_PORT.
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = std::thread::spawn(move || {
            let mut stream: StdTcpStream = StdTcpStream::connect(addr).unwrap();
            stream.write_all(&[1u8]).unwrap();
            stream.write_all(&5u32.to_be_bytes()).unwrap();
            stream.write_all(b"alice").unwrap();
            stream.write_all(&3u64.to_be_bytes()).unwrap();
            stream.write_all(b"abc").unwrap();
        });
        let (mut conn, _) = listener.accept().unwrap();
        let mut has_sender = [0u8; 1];
        conn.read_exact(&mut has_sender).unwrap();
        assert_eq!(has_sender[0], 1);
        let mut len_buf = [0u8; 4];
        conn.read_exact(&mut len_buf).unwrap();
        let name_len = u32::from_be_bytes(len_buf) as usize;
        let mut name_buf = vec![0u8; name_len];
        conn.read_exact(&mut name_buf).unwrap();
        assert_eq!(String::from_utf8(name_buf).unwrap(), "alice");
        let mut file_len_buf = [0u8; 8];
        conn.read_exact(&mut file_len_buf).unwrap();
        assert_eq!(u64::from_be_bytes(file_len_buf), 3);
        let mut payload = vec![0u8; 3];
        conn.read_exact(&mut payload).unwrap();
        assert_eq!(payload, b"abc");
        handle.join().unwrap();
    }

    #[test]
    fn send_voice_note_errors_on_missing_file() {
        let err = send_voice_note(
            "127.0.0.1".parse().unwrap(),
            Some("alice"),
            Path::new("/nonexistent/path/to/note.wav"),
        )
        .unwrap_err();
        assert!(matches!(err, VoxError::NetworkTransient(_)));
    }
}
