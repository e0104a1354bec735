//! Fixed ports, wire constants and the CLI surface.
//!
//! The CLI is intentionally thin: it only selects server/client mode and
//! lets local testing override the otherwise-fixed ports.
use clap::{Parser, Subcommand};

/// Control-plane TCP port.
pub const CONTROL_PORT: u16 = 1235;
/// First UDP media port handed out by the call coordinator.
pub const MEDIA_PORT_BASE: u16 = 5001;
/// Voice-note TCP push port.
pub const VOICE_NOTE_PORT: u16 = 9786;

/// Jitter window size for a private call.
pub const JITTER_WINDOW_PRIVATE: usize = 10;
/// Jitter window size for a group/global call.
pub const JITTER_WINDOW_GROUP: usize = 5;

/// UDP receive poll timeout.
pub const UDP_RECV_TIMEOUT_MS: u64 = 10;
/// Bound on joining sender/receiver pipeline threads during call teardown.
pub const CALL_TEARDOWN_JOIN_MS: u64 = 1_000;

/// Directory voice notes are persisted into.
pub const RECEIVED_VOICE_NOTES_DIR: &str = "received_voice_notes";

#[derive(Debug, Parser)]
#[command(name = "voxhub", about = "Hub-and-spoke VoIP chat core")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the control-plane server (session registry + call coordinator).
    Server {
        /// Address to bind the control-plane TCP listener on.
        #[arg(long, default_value = "0.0.0.0")]
        bind: String,
        #[arg(long, default_value_t = CONTROL_PORT)]
        port: u16,
    },
    /// Connect to a server as a named client.
    Client {
        #[arg(long)]
        server: String,
        #[arg(long, default_value_t = CONTROL_PORT)]
        port: u16,
        #[arg(long)]
        name: String,
        /// Port the voice-note listener binds locally.
        #[arg(long, default_value_t = VOICE_NOTE_PORT)]
        voice_note_port: u16,
    },
}
