//! Thin CLI driver: selects server or client mode and marshals stdin
//! lines / server events onto stdout.
//! The actual control/media substrate lives in the library modules below.
mod audio;
mod call;
mod capture_send;
mod client;
mod config;
mod error;
mod jitter;
mod net;
mod protocol;
mod receive_play;
mod server;
mod types;
mod voicenote;
mod voicenote_listener;

use std::io::BufRead;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use config::{Cli, Commands, RECEIVED_VOICE_NOTES_DIR};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Server { bind, port } => run_server(&bind, port),
        Commands::Client {
            server,
            port,
            name,
            voice_note_port,
        } => run_client(&server, port, &name, voice_note_port),
    }
}

fn run_server(bind: &str, port: u16) -> Result<()> {
    let state = server::ServerState::new();
    server::run(bind, port, state).context("control server exited")
}

fn run_client(server_ip: &str, port: u16, name: &str, voice_note_port: u16) -> Result<()> {
    let local_ip = net::detect_local_ip().context("detecting local claimed IP")?;
    tracing::info!(%local_ip, "detected local address");

    let (state, events) = client::connect(server_ip, port, name, local_ip)?;

    let out_dir = PathBuf::from(RECEIVED_VOICE_NOTES_DIR);
    let listener = voicenote_listener::VoiceNoteListener::bind(voice_note_port, out_dir)
        .context("binding voice note listener")?;
    tracing::info!(port = listener.local_port(), "voice note listener ready");

    std::thread::spawn(move || {
        for event in events.iter() {
            print_event(&event);
        }
    });

    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = line.context("reading stdin")?;
        if line.trim() == "/exit" {
            state.disconnect();
            break;
        }
        if let Err(e) = dispatch_input(&state, &line) {
            eprintln!("error: {e}");
        }
    }

    listener.stop();
    Ok(())
}

/// Parse one line of operator input into the matching client-engine call.
/// This mirrors the wire directives one-for-one; it is not itself part of
/// the protocol, only the CLI's own command surface.
fn dispatch_input(state: &std::sync::Arc<client::ClientState>, line: &str) -> Result<()> {
    if let Some(rest) = line.strip_prefix("Call ") {
        let target = if rest.eq_ignore_ascii_case("global") {
            call::CallTargetName::Global
        } else if state.groups.contains_key(rest) {
            call::CallTargetName::Group(rest.to_string())
        } else {
            call::CallTargetName::Peer(rest.to_string())
        };
        state.start_call(target)?;
    } else if line == "CALL ENDED" {
        state.end_call()?;
    } else if let Some(rest) = line.strip_prefix("/creategroup@") {
        if let Some((name, csv)) = rest.split_once('-') {
            let members = if csv.is_empty() {
                Vec::new()
            } else {
                csv.split(',').map(|m| m.to_string()).collect()
            };
            state.create_group(name, members)?;
        }
    } else if let Some(rest) = line.strip_prefix("/groupmsg@") {
        if let Some((group, msg)) = rest.split_once('-') {
            state.send_group_message(group, msg)?;
        }
    } else if let Some(rest) = line.strip_prefix("/voicenote ") {
        *state.selected_voice_note.lock().unwrap() = Some(PathBuf::from(rest));
    } else if let Some(rest) = line.strip_prefix("/sendnote ") {
        let scope = if rest.eq_ignore_ascii_case("@Global") {
            protocol::IpScope::Global
        } else if let Some(group) = rest.strip_prefix('@') {
            protocol::IpScope::Group(group.to_string())
        } else {
            protocol::IpScope::Peer(rest.to_string())
        };
        state.request_voice_note_ips(scope)?;
    } else if let Some(rest) = line.strip_prefix('@') {
        if let Some((to, msg)) = rest.split_once(' ') {
            state.send_whisper(to, msg)?;
        }
    } else {
        state.send_chat(line)?;
    }
    Ok(())
}

fn print_event(event: &client::ClientEvent) {
    use client::ClientEvent::*;
    match event {
        Online(names) => println!("ONLINE:{}", names.join(",")),
        Leaving(name) => println!("LEAVING: {name}"),
        GlobalChat { from, msg } => println!("{from}: {msg}"),
        Whisper { from, msg } => println!("Whisper from {from}: {msg}"),
        JoinedGroup { name, members } => println!("Join Group: @{name}-{}", members.join(",")),
        GroupMessage { sender, group, msg } => {
            println!("Group message from /{sender}: @{group}-{msg}")
        }
        ReceivedIps { ips, scope } => {
            let csv: Vec<String> = ips.iter().map(|ip| ip.to_string()).collect();
            println!("receivedIPs voicenote:{}@{}", csv.join(","), scope);
        }
        CallStarted => println!("-- call connected --"),
        CallEnded(who) => println!("CALL ENDED:{who}"),
        VoiceNoteSent { recipient } => println!("-- voice note delivered to {recipient} --"),
        VoiceNoteFailed { recipient, reason } => {
            println!("-- voice note to {recipient} failed: {reason} --")
        }
        Disconnected => println!("-- disconnected from server --"),
    }
}
