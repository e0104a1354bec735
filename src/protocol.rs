//! Line-oriented control protocol codec (C7): parses/formats every
//! directive using the exact literal prefixes and split points the wire
//! format freezes.
use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;

use crate::error::{VoxError, VoxResult};

/// Directives a client sends to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientDirective {
    /// Raw text with no recognized prefix: a global chat broadcast.
    GlobalChat(String),
    /// `@<name> <msg>`
    Whisper { to: String, msg: String },
    /// `/creategroup@<name>-<csv-members>`
    CreateGroup { name: String, members: Vec<String> },
    /// `/groupmsg@<name>-<msg>`
    GroupMessage { group: String, msg: String },
    /// `/getIps @Global` / `/getIps @<group>` / `/getIps <peer>`
    GetIps(IpScope),
    /// `Call <target>`
    Call(String),
    /// `CALL ENDED: <target>`
    CallEnded(String),
    /// `/exit`
    Exit,
}

/// Scope argument of `/getIps`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IpScope {
    Global,
    Group(String),
    Peer(String),
}

impl std::fmt::Display for IpScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IpScope::Global => write!(f, "@Global"),
            IpScope::Group(name) => write!(f, "@{name}"),
            IpScope::Peer(name) => write!(f, "{name}"),
        }
    }
}

impl IpScope {
    /// The scope name alone, without the `/getIps` directive's leading `@`
    /// — this is what goes after the `@` separator in a
    /// `receivedIPs voicenote:...@<scope>` response (spec.md §4.7), which
    /// is a different position than the one `Display` renders for.
    pub fn bare_name(&self) -> &str {
        match self {
            IpScope::Global => "Global",
            IpScope::Group(name) | IpScope::Peer(name) => name,
        }
    }
}

impl ClientDirective {
    pub fn parse(line: &str) -> ClientDirective {
        if line == "/exit" {
            return ClientDirective::Exit;
        }
        if let Some(rest) = line.strip_prefix("CALL ENDED: ") {
            return ClientDirective::CallEnded(rest.to_string());
        }
        if let Some(rest) = line.strip_prefix("Call ") {
            return ClientDirective::Call(rest.to_string());
        }
        if let Some(rest) = line.strip_prefix("/getIps ") {
            let scope = if rest == "@Global" {
                IpScope::Global
            } else if let Some(group) = rest.strip_prefix('@') {
                IpScope::Group(group.to_string())
            } else {
                IpScope::Peer(rest.to_string())
            };
            return ClientDirective::GetIps(scope);
        }
        if let Some(rest) = line.strip_prefix("/creategroup@") {
            if let Some((name, csv)) = rest.split_once('-') {
                let members = split_csv(csv);
                return ClientDirective::CreateGroup {
                    name: name.to_string(),
                    members,
                };
            }
        }
        if let Some(rest) = line.strip_prefix("/groupmsg@") {
            if let Some((name, msg)) = rest.split_once('-') {
                return ClientDirective::GroupMessage {
                    group: name.to_string(),
                    msg: msg.to_string(),
                };
            }
        }
        if let Some(rest) = line.strip_prefix('@') {
            if let Some((name, msg)) = rest.split_once(' ') {
                return ClientDirective::Whisper {
                    to: name.to_string(),
                    msg: msg.to_string(),
                };
            }
        }
        ClientDirective::GlobalChat(line.to_string())
    }
}

impl std::fmt::Display for ClientDirective {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientDirective::GlobalChat(msg) => write!(f, "{msg}"),
            ClientDirective::Whisper { to, msg } => write!(f, "@{to} {msg}"),
            ClientDirective::CreateGroup { name, members } => {
                write!(f, "/creategroup@{name}-{}", members.join(","))
            }
            ClientDirective::GroupMessage { group, msg } => {
                write!(f, "/groupmsg@{group}-{msg}")
            }
            ClientDirective::GetIps(scope) => write!(f, "/getIps {scope}"),
            ClientDirective::Call(target) => write!(f, "Call {target}"),
            ClientDirective::CallEnded(target) => write!(f, "CALL ENDED: {target}"),
            ClientDirective::Exit => write!(f, "/exit"),
        }
    }
}

/// Directives the server sends to a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerDirective {
    /// `ONLINE:<csv-names>`
    Online(Vec<String>),
    /// `LEAVING: <name>`
    Leaving(String),
    /// `Whisper from <name>: <msg>`
    Whisper { from: String, msg: String },
    /// `Join Group: @<name>-<csv-members>`
    JoinGroup { name: String, members: Vec<String> },
    /// `Group message from /<sender>: @<group>-<msg>`
    GroupMessage {
        sender: String,
        group: String,
        msg: String,
    },
    /// `receivedIPs voicenote:<csv-ips>@<scope>`
    ReceivedIps { ips: Vec<String>, scope: String },
    /// `CALL ACCEPTED (private): <peer_ip>:<port>:<peer_name>`
    CallAcceptedPrivate {
        peer_ip: String,
        port: u16,
        peer_name: String,
    },
    /// `CALL ACCEPTED (global): <csv of ip: port>`
    CallAcceptedGlobal(Vec<(String, u16)>),
    /// `CALL ENDED:<name>`
    CallEnded(String),
    /// `terminate`
    Terminate,
}

impl ServerDirective {
    pub fn parse(line: &str) -> VoxResult<ServerDirective> {
        if line == "terminate" {
            return Ok(ServerDirective::Terminate);
        }
        if let Some(rest) = line.strip_prefix("ONLINE:") {
            return Ok(ServerDirective::Online(split_csv(rest)));
        }
        if let Some(rest) = line.strip_prefix("LEAVING: ") {
            return Ok(ServerDirective::Leaving(rest.to_string()));
        }
        if let Some(rest) = line.strip_prefix("Whisper from ") {
            if let Some((from, msg)) = rest.split_once(": ") {
                return Ok(ServerDirective::Whisper {
                    from: from.to_string(),
                    msg: msg.to_string(),
                });
            }
        }
        if let Some(rest) = line.strip_prefix("Join Group: @") {
            if let Some((name, csv)) = rest.split_once('-') {
                return Ok(ServerDirective::JoinGroup {
                    name: name.to_string(),
                    members: split_csv(csv),
                });
            }
        }
        if let Some(rest) = line.strip_prefix("Group message from /") {
            if let Some((sender, tail)) = rest.split_once(": @") {
                if let Some((group, msg)) = tail.split_once('-') {
                    return Ok(ServerDirective::GroupMessage {
                        sender: sender.to_string(),
                        group: group.to_string(),
                        msg: msg.to_string(),
                    });
                }
            }
        }
        if let Some(rest) = line.strip_prefix("receivedIPs voicenote:") {
            if let Some((csv, scope)) = rest.split_once('@') {
                return Ok(ServerDirective::ReceivedIps {
                    ips: split_csv(csv),
                    scope: scope.to_string(),
                });
            }
        }
        if let Some(rest) = line.strip_prefix("CALL ACCEPTED (private): ") {
            let parts: Vec<&str> = rest.splitn(3, ':').collect();
            if parts.len() == 3 {
                if let Ok(port) = parts[1].parse::<u16>() {
                    return Ok(ServerDirective::CallAcceptedPrivate {
                        peer_ip: parts[0].to_string(),
                        port,
                        peer_name: parts[2].to_string(),
                    });
                }
            }
        }
        if let Some(rest) = line.strip_prefix("CALL ACCEPTED (global): ") {
            let mut members = Vec::new();
            for entry in rest.split(',') {
                let entry = entry.trim();
                if let Some((ip, port)) = entry.rsplit_once(':') {
                    if let Ok(port) = port.trim().parse::<u16>() {
                        members.push((ip.trim().to_string(), port));
                    }
                }
            }
            return Ok(ServerDirective::CallAcceptedGlobal(members));
        }
        if let Some(rest) = line.strip_prefix("CALL ENDED:") {
            return Ok(ServerDirective::CallEnded(rest.to_string()));
        }
        Err(VoxError::ProtocolViolation(line.to_string()))
    }
}

impl std::fmt::Display for ServerDirective {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerDirective::Online(names) => write!(f, "ONLINE:{}", names.join(",")),
            ServerDirective::Leaving(name) => write!(f, "LEAVING: {name}"),
            ServerDirective::Whisper { from, msg } => write!(f, "Whisper from {from}: {msg}"),
            ServerDirective::JoinGroup { name, members } => {
                write!(f, "Join Group: @{name}-{}", members.join(","))
            }
            ServerDirective::GroupMessage { sender, group, msg } => {
                write!(f, "Group message from /{sender}: @{group}-{msg}")
            }
            ServerDirective::ReceivedIps { ips, scope } => {
                write!(f, "receivedIPs voicenote:{}@{}", ips.join(","), scope)
            }
            ServerDirective::CallAcceptedPrivate {
                peer_ip,
                port,
                peer_name,
            } => write!(f, "CALL ACCEPTED (private): {peer_ip}:{port}:{peer_name}"),
            ServerDirective::CallAcceptedGlobal(members) => {
                let csv: Vec<String> = members.iter().map(|(ip, p)| format!("{ip}:{p}")).collect();
                write!(f, "CALL ACCEPTED (global): {}", csv.join(","))
            }
            ServerDirective::CallEnded(name) => write!(f, "CALL ENDED:{name}"),
            ServerDirective::Terminate => write!(f, "terminate"),
        }
    }
}

fn split_csv(s: &str) -> Vec<String> {
    if s.is_empty() {
        return Vec::new();
    }
    s.split(',').map(|p| p.to_string()).collect()
}

/// `\n`-delimited line reader/writer shared by both server and client
/// sides of the control connection.
pub struct LineCodec {
    reader: BufReader<TcpStream>,
}

impl LineCodec {
    pub fn new(stream: TcpStream) -> VoxResult<Self> {
        let reader = BufReader::new(stream.try_clone()?);
        Ok(Self { reader })
    }

    /// Read one `\n`-terminated line, trimmed. Returns `Ok(None)` on EOF.
    pub fn read_line(&mut self) -> VoxResult<Option<String>> {
        let mut buf = String::new();
        let n = self.reader.read_line(&mut buf)?;
        if n == 0 {
            return Ok(None);
        }
        Ok(Some(buf.trim_end_matches(['\n', '\r']).to_string()))
    }
}

/// Write one `\n`-terminated line to a raw stream.
pub fn write_line(stream: &mut TcpStream, line: &str) -> VoxResult<()> {
    stream.write_all(line.as_bytes())?;
    stream.write_all(b"\n")?;
    Ok(())
}
