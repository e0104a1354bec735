//! Call Coordinator (C10): server-side port allocation plus the
//! client-local call session tagged union and its state machine.
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tracing::warn;

use crate::config::{CALL_TEARDOWN_JOIN_MS, MEDIA_PORT_BASE};

/// What a `Call <target>` directive refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallTarget {
    Global,
    Group(String),
    Peer(String),
}

/// Deterministic port assignment handed back to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortPlan {
    /// `(target_port, initiator_port)` — target gets 5001, initiator 5002.
    Private { target_port: u16, initiator_port: u16 },
    /// Every member of the group/global call, in registry order, each given
    /// a port starting at `MEDIA_PORT_BASE` incrementing by one.
    Fanout(Vec<(String, SocketAddr, u16)>),
}

/// Assign ports for a call. `members` is every other party in registry
/// order (for `Private`, exactly one entry — the target).
pub fn allocate_ports(target: &CallTarget, members: &[(String, SocketAddr)]) -> Option<PortPlan> {
    match target {
        CallTarget::Peer(_) => {
            let (_, _addr) = members.first()?;
            Some(PortPlan::Private {
                target_port: MEDIA_PORT_BASE,
                initiator_port: MEDIA_PORT_BASE + 1,
            })
        }
        CallTarget::Group(_) | CallTarget::Global => {
            if members.is_empty() {
                return None;
            }
            let fanout = members
                .iter()
                .enumerate()
                .map(|(i, (name, addr))| (name.clone(), *addr, MEDIA_PORT_BASE + i as u16))
                .collect();
            Some(PortPlan::Fanout(fanout))
        }
    }
}

/// Error surfaced when a call cannot be set up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallSetupError {
    /// Calling one's own name is rejected outright rather than silently
    /// permitted.
    SelfCall,
}

/// Reject a call whose target is the initiator's own name.
pub fn validate_target(initiator: &str, target: &CallTarget) -> Result<(), CallSetupError> {
    if let CallTarget::Peer(name) = target {
        if name == initiator {
            return Err(CallSetupError::SelfCall);
        }
    }
    Ok(())
}

/// Client-local call session, a tagged union: at most one of these can be
/// "in call" at a time, which this type makes a structural invariant rather
/// than a convention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallSession {
    None,
    Pending {
        target: CallTargetName,
        since: InstantTag,
    },
    Private {
        peer: String,
        remote_addr: SocketAddr,
        remote_port: u16,
        local_port: u16,
    },
    Group {
        members: HashMap<SocketAddr, u16>,
        local_port: u16,
    },
    Global {
        members: HashMap<SocketAddr, u16>,
        local_port: u16,
    },
}

/// `CallTarget` without address info, kept around while in `Pending`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallTargetName {
    Global,
    Group(String),
    Peer(String),
}

/// `Instant` does not implement `PartialEq`/`Eq` meaningfully for our
/// purposes; this wrapper only needs to exist, not be compared, so it
/// compares equal to itself always (used solely for the `Pending` variant's
/// "how long have we been waiting" bookkeeping — see CallEngine::pending_since).
#[derive(Debug, Clone, Copy)]
pub struct InstantTag(pub Instant);
impl PartialEq for InstantTag {
    fn eq(&self, _other: &Self) -> bool {
        true
    }
}
impl Eq for InstantTag {}

/// Events driving the client-local call state machine.
#[derive(Debug, Clone)]
pub enum CallEvent {
    RequestCall(CallTargetName),
    Accepted(CallSession),
    LocalStop,
    RemoteEnded,
}

/// Actions the caller (client control engine) must perform in response to
/// a transition, beyond updating the stored `CallSession`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallAction {
    SendCall(CallTargetName),
    TeardownThenPending(CallTargetName),
    EmitCallEnded,
    TeardownOnly,
    None,
}

/// Drives `CallSession` transitions per the state diagram.
/// Every transition that leaves `InCall` (any of `Private`/`Group`/`Global`)
/// returns a teardown action before a new state is ever installed, so a
/// caller that honors the returned action can never observe two live call
/// sessions.
pub struct CallEngine {
    state: CallSession,
}

impl CallEngine {
    pub fn new() -> Self {
        Self {
            state: CallSession::None,
        }
    }

    pub fn state(&self) -> &CallSession {
        &self.state
    }

    /// How long the engine has been waiting for a `CALL ACCEPTED` reply, if
    /// it is currently `Pending`. Exposed so a caller could add a UI-level
    /// timeout later; no such timeout exists on the wire today, so this
    /// crate does not invent one.
    pub fn pending_since(&self) -> Option<Instant> {
        match &self.state {
            CallSession::Pending { since, .. } => Some(since.0),
            _ => None,
        }
    }

    pub fn is_in_call(&self) -> bool {
        matches!(
            self.state,
            CallSession::Private { .. } | CallSession::Group { .. } | CallSession::Global { .. }
        )
    }

    pub fn transition(&mut self, event: CallEvent) -> CallAction {
        match (&self.state, event) {
            (CallSession::None, CallEvent::RequestCall(target)) => {
                self.state = CallSession::Pending {
                    target: target.clone(),
                    since: InstantTag(Instant::now()),
                };
                CallAction::SendCall(target)
            }
            (CallSession::Pending { .. }, CallEvent::Accepted(session)) => {
                self.state = session;
                CallAction::None
            }
            (CallSession::None, CallEvent::Accepted(session)) => {
                // Callee path: we never sent a `Call` directive ourselves, so
                // we are still `None` when the server's `CALL ACCEPTED`
                // arrives. Idle -> InCall directly.
                self.state = session;
                CallAction::None
            }
            (
                CallSession::Private { .. } | CallSession::Group { .. } | CallSession::Global { .. },
                CallEvent::RequestCall(target),
            ) => {
                // InCall -> Call<other>: teardown old, then Pending.
                self.state = CallSession::Pending {
                    target: target.clone(),
                    since: InstantTag(Instant::now()),
                };
                CallAction::TeardownThenPending(target)
            }
            (
                CallSession::Private { .. } | CallSession::Group { .. } | CallSession::Global { .. },
                CallEvent::LocalStop,
            ) => {
                self.state = CallSession::None;
                CallAction::EmitCallEnded
            }
            (
                CallSession::Private { .. } | CallSession::Group { .. } | CallSession::Global { .. },
                CallEvent::RemoteEnded,
            ) => {
                self.state = CallSession::None;
                CallAction::TeardownOnly
            }
            (CallSession::Pending { .. }, CallEvent::RemoteEnded) => {
                self.state = CallSession::None;
                CallAction::None
            }
            (state, event) => {
                warn!(?state, ?event, "ignored call event in current state");
                CallAction::None
            }
        }
    }
}

impl Default for CallEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Wait for a pipeline's completion signal up to a bounded window, logging
/// (not panicking) if it is exceeded — the thread is cooperative and will
/// exit on its own once its stop flag is observed, even if that happens
/// after this call returns. Returns whether the signal arrived in time;
/// callers use this to decide whether joining the underlying `JoinHandle`
/// is safe to do without blocking past the bound.
pub fn join_with_teardown_bound(
    label: &'static str,
    completion_rx: crossbeam_channel::Receiver<()>,
) -> bool {
    let completed = completion_rx
        .recv_timeout(Duration::from_millis(CALL_TEARDOWN_JOIN_MS))
        .is_ok();
    if !completed {
        warn!(pipeline = label, "teardown join exceeded 1s bound");
    }
    completed
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn allocate_ports_private_gives_target_lower_port() {
        let members = vec![("bob".to_string(), "10.0.0.2:1235".parse().unwrap())];
        let plan = allocate_ports(&CallTarget::Peer("bob".into()), &members).unwrap();
        assert_eq!(
            plan,
            PortPlan::Private {
                target_port: 5001,
                initiator_port: 5002
            }
        );
    }

    #[test]
    fn allocate_ports_fanout_increments_from_base() {
        let members = vec![
            ("a".to_string(), "10.0.0.2:1235".parse().unwrap()),
            ("b".to_string(), "10.0.0.3:1235".parse().unwrap()),
            ("c".to_string(), "10.0.0.4:1235".parse().unwrap()),
        ];
        let plan = allocate_ports(&CallTarget::Global, &members).unwrap();
        match plan {
            PortPlan::Fanout(entries) => {
                let ports: Vec<u16> = entries.iter().map(|(_, _, p)| *p).collect();
                assert_eq!(ports, vec![5001, 5002, 5003]);
            }
            _ => panic!("expected fanout plan"),
        }
    }

    #[test]
    fn allocate_ports_empty_group_is_none() {
        assert!(allocate_ports(&CallTarget::Group("devs".into()), &[]).is_none());
    }

    #[test]
    fn self_call_is_rejected() {
        let err = validate_target("alice", &CallTarget::Peer("alice".into())).unwrap_err();
        assert_eq!(err, CallSetupError::SelfCall);
        assert!(validate_target("alice", &CallTarget::Peer("bob".into())).is_ok());
    }

    #[test]
    fn call_singularity_only_one_in_call_state_at_a_time() {
        let mut engine = CallEngine::new();
        assert!(!engine.is_in_call());
        engine.transition(CallEvent::RequestCall(CallTargetName::Peer("bob".into())));
        assert!(!engine.is_in_call());
        engine.transition(CallEvent::Accepted(CallSession::Private {
            peer: "bob".into(),
            remote_addr: "10.0.0.2:5001".parse().unwrap(),
            remote_port: 5001,
            local_port: 5002,
        }));
        assert!(engine.is_in_call());

        // InCall -> Call<other> must tear down before re-entering Pending.
        let action = engine.transition(CallEvent::RequestCall(CallTargetName::Peer("carol".into())));
        assert_eq!(
            action,
            CallAction::TeardownThenPending(CallTargetName::Peer("carol".into()))
        );
        assert!(!engine.is_in_call());
    }

    #[test]
    fn callee_path_installs_in_call_state_straight_from_idle() {
        // A callee never sends `RequestCall`; the first event it ever sees
        // is `Accepted` while still `None`.
        let mut engine = CallEngine::new();
        assert!(!engine.is_in_call());
        let action = engine.transition(CallEvent::Accepted(CallSession::Private {
            peer: "alice".into(),
            remote_addr: "10.0.0.2:5002".parse().unwrap(),
            remote_port: 5002,
            local_port: 5001,
        }));
        assert_eq!(action, CallAction::None);
        assert!(engine.is_in_call());

        // A callee hanging up must still emit CALL ENDED.
        let action = engine.transition(CallEvent::LocalStop);
        assert_eq!(action, CallAction::EmitCallEnded);
        assert!(!engine.is_in_call());
    }

    #[test]
    fn local_stop_emits_call_ended_and_returns_to_idle() {
        let mut engine = CallEngine::new();
        engine.transition(CallEvent::RequestCall(CallTargetName::Peer("bob".into())));
        engine.transition(CallEvent::Accepted(CallSession::Private {
            peer: "bob".into(),
            remote_addr: "10.0.0.2:5001".parse().unwrap(),
            remote_port: 5001,
            local_port: 5002,
        }));
        let action = engine.transition(CallEvent::LocalStop);
        assert_eq!(action, CallAction::EmitCallEnded);
        assert_eq!(*engine.state(), CallSession::None);
    }

    #[test]
    fn remote_ended_while_pending_returns_to_idle_silently() {
        let mut engine = CallEngine::new();
        engine.transition(CallEvent::RequestCall(CallTargetName::Global));
        let action = engine.transition(CallEvent::RemoteEnded);
        assert_eq!(action, CallAction::None);
        assert_eq!(*engine.state(), CallSession::None);
    }
}
