//! Connection initialization state machine.
//!
//! ```text
//! Pending -> AuthInfoExchanged -> ContentPackageNegotiated ---------> Active
//!                             \-> PasswordChallenged --(correct)--/
//! ```
//!
//! Each state accepts exactly one client step. Anything else resets the
//! machine to `Pending` and counts a retry; once the retries run out the
//! connection is disconnected. Bans are accepted in every state and are
//! final.

use crate::codec::{content_fingerprint, ClientInitStep, ContentPackageList, ServerInitStep};
use crate::connection::TransportKind;
use crate::error::NetError;
use crate::protocol::{ConnectionInitialization, DisconnectReason};
use hullsync_core::ConnectionId;
use tracing::{debug, info, warn};

/// Default number of password guesses before disconnect.
pub const DEFAULT_PASSWORD_ATTEMPTS: u8 = 3;

/// Lifecycle state of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    /// Waiting for identity and version.
    Pending,
    /// Waiting for the content package list.
    AuthInfoExchanged,
    /// Waiting for the client's final acknowledgement.
    ContentPackageNegotiated,
    /// Waiting for a password digest.
    PasswordChallenged,
    /// Fully joined.
    Active,
    /// Closed; `banned` is set when closed by moderation.
    Disconnected {
        /// Closed by a ban.
        banned: bool,
    },
}

impl LifecycleState {
    /// Client step accepted in this state.
    pub fn expected_step(self) -> Option<ConnectionInitialization> {
        match self {
            LifecycleState::Pending => Some(ConnectionInitialization::AuthInfoAndVersion),
            LifecycleState::AuthInfoExchanged => Some(ConnectionInitialization::ContentPackageOrder),
            LifecycleState::ContentPackageNegotiated => Some(ConnectionInitialization::Success),
            LifecycleState::PasswordChallenged => Some(ConnectionInitialization::Password),
            LifecycleState::Active | LifecycleState::Disconnected { .. } => None,
        }
    }
}

/// What the server expects from joining clients.
#[derive(Debug, Clone)]
pub struct HandshakePolicy {
    /// Required protocol version.
    pub protocol_version: u16,
    /// Required schema hash.
    pub schema_hash: u64,
    /// Server's content package list.
    pub content: ContentPackageList,
    /// Session password, if any.
    pub password: Option<String>,
    /// Out-of-order steps tolerated before disconnect.
    pub max_retries: u32,
    /// Password guesses allowed.
    pub password_attempts: u8,
}

/// Result of feeding one client step into the machine.
#[derive(Debug)]
pub enum StepOutcome {
    /// Step accepted; send `reply` if present.
    Advanced {
        /// Server step to send back.
        reply: Option<ServerInitStep>,
    },
    /// Step rejected and the machine reset to `Pending`.
    Retry(NetError),
    /// The connection must be closed with `reason`.
    Disconnected(DisconnectReason),
    /// The connection is already closed; the step was dropped.
    Ignored,
}

/// Per-connection handshake state.
#[derive(Debug, Clone)]
pub struct ConnectionLifecycle {
    id: ConnectionId,
    transport: TransportKind,
    state: LifecycleState,
    retries: u32,
    attempts_left: u8,
    salt: u32,
    relay_started: bool,
    name: Option<String>,
    owner_key: Option<u32>,
}

impl ConnectionLifecycle {
    /// Fresh lifecycle in `Pending`.
    pub fn new(id: ConnectionId, transport: TransportKind, policy: &HandshakePolicy) -> Self {
        Self {
            id,
            transport,
            state: LifecycleState::Pending,
            retries: 0,
            attempts_left: policy.password_attempts,
            salt: 0,
            relay_started: false,
            name: None,
            owner_key: None,
        }
    }

    /// Current state.
    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Out-of-order steps seen so far.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Name announced in the auth step.
    pub fn player_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Owner key announced in the auth step.
    pub fn owner_key(&self) -> Option<u32> {
        self.owner_key
    }

    /// Whether replication and voice traffic may flow.
    pub fn accepts_traffic(&self) -> bool {
        self.state == LifecycleState::Active
    }

    /// Whether the connection is closed.
    pub fn is_disconnected(&self) -> bool {
        matches!(self.state, LifecycleState::Disconnected { .. })
    }

    /// Feed one client step.
    pub fn handle_step(&mut self, step: &ClientInitStep, policy: &HandshakePolicy) -> StepOutcome {
        if self.is_disconnected() {
            return StepOutcome::Ignored;
        }

        match (self.state, step) {
            (LifecycleState::Pending, ClientInitStep::ConnectionStarted)
                if self.awaiting_relay_start() =>
            {
                self.relay_started = true;
                debug!(conn = %self.id, "relay session started");
                StepOutcome::Advanced {
                    reply: Some(ServerInitStep::AuthInfoAndVersion),
                }
            }
            (LifecycleState::Pending, ClientInitStep::AuthInfoAndVersion(info))
                if !self.awaiting_relay_start() =>
            {
                if info.version != policy.protocol_version || info.schema_hash != policy.schema_hash {
                    warn!(
                        conn = %self.id,
                        client_version = info.version,
                        server_version = policy.protocol_version,
                        "version mismatch"
                    );
                    return self.close(DisconnectReason::InvalidVersion);
                }
                self.name = Some(info.name.clone());
                self.owner_key = info.owner_key;
                self.transition(LifecycleState::AuthInfoExchanged);
                StepOutcome::Advanced {
                    reply: Some(ServerInitStep::ContentPackageOrder(policy.content.clone())),
                }
            }
            (LifecycleState::AuthInfoExchanged, ClientInitStep::ContentPackageOrder(list)) => {
                // The declared fingerprint is not trusted.
                if content_fingerprint(&list.packages) != policy.content.fingerprint {
                    warn!(conn = %self.id, "content package mismatch");
                    return self.close(DisconnectReason::ContentMismatch);
                }
                if policy.password.is_some() {
                    self.salt = rand::random();
                    self.transition(LifecycleState::PasswordChallenged);
                    StepOutcome::Advanced {
                        reply: Some(self.challenge()),
                    }
                } else {
                    self.transition(LifecycleState::ContentPackageNegotiated);
                    StepOutcome::Advanced { reply: None }
                }
            }
            (LifecycleState::ContentPackageNegotiated, ClientInitStep::Success) => self.activate(),
            (LifecycleState::PasswordChallenged, ClientInitStep::Password { digest }) => {
                let expected = crate::codec::password_digest(
                    self.salt,
                    policy.password.as_deref().unwrap_or_default(),
                );
                // blake3::Hash equality is constant time.
                if blake3::Hash::from(*digest) == blake3::Hash::from(expected) {
                    return self.activate();
                }
                self.attempts_left = self.attempts_left.saturating_sub(1);
                warn!(conn = %self.id, attempts_left = self.attempts_left, "wrong password");
                if self.attempts_left == 0 {
                    return self.close(DisconnectReason::WrongPassword);
                }
                StepOutcome::Advanced {
                    reply: Some(self.challenge()),
                }
            }
            (state, step) => self.violation(state, step.code(), policy),
        }
    }

    /// Close by moderation. Terminal.
    pub fn ban(&mut self) {
        self.transition(LifecycleState::Disconnected { banned: true });
    }

    /// Close without a ban. Does not clear an existing ban.
    pub fn disconnect(&mut self) {
        if !self.is_disconnected() {
            self.transition(LifecycleState::Disconnected { banned: false });
        }
    }

    fn challenge(&self) -> ServerInitStep {
        ServerInitStep::Password {
            salt: self.salt,
            attempts_left: self.attempts_left,
        }
    }

    fn activate(&mut self) -> StepOutcome {
        self.transition(LifecycleState::Active);
        info!(conn = %self.id, name = self.name.as_deref().unwrap_or(""), "connection active");
        StepOutcome::Advanced {
            reply: Some(ServerInitStep::Success {
                connection_id: self.id,
            }),
        }
    }

    fn close(&mut self, reason: DisconnectReason) -> StepOutcome {
        self.transition(LifecycleState::Disconnected { banned: false });
        StepOutcome::Disconnected(reason)
    }

    fn violation(
        &mut self,
        state: LifecycleState,
        received: ConnectionInitialization,
        policy: &HandshakePolicy,
    ) -> StepOutcome {
        self.retries += 1;
        warn!(
            conn = %self.id,
            ?state,
            ?received,
            retries = self.retries,
            "out-of-order initialization step"
        );
        if self.retries > policy.max_retries {
            return self.close(DisconnectReason::ProtocolViolation);
        }
        let expected = if self.awaiting_relay_start() {
            ConnectionInitialization::ConnectionStarted
        } else {
            state
                .expected_step()
                .unwrap_or(ConnectionInitialization::AuthInfoAndVersion)
        };
        self.name = None;
        self.owner_key = None;
        self.transition(LifecycleState::Pending);
        StepOutcome::Retry(NetError::ProtocolOrderViolation { expected, received })
    }

    fn awaiting_relay_start(&self) -> bool {
        self.state == LifecycleState::Pending
            && self.transport == TransportKind::PeerRelay
            && !self.relay_started
    }

    fn transition(&mut self, next: LifecycleState) {
        if self.state != next {
            debug!(conn = %self.id, from = ?self.state, to = ?next, "lifecycle transition");
            self.state = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{compute_schema_hash, password_digest, AuthInfo};
    use crate::protocol::PROTOCOL_VERSION;

    fn policy(password: Option<&str>) -> HandshakePolicy {
        HandshakePolicy {
            protocol_version: PROTOCOL_VERSION,
            schema_hash: compute_schema_hash(),
            content: ContentPackageList::new(vec!["Vanilla".to_string()]),
            password: password.map(str::to_string),
            max_retries: 2,
            password_attempts: DEFAULT_PASSWORD_ATTEMPTS,
        }
    }

    fn auth() -> ClientInitStep {
        ClientInitStep::AuthInfoAndVersion(AuthInfo {
            name: "Mechanic".to_string(),
            version: PROTOCOL_VERSION,
            schema_hash: compute_schema_hash(),
            owner_key: None,
        })
    }

    fn content() -> ClientInitStep {
        ClientInitStep::ContentPackageOrder(ContentPackageList::new(vec!["Vanilla".to_string()]))
    }

    #[test]
    fn test_full_handshake_without_password() {
        let policy = policy(None);
        let mut lc = ConnectionLifecycle::new(ConnectionId(1), TransportKind::Socket, &policy);

        assert!(matches!(
            lc.handle_step(&auth(), &policy),
            StepOutcome::Advanced {
                reply: Some(ServerInitStep::ContentPackageOrder(_))
            }
        ));
        assert_eq!(lc.state(), LifecycleState::AuthInfoExchanged);
        assert_eq!(lc.player_name(), Some("Mechanic"));

        assert!(matches!(
            lc.handle_step(&content(), &policy),
            StepOutcome::Advanced { reply: None }
        ));
        assert_eq!(lc.state(), LifecycleState::ContentPackageNegotiated);
        assert!(!lc.accepts_traffic());

        match lc.handle_step(&ClientInitStep::Success, &policy) {
            StepOutcome::Advanced {
                reply: Some(ServerInitStep::Success { connection_id }),
            } => assert_eq!(connection_id, ConnectionId(1)),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(lc.accepts_traffic());
    }

    #[test]
    fn test_password_flow() {
        let policy = policy(Some("depth"));
        let mut lc = ConnectionLifecycle::new(ConnectionId(2), TransportKind::Socket, &policy);
        lc.handle_step(&auth(), &policy);

        let salt = match lc.handle_step(&content(), &policy) {
            StepOutcome::Advanced {
                reply: Some(ServerInitStep::Password { salt, attempts_left }),
            } => {
                assert_eq!(attempts_left, 3);
                salt
            }
            other => panic!("unexpected outcome {other:?}"),
        };
        assert_eq!(lc.state(), LifecycleState::PasswordChallenged);

        let wrong = ClientInitStep::Password {
            digest: password_digest(salt, "shallow"),
        };
        assert!(matches!(
            lc.handle_step(&wrong, &policy),
            StepOutcome::Advanced {
                reply: Some(ServerInitStep::Password { attempts_left: 2, .. })
            }
        ));
        assert_eq!(lc.retries(), 0);

        let right = ClientInitStep::Password {
            digest: password_digest(salt, "depth"),
        };
        assert!(matches!(
            lc.handle_step(&right, &policy),
            StepOutcome::Advanced {
                reply: Some(ServerInitStep::Success { .. })
            }
        ));
        assert!(lc.accepts_traffic());
    }

    #[test]
    fn test_password_attempts_run_out() {
        let policy = policy(Some("depth"));
        let mut lc = ConnectionLifecycle::new(ConnectionId(3), TransportKind::Socket, &policy);
        lc.handle_step(&auth(), &policy);
        lc.handle_step(&content(), &policy);

        let wrong = ClientInitStep::Password { digest: [0u8; 32] };
        lc.handle_step(&wrong, &policy);
        lc.handle_step(&wrong, &policy);
        assert!(matches!(
            lc.handle_step(&wrong, &policy),
            StepOutcome::Disconnected(DisconnectReason::WrongPassword)
        ));
        assert_eq!(lc.state(), LifecycleState::Disconnected { banned: false });
    }

    #[test]
    fn test_content_before_auth_resets() {
        let policy = policy(None);
        let mut lc = ConnectionLifecycle::new(ConnectionId(4), TransportKind::Socket, &policy);
        match lc.handle_step(&content(), &policy) {
            StepOutcome::Retry(NetError::ProtocolOrderViolation { expected, received }) => {
                assert_eq!(expected, ConnectionInitialization::AuthInfoAndVersion);
                assert_eq!(received, ConnectionInitialization::ContentPackageOrder);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(lc.state(), LifecycleState::Pending);
        assert!(!lc.accepts_traffic());
    }

    #[test]
    fn test_violation_mid_handshake_resets_to_pending() {
        let policy = policy(None);
        let mut lc = ConnectionLifecycle::new(ConnectionId(5), TransportKind::Socket, &policy);
        lc.handle_step(&auth(), &policy);
        assert!(matches!(
            lc.handle_step(&ClientInitStep::Success, &policy),
            StepOutcome::Retry(_)
        ));
        assert_eq!(lc.state(), LifecycleState::Pending);
        assert_eq!(lc.player_name(), None);

        // The handshake can restart from the top.
        lc.handle_step(&auth(), &policy);
        assert_eq!(lc.state(), LifecycleState::AuthInfoExchanged);
    }

    #[test]
    fn test_retries_exhausted() {
        let policy = policy(None);
        let mut lc = ConnectionLifecycle::new(ConnectionId(6), TransportKind::Socket, &policy);
        assert!(matches!(lc.handle_step(&ClientInitStep::Success, &policy), StepOutcome::Retry(_)));
        assert!(matches!(lc.handle_step(&ClientInitStep::Success, &policy), StepOutcome::Retry(_)));
        assert!(matches!(
            lc.handle_step(&ClientInitStep::Success, &policy),
            StepOutcome::Disconnected(DisconnectReason::ProtocolViolation)
        ));
        assert!(matches!(lc.handle_step(&auth(), &policy), StepOutcome::Ignored));
    }

    #[test]
    fn test_version_mismatch() {
        let policy = policy(None);
        let mut lc = ConnectionLifecycle::new(ConnectionId(7), TransportKind::Socket, &policy);
        let old = ClientInitStep::AuthInfoAndVersion(AuthInfo {
            name: "Old".to_string(),
            version: PROTOCOL_VERSION - 1,
            schema_hash: compute_schema_hash(),
            owner_key: None,
        });
        assert!(matches!(
            lc.handle_step(&old, &policy),
            StepOutcome::Disconnected(DisconnectReason::InvalidVersion)
        ));
    }

    #[test]
    fn test_content_mismatch() {
        let policy = policy(None);
        let mut lc = ConnectionLifecycle::new(ConnectionId(8), TransportKind::Socket, &policy);
        lc.handle_step(&auth(), &policy);
        let modded = ClientInitStep::ContentPackageOrder(ContentPackageList::new(vec![
            "Vanilla".to_string(),
            "BiggerTorpedoes".to_string(),
        ]));
        assert!(matches!(
            lc.handle_step(&modded, &policy),
            StepOutcome::Disconnected(DisconnectReason::ContentMismatch)
        ));
    }

    #[test]
    fn test_forged_fingerprint_is_recomputed() {
        let policy = policy(None);
        let mut lc = ConnectionLifecycle::new(ConnectionId(12), TransportKind::Socket, &policy);
        lc.handle_step(&auth(), &policy);
        let forged = ClientInitStep::ContentPackageOrder(ContentPackageList {
            packages: vec!["BiggerTorpedoes".to_string()],
            fingerprint: policy.content.fingerprint,
        });
        assert!(matches!(
            lc.handle_step(&forged, &policy),
            StepOutcome::Disconnected(DisconnectReason::ContentMismatch)
        ));
        assert_eq!(lc.state(), LifecycleState::Disconnected { banned: false });
    }

    #[test]
    fn test_relay_auth_requires_connection_started() {
        let policy = policy(None);
        let mut relay = ConnectionLifecycle::new(ConnectionId(13), TransportKind::PeerRelay, &policy);
        match relay.handle_step(&auth(), &policy) {
            StepOutcome::Retry(NetError::ProtocolOrderViolation { expected, received }) => {
                assert_eq!(expected, ConnectionInitialization::ConnectionStarted);
                assert_eq!(received, ConnectionInitialization::AuthInfoAndVersion);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(relay.state(), LifecycleState::Pending);
        assert_eq!(relay.player_name(), None);

        relay.handle_step(&ClientInitStep::ConnectionStarted, &policy);
        assert!(matches!(
            relay.handle_step(&auth(), &policy),
            StepOutcome::Advanced {
                reply: Some(ServerInitStep::ContentPackageOrder(_))
            }
        ));
        assert_eq!(relay.state(), LifecycleState::AuthInfoExchanged);
    }

    #[test]
    fn test_connection_started_only_for_relay() {
        let policy = policy(None);
        let mut relay = ConnectionLifecycle::new(ConnectionId(9), TransportKind::PeerRelay, &policy);
        assert!(matches!(
            relay.handle_step(&ClientInitStep::ConnectionStarted, &policy),
            StepOutcome::Advanced {
                reply: Some(ServerInitStep::AuthInfoAndVersion)
            }
        ));
        assert_eq!(relay.state(), LifecycleState::Pending);

        let mut socket = ConnectionLifecycle::new(ConnectionId(10), TransportKind::Socket, &policy);
        assert!(matches!(
            socket.handle_step(&ClientInitStep::ConnectionStarted, &policy),
            StepOutcome::Retry(_)
        ));
    }

    #[test]
    fn test_ban_from_any_state_is_terminal() {
        let policy = policy(None);
        let mut lc = ConnectionLifecycle::new(ConnectionId(11), TransportKind::Socket, &policy);
        lc.handle_step(&auth(), &policy);
        lc.ban();
        assert_eq!(lc.state(), LifecycleState::Disconnected { banned: true });
        lc.disconnect();
        assert_eq!(lc.state(), LifecycleState::Disconnected { banned: true });
        assert!(matches!(lc.handle_step(&auth(), &policy), StepOutcome::Ignored));
    }
}
