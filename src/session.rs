//! Attestation / Session Bootstrap
//!
//! Establishes the secure session with the firmware trust anchor and holds
//! the seed secret the key store derives from. The wire protocol lives with
//! the embedder behind [`SessionTransport`]; only success/failure and the
//! seed secret cross into this crate. This is the only component allowed to
//! block, and it always blocks with a deadline.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::{CcError, CcResult};
use crate::hal::CcHal;
use crate::secure_memory::SecureBytes;
use crate::variant::DeviceVariant;

/// Outcome of the opaque attestation exchange, as reported by the embedder's
/// transport.
#[derive(Debug)]
pub enum TransportResponse {
    /// Handshake accepted; the trust anchor returned the seed secret
    Accepted { seed: Vec<u8> },
    /// The trust anchor refused the exchange
    Rejected { reason: String },
}

/// Transport-level failure, distinct from an explicit rejection.
#[derive(Debug)]
pub enum TransportError {
    /// No response within the deadline handed to the transport
    TimedOut,
    /// Exchange broke down for another reason
    Failed(String),
}

/// Request/response exchange with the firmware trust anchor.
///
/// Implementations are expected to block up to `timeout` and report
/// [`TransportError::TimedOut`] past the deadline.
pub trait SessionTransport: Send + Sync {
    fn attest(&self, timeout: Duration) -> Result<TransportResponse, TransportError>;
}

/// Session state after bootstrap.
enum SessionState {
    /// No handshake has run (or teardown cleared it)
    NotEstablished,
    /// Host session: attested, seed secret on hand
    Established { seed: SecureBytes },
    /// Guest: keys arrive from the host, no independent attestation. A
    /// trivially-absent success state.
    Absent,
}

/// Session bootstrap configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Deadline for the attestation exchange
    pub timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(2),
        }
    }
}

/// Drives the handshake with the trust anchor and owns the resulting seed
/// secret. The seed never leaves this struct except through the scoped
/// [`SessionBootstrap::with_seed`] accessor the key store consumes.
pub struct SessionBootstrap {
    variant: DeviceVariant,
    hal: &'static dyn CcHal,
    config: SessionConfig,
    state: Mutex<SessionState>,
}

impl SessionBootstrap {
    pub fn new(variant: DeviceVariant, hal: &'static dyn CcHal, config: SessionConfig) -> Self {
        Self {
            variant,
            hal,
            config,
            state: Mutex::new(SessionState::NotEstablished),
        }
    }

    /// Establish the secure session and obtain the seed secret.
    ///
    /// The guest role succeeds immediately with an absent session: guests
    /// receive their keys from the host rather than attesting on their own.
    /// The host role requires the variant to expose a session protocol and
    /// runs the exchange under the configured deadline.
    pub fn establish_session_and_keys(&self, transport: &dyn SessionTransport) -> CcResult<()> {
        if self.variant.is_guest() {
            log::debug!("session bootstrap: guest role, no attestation required");
            *self.state.lock().unwrap() = SessionState::Absent;
            return Ok(());
        }

        if !self.hal.is_spdm_enabled() {
            return Err(CcError::UnsupportedVariant {
                operation: "establish_session_and_keys",
            });
        }

        let started = Instant::now();
        let response = transport.attest(self.config.timeout).map_err(|e| match e {
            TransportError::TimedOut => CcError::SessionTimeout {
                elapsed_ms: started.elapsed().as_millis() as u64,
            },
            TransportError::Failed(cause) => CcError::AttestationRejected { cause },
        })?;

        match response {
            TransportResponse::Accepted { mut seed } => {
                if seed.is_empty() {
                    return Err(CcError::AttestationRejected {
                        cause: "trust anchor returned an empty seed secret".to_string(),
                    });
                }
                let secret = SecureBytes::new(&seed);
                crate::secure_memory::with_secure_scope(&mut seed, |_| ());
                *self.state.lock().unwrap() = SessionState::Established { seed: secret };
                log::info!(
                    "session established with trust anchor in {} ms",
                    started.elapsed().as_millis()
                );
                Ok(())
            }
            TransportResponse::Rejected { reason } => {
                log::warn!("attestation rejected: {}", reason);
                Err(CcError::AttestationRejected { cause: reason })
            }
        }
    }

    /// Whether a host session with a seed secret is currently established.
    pub fn is_established(&self) -> bool {
        matches!(
            *self.state.lock().unwrap(),
            SessionState::Established { .. }
        )
    }

    /// Whether the session requirement is satisfied: either an established
    /// host session, or the guest's absent-by-design success state.
    pub fn is_ready(&self) -> bool {
        !matches!(*self.state.lock().unwrap(), SessionState::NotEstablished)
    }

    /// Scoped access to the seed secret for derivation. The seed stays owned
    /// here; callers only see it for the duration of the closure.
    pub(crate) fn with_seed<R>(&self, f: impl FnOnce(&SecureBytes) -> R) -> CcResult<R> {
        match &*self.state.lock().unwrap() {
            SessionState::Established { seed } => Ok(f(seed)),
            _ => Err(CcError::NoSession {
                operation: "with_seed",
            }),
        }
    }

    /// Drop the session and zeroize the seed secret. Idempotent.
    pub fn teardown(&self) {
        let mut state = self.state.lock().unwrap();
        if let SessionState::Established { seed } = &mut *state {
            seed.clear();
        }
        *state = SessionState::NotEstablished;
    }
}
