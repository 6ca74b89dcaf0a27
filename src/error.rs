/*!
 * Error Handling for the Confidential-Compute Engine
 *
 * Provides the error taxonomy shared by the key store, rotation controller,
 * session bootstrap and lifecycle driver, with numeric error codes and
 * category accessors for diagnostics.
 */

use thiserror::Error;

/// Error type covering every operation exposed by this crate
#[derive(Debug, Error)]
pub enum CcError {
    /// A key identifier failed variant-specific range validation
    #[error("invalid key identifier: {identifier} - {cause}")]
    InvalidIdentifier { identifier: String, cause: String },

    /// No Active entry exists for the requested identifier
    #[error("no active key material for {identifier}")]
    NotFound { identifier: String },

    /// The operation requires an established session and seed secret
    #[error("no established session: {operation}")]
    NoSession { operation: &'static str },

    /// The firmware trust anchor did not answer within the deadline
    #[error("session handshake timed out after {elapsed_ms} ms")]
    SessionTimeout { elapsed_ms: u64 },

    /// The firmware trust anchor refused the attestation exchange
    #[error("attestation rejected: {cause}")]
    AttestationRejected { cause: String },

    /// The device variant cannot perform this operation at all
    #[error("operation '{operation}' is not supported on this device variant")]
    UnsupportedVariant { operation: &'static str },

    /// Rotation policy disallows the requested rotation
    #[error("key rotation not supported: {cause}")]
    RotationNotSupported { cause: &'static str },

    /// A rotation is already pending for the targeted identifier
    #[error("key rotation already in progress for {identifier}")]
    RotationInProgress { identifier: String },

    /// The key store could not produce fresh material
    #[error("key derivation failed: {operation} - {cause}")]
    DerivationFailed {
        operation: &'static str,
        cause: String,
    },

    /// A variant stub was reached; the silicon lacks the capability
    #[error("operation '{operation}' reached an unsupported-silicon stub")]
    UnsupportedOperation { operation: &'static str },
}

/// Error code constants, grouped by component
pub mod error_codes {
    // Key store errors: 1000-1999
    pub const INVALID_IDENTIFIER: u32 = 1001;
    pub const KEY_NOT_FOUND: u32 = 1002;
    pub const NO_SESSION: u32 = 1003;
    pub const DERIVATION_FAILED: u32 = 1004;

    // Rotation errors: 2000-2999
    pub const ROTATION_NOT_SUPPORTED: u32 = 2001;
    pub const ROTATION_IN_PROGRESS: u32 = 2002;

    // Session errors: 3000-3999
    pub const SESSION_TIMEOUT: u32 = 3001;
    pub const ATTESTATION_REJECTED: u32 = 3002;

    // Dispatch errors: 4000-4999
    pub const UNSUPPORTED_VARIANT: u32 = 4001;
    pub const UNSUPPORTED_OPERATION: u32 = 4002;
}

impl CcError {
    /// Get the numeric error code for this error
    pub fn code(&self) -> u32 {
        match self {
            CcError::InvalidIdentifier { .. } => error_codes::INVALID_IDENTIFIER,
            CcError::NotFound { .. } => error_codes::KEY_NOT_FOUND,
            CcError::NoSession { .. } => error_codes::NO_SESSION,
            CcError::DerivationFailed { .. } => error_codes::DERIVATION_FAILED,
            CcError::RotationNotSupported { .. } => error_codes::ROTATION_NOT_SUPPORTED,
            CcError::RotationInProgress { .. } => error_codes::ROTATION_IN_PROGRESS,
            CcError::SessionTimeout { .. } => error_codes::SESSION_TIMEOUT,
            CcError::AttestationRejected { .. } => error_codes::ATTESTATION_REJECTED,
            CcError::UnsupportedVariant { .. } => error_codes::UNSUPPORTED_VARIANT,
            CcError::UnsupportedOperation { .. } => error_codes::UNSUPPORTED_OPERATION,
        }
    }

    /// Get the component category this error belongs to
    pub fn category(&self) -> &'static str {
        match self {
            CcError::InvalidIdentifier { .. }
            | CcError::NotFound { .. }
            | CcError::NoSession { .. }
            | CcError::DerivationFailed { .. } => "keystore",
            CcError::RotationNotSupported { .. } | CcError::RotationInProgress { .. } => "rotation",
            CcError::SessionTimeout { .. } | CcError::AttestationRejected { .. } => "session",
            CcError::UnsupportedVariant { .. } | CcError::UnsupportedOperation { .. } => "dispatch",
        }
    }

    /// Whether the failure is local to one identifier, leaving the store usable
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            CcError::InvalidIdentifier { .. }
                | CcError::NotFound { .. }
                | CcError::RotationInProgress { .. }
                | CcError::DerivationFailed { .. }
        )
    }
}

/// Convenience constructors for the error sites spread across the crate
impl CcError {
    pub fn invalid_identifier(identifier: impl std::fmt::Display, cause: &str) -> Self {
        CcError::InvalidIdentifier {
            identifier: identifier.to_string(),
            cause: cause.to_string(),
        }
    }

    pub fn not_found(identifier: impl std::fmt::Display) -> Self {
        CcError::NotFound {
            identifier: identifier.to_string(),
        }
    }

    pub fn rotation_in_progress(identifier: impl std::fmt::Display) -> Self {
        CcError::RotationInProgress {
            identifier: identifier.to_string(),
        }
    }

    pub fn derivation_failed(operation: &'static str, cause: impl std::fmt::Display) -> Self {
        CcError::DerivationFailed {
            operation,
            cause: cause.to_string(),
        }
    }
}

/// Result type alias for all confidential-compute operations
pub type CcResult<T> = Result<T, CcError>;
