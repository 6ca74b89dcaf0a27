/*!
 * Confidential-Compute Key Lifecycle Management
 *
 * This crate implements the key-lifecycle core a GPU resource manager embeds
 * when running with encrypted command/data traffic: per-channel and
 * per-engine symmetric keys derived from an attested session secret, rotated
 * under live traffic and zeroized on teardown, plus the multi-phase engine
 * lifecycle the Engine Host drives and the once-per-attach dispatch layer
 * that binds each operation to the silicon generation and virtualization
 * role.
 *
 * The main pieces are:
 *
 * - variant resolution and the per-variant function bindings
 * - the key store, owning all key material and the export master key
 * - the rotation controller, swapping generations without a gap
 * - the session bootstrap against the firmware trust anchor
 * - the lifecycle state machine gluing it into the Engine Host
 */

/// Device variant classification and the engine property-flag surface
pub mod variant;

/// Per-variant function bindings, resolved once per attach
pub mod hal;

/// Key identifier taxonomy, key material storage and derivation
pub mod keystore;

/// Key rotation policy and the per-identifier rotation state machine
pub mod rotation;

/// Attested session bootstrap against the firmware trust anchor
pub mod session;

/// Engine lifecycle state machine and the phase-participant contract
pub mod lifecycle;

/// The engine object wiring all components into the lifecycle hooks
pub mod engine;

/// Common error types
pub mod error;

/// Zeroize-on-release containers for secret bytes
pub mod secure_memory;

// Re-export main types for convenience
pub use engine::{CcEngine, CcEngineConfig};
pub use error::{CcError, CcResult};
pub use keystore::ids::{
    ChannelDescriptor, EngineId, GlobalKeyId, KeyDirection, KeyIdentifier, KeyPair, KeySpace,
    LocalKeyId,
};
pub use keystore::{CallerClass, KeyState, KeyStore, KeyView};
pub use lifecycle::{DeviceLock, EngineLifecycle, EnginePhase, EnginePhaseParticipant, PhaseFlags};
pub use rotation::{RotationCallback, RotationController, RotationPolicy};
pub use session::{SessionBootstrap, SessionConfig, SessionTransport};
pub use variant::{DeviceVariant, PrivilegeRole, PropertyFlags, SiliconGeneration};

/// The most commonly used types in one import.
pub mod prelude {
    pub use crate::engine::{CcEngine, CcEngineConfig};
    pub use crate::error::{CcError, CcResult};
    pub use crate::hal::hal_for;
    pub use crate::keystore::ids::{
        ChannelDescriptor, EngineId, GlobalKeyId, KeyDirection, KeyIdentifier, KeyPair, KeySpace,
        LocalKeyId,
    };
    pub use crate::keystore::{CallerClass, KeyState, KeyStore, KeyView};
    pub use crate::lifecycle::{
        DeviceLock, EngineLifecycle, EnginePhase, EnginePhaseParticipant, PhaseFlags,
    };
    pub use crate::rotation::{RotationController, RotationPolicy};
    pub use crate::secure_memory::{with_secure_scope, SecureBytes};
    pub use crate::session::{
        SessionBootstrap, SessionConfig, SessionTransport, TransportError, TransportResponse,
    };
    pub use crate::variant::{DeviceVariant, PrivilegeRole, PropertyFlags, SiliconGeneration};
}
