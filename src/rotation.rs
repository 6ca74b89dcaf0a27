/*!
 * Key Rotation Controller
 *
 * Decides whether rotation is supported and enabled for the attached
 * variant, owns the periodic rotation-need callback, and drives targeted
 * entries through the Active → RotationPending → Active(generation+1)
 * swap in the key store. Rotation is serialized per identifier (the store's
 * pending slot is the guard) and concurrent across identifiers.
 */

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{CcError, CcResult};
use crate::hal::CcHal;
use crate::keystore::ids::{GlobalKeyId, KeyIdentifier};
use crate::keystore::KeyStore;
use crate::variant::PropertyFlags;

/// Periodic rotation-need evaluation hook. Invoked from the embedder's
/// timer via [`RotationController::evaluate_rotation_needs`]; returns the
/// identifiers due for rotation.
pub type RotationCallback = Box<dyn Fn() -> Vec<KeyIdentifier> + Send + Sync>;

/// Snapshot of the rotation policy flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotationPolicy {
    pub supported: bool,
    pub enabled: bool,
    pub internal_enabled: bool,
    pub callback_registered: bool,
}

pub struct RotationController {
    hal: &'static dyn CcHal,
    flags: Arc<PropertyFlags>,
    store: Arc<KeyStore>,
    halted: Arc<AtomicBool>,
    callback: Mutex<Option<RotationCallback>>,
}

impl RotationController {
    pub fn new(
        hal: &'static dyn CcHal,
        flags: Arc<PropertyFlags>,
        store: Arc<KeyStore>,
        halted: Arc<AtomicBool>,
    ) -> Self {
        Self {
            hal,
            flags,
            store,
            halted,
            callback: Mutex::new(None),
        }
    }

    /// Set the rotation policy flags from the silicon capability. Idempotent.
    /// On variants without rotation hardware this leaves the policy disabled
    /// rather than failing: disabled is the safe default.
    pub fn enable_key_rotation_support(&self) {
        let supported = self.hal.supports_key_rotation();
        self.flags.set_rotation_supported(supported);
        if supported {
            self.flags.set_rotation_enabled(true);
            log::info!("key rotation enabled ({})", self.hal.name());
        } else {
            log::debug!("key rotation not supported on {}", self.hal.name());
        }
    }

    /// Enable silicon-internal rotation where the generation supports it.
    /// Idempotent, no-op elsewhere.
    pub fn enable_internal_key_rotation_support(&self) {
        if self.hal.supports_internal_key_rotation() {
            self.flags.set_internal_rotation_enabled(true);
            log::info!("internal key rotation enabled ({})", self.hal.name());
        }
    }

    /// Drop the enablement flag ahead of unload. Support stays as resolved,
    /// so a later reload re-enables cleanly.
    pub fn disable_key_rotation(&self) {
        self.flags.set_rotation_enabled(false);
        log::debug!("key rotation disabled");
    }

    /// Register the periodic rotation-need evaluation hook. No-op when
    /// rotation is unsupported; returns whether the hook was registered.
    pub fn enable_key_rotation_callback(&self, callback: RotationCallback) -> bool {
        if !self.flags.rotation_supported() {
            log::debug!("rotation callback ignored: rotation unsupported");
            return false;
        }
        *self.callback.lock().unwrap() = Some(callback);
        true
    }

    /// Run the registered rotation-need hook and trigger whatever it asks
    /// for. Returns the number of identifiers rotated.
    pub fn evaluate_rotation_needs(&self) -> CcResult<usize> {
        let targets = match &*self.callback.lock().unwrap() {
            Some(callback) => callback(),
            None => return Ok(0),
        };
        let mut rotated = 0;
        for target in targets {
            rotated += self.trigger_key_rotation(target)?;
        }
        Ok(rotated)
    }

    /// Move the targeted entries through RotationPending into the next
    /// generation. The scope is any key identifier: one global id, the pair
    /// a channel works with, or every Active entry of an engine's key space.
    /// A failure on one identifier never affects the others; the first error
    /// is reported after all targets were attempted. Returns the number of
    /// identifiers rotated.
    pub fn trigger_key_rotation(&self, target: KeyIdentifier) -> CcResult<usize> {
        if self.halted.load(Ordering::Acquire) {
            return Err(CcError::RotationNotSupported {
                cause: "engine is in error state",
            });
        }
        if !self.flags.rotation_enabled() {
            return Err(CcError::RotationNotSupported {
                cause: "rotation disabled by policy for this variant",
            });
        }

        let targets: Vec<GlobalKeyId> = match target {
            KeyIdentifier::Global(id) => vec![id],
            KeyIdentifier::Channel { channel, key_space } => {
                let resolved = self.store.key_space_from_channel(&channel)?;
                if resolved != key_space {
                    return Err(CcError::invalid_identifier(
                        format!("channel {:#x} in {}", channel.handle, key_space),
                        "channel does not belong to this key space",
                    ));
                }
                let pair = self.store.key_pair_by_channel(&channel)?;
                vec![pair.h2d, pair.d2h]
            }
            KeyIdentifier::EngineKeySpace { engine, key_space } => {
                let owner = self.store.engine_id_from_key_space(key_space)?;
                if owner != engine {
                    return Err(CcError::invalid_identifier(
                        format!("{}:{}", engine, key_space),
                        "engine does not own this key space",
                    ));
                }
                self.store.active_ids_in_space(key_space)
            }
        };

        let mut rotated = 0;
        let mut first_error = None;
        for id in targets {
            match self.store.update_secrets(id) {
                Ok(generation) => {
                    rotated += 1;
                    log::debug!("rotation of {} reached generation {}", id, generation);
                }
                Err(err) => {
                    log::warn!("rotation of {} failed: {}", id, err);
                    first_error.get_or_insert(err);
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(rotated),
        }
    }

    /// Current policy snapshot.
    pub fn policy(&self) -> RotationPolicy {
        RotationPolicy {
            supported: self.flags.rotation_supported(),
            enabled: self.flags.rotation_enabled(),
            internal_enabled: self.flags.internal_rotation_enabled(),
            callback_registered: self.callback.lock().unwrap().is_some(),
        }
    }
}
