/*!
 * Confidential-Compute Engine
 *
 * The glue object the Engine Host drives: it resolves the device variant
 * once at construction, binds the per-variant function table, and wires the
 * key store, rotation controller and session bootstrap into the lifecycle
 * phase hooks. All collaborators read the property-flag surface owned here;
 * nothing in this crate is process-global.
 */

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::CcResult;
use crate::hal::{hal_for, CcHal};
use crate::keystore::ids::KeySpace;
use crate::keystore::KeyStore;
use crate::lifecycle::{EnginePhaseParticipant, PhaseFlags};
use crate::rotation::RotationController;
use crate::session::{SessionBootstrap, SessionConfig, SessionTransport};
use crate::variant::{DeviceVariant, PropertyFlags};

/// Construction-time configuration.
#[derive(Debug, Clone, Default)]
pub struct CcEngineConfig {
    pub session: SessionConfig,
}

/// The confidential-compute engine instance for one attached device.
pub struct CcEngine {
    variant: DeviceVariant,
    hal: &'static dyn CcHal,
    properties: Arc<PropertyFlags>,
    halted: Arc<AtomicBool>,
    keystore: Arc<KeyStore>,
    session: SessionBootstrap,
    rotation: RotationController,
    transport: Arc<dyn SessionTransport>,
}

impl CcEngine {
    /// Resolve the raw classification word and bind every variant-dispatched
    /// path. This is the only place the variant is inspected; afterwards all
    /// components call through the bound function table.
    pub fn construct(
        raw_bits: u32,
        transport: Arc<dyn SessionTransport>,
        config: CcEngineConfig,
    ) -> Self {
        let variant = DeviceVariant::resolve(raw_bits);
        let hal = hal_for(variant);
        let properties = Arc::new(PropertyFlags::for_variant(variant));
        let halted = Arc::new(AtomicBool::new(false));
        let keystore = Arc::new(KeyStore::new(hal, halted.clone()));
        let session = SessionBootstrap::new(variant, hal, config.session);
        let rotation =
            RotationController::new(hal, properties.clone(), keystore.clone(), halted.clone());

        log::info!(
            "constructed confidential-compute engine: variant {:?}, bindings {}",
            variant,
            hal.name()
        );

        Self {
            variant,
            hal,
            properties,
            halted,
            keystore,
            session,
            rotation,
            transport,
        }
    }

    pub fn variant(&self) -> DeviceVariant {
        self.variant
    }

    /// The fixed named-boolean property surface.
    pub fn properties(&self) -> &PropertyFlags {
        &self.properties
    }

    /// Shared handle for data-plane threads doing lookups and derivations.
    pub fn keystore(&self) -> &Arc<KeyStore> {
        &self.keystore
    }

    pub fn rotation(&self) -> &RotationController {
        &self.rotation
    }

    pub fn session(&self) -> &SessionBootstrap {
        &self.session
    }

    pub fn is_gpu_cc_capable(&self) -> bool {
        self.hal.is_gpu_cc_capable()
    }

    pub fn is_debug_mode_enabled(&self) -> bool {
        self.hal.is_debug_mode_enabled()
    }

    /// Whether the host forced the engine into the error state.
    pub fn is_errored(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    /// Establish the session and populate the store with the device-global
    /// key spaces. The per-copy-engine spaces are derived on demand by the
    /// embedder through
    /// [`KeyStore::derive_secrets_for_engine_key_space`].
    fn load_key_material(&mut self) -> CcResult<()> {
        self.session.establish_session_and_keys(self.transport.as_ref())?;
        self.keystore.init(&self.session)?;

        // Guests hold an empty store until the host feeds it.
        if !self.session.is_established() {
            return Ok(());
        }

        for space in [KeySpace::Gsp, KeySpace::Sec2] {
            let derived = self.keystore.derive_secrets(space)?;
            // Device-to-host IV masks are host-chosen; overwrite the derived
            // defaults with fresh randomness.
            let pair = self.keystore.key_pair_for_key_space(space)?;
            if derived.contains(&pair.d2h) {
                self.keystore
                    .deposit_iv_mask(pair.d2h, KeyStore::random_iv_mask())?;
            }
        }
        Ok(())
    }
}

impl EnginePhaseParticipant for CcEngine {
    fn engine_name(&self) -> &'static str {
        "conf-compute"
    }

    fn is_present(&self) -> bool {
        !self.properties.is_missing()
    }

    fn state_init_locked(&mut self) -> CcResult<()> {
        let max_space = self.hal.max_lce_key_space_index()?;
        log::debug!(
            "conf-compute init: {} copy-engine key spaces available",
            u32::from(max_space) + 1
        );
        Ok(())
    }

    fn state_load(&mut self, _flags: PhaseFlags) -> CcResult<()> {
        self.load_key_material()
    }

    fn state_post_load(&mut self, _flags: PhaseFlags) -> CcResult<()> {
        self.rotation.enable_key_rotation_support();
        self.rotation.enable_internal_key_rotation_support();

        if self.properties.ready_check() && self.session.is_established() {
            // The export master key must be on hand before the engine goes
            // active; failing here keeps the engine out of Active.
            self.keystore.with_export_master_key(|_| ())?;
        }
        Ok(())
    }

    fn state_pre_unload(&mut self, _flags: PhaseFlags) -> CcResult<()> {
        self.rotation.disable_key_rotation();
        Ok(())
    }

    fn state_unload(&mut self, _flags: PhaseFlags) -> CcResult<()> {
        self.keystore.deinit();
        self.session.teardown();
        Ok(())
    }

    fn state_destroy(&mut self) {
        // Safe on a partially constructed engine: both are idempotent and
        // zeroize whatever exists.
        self.keystore.deinit();
        self.session.teardown();
    }

    fn set_error_state(&mut self) {
        self.halted.store(true, Ordering::Release);
        log::warn!("conf-compute engine entered error state");
    }
}
