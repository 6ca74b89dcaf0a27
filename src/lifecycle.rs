/*!
 * Engine Lifecycle State Machine
 *
 * Ordered phases the Engine Host drives one engine through, each gated on
 * successful completion of the prior one. Locked phases hold the
 * device-wide lock, serializing initialization across sibling engines;
 * unlocked phases may run concurrently with siblings. The driver composes
 * with a polymorphic phase participant rather than inheriting from it: the
 * confidential-compute engine implements [`EnginePhaseParticipant`] and the
 * host owns an [`EngineLifecycle`] around it.
 */

use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{CcError, CcResult};

/// Ordered lifecycle states. `Error` is terminal and reached only through
/// [`EngineLifecycle::set_error_state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnginePhase {
    Constructed,
    PreInitLocked,
    InitLocked,
    Load,
    PostLoad,
    Active,
    PreUnload,
    Unload,
    PostUnload,
    Destroyed,
    Error,
}

/// Flags the Engine Host passes into load/unload phases (suspend/resume
/// style transitions). Opaque to the driver, interpreted by participants.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PhaseFlags(pub u32);

impl PhaseFlags {
    pub const NONE: PhaseFlags = PhaseFlags(0);
}

/// Device-wide lock shared by sibling engines. Locked phases of different
/// engines exclude each other; unlocked phases never touch it.
#[derive(Default)]
pub struct DeviceLock {
    inner: Mutex<()>,
}

impl DeviceLock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.inner.lock().unwrap()
    }
}

/// Phase hooks an engine exposes to the lifecycle driver. Every hook has a
/// no-op default so an engine only implements the phases it cares about.
pub trait EnginePhaseParticipant {
    fn engine_name(&self) -> &'static str {
        "engine"
    }

    /// Whether the engine exists at all on this device variant. Consulted
    /// once, before the first phase.
    fn is_present(&self) -> bool {
        true
    }

    /// Notification that the engine declared itself absent; all later
    /// phases become no-ops.
    fn init_missing(&mut self) {}

    fn state_pre_init_locked(&mut self) -> CcResult<()> {
        Ok(())
    }

    fn state_pre_init_unlocked(&mut self) -> CcResult<()> {
        Ok(())
    }

    fn state_init_locked(&mut self) -> CcResult<()> {
        Ok(())
    }

    fn state_init_unlocked(&mut self) -> CcResult<()> {
        Ok(())
    }

    fn state_pre_load(&mut self, _flags: PhaseFlags) -> CcResult<()> {
        Ok(())
    }

    fn state_load(&mut self, _flags: PhaseFlags) -> CcResult<()> {
        Ok(())
    }

    fn state_post_load(&mut self, _flags: PhaseFlags) -> CcResult<()> {
        Ok(())
    }

    fn state_pre_unload(&mut self, _flags: PhaseFlags) -> CcResult<()> {
        Ok(())
    }

    fn state_unload(&mut self, _flags: PhaseFlags) -> CcResult<()> {
        Ok(())
    }

    fn state_post_unload(&mut self, _flags: PhaseFlags) -> CcResult<()> {
        Ok(())
    }

    /// Final teardown. Must release everything even after a partial init,
    /// so it cannot fail.
    fn state_destroy(&mut self) {}

    /// Out-of-band notification that the host forced the error state.
    fn set_error_state(&mut self) {}
}

/// Drives one participant through the ordered phases.
///
/// Forward phases run only in order and only while the engine is healthy;
/// after [`set_error_state`](Self::set_error_state) they become no-ops.
/// Teardown phases and destroy always run their hooks so no resource or
/// secret survives an error path.
pub struct EngineLifecycle<P: EnginePhaseParticipant> {
    participant: P,
    device_lock: Arc<DeviceLock>,
    /// Position in the ordered phase sequence; `phase()` reports `Error`
    /// instead while the error flag is set
    position: EnginePhase,
    present: bool,
    presence_checked: bool,
    errored: bool,
}

impl<P: EnginePhaseParticipant> EngineLifecycle<P> {
    pub fn new(participant: P, device_lock: Arc<DeviceLock>) -> Self {
        Self {
            participant,
            device_lock,
            position: EnginePhase::Constructed,
            present: true,
            presence_checked: false,
            errored: false,
        }
    }

    /// The externally visible lifecycle state.
    pub fn phase(&self) -> EnginePhase {
        if self.errored && self.position != EnginePhase::Destroyed {
            EnginePhase::Error
        } else {
            self.position
        }
    }

    /// Whether the engine declared itself present for this variant.
    pub fn is_present(&self) -> bool {
        self.present
    }

    pub fn participant(&self) -> &P {
        &self.participant
    }

    pub fn participant_mut(&mut self) -> &mut P {
        &mut self.participant
    }

    /// Force the terminal error state from any phase. In-flight work is not
    /// aborted; new forward phases become no-ops and teardown still runs.
    /// Subsequent calls are no-ops.
    pub fn set_error_state(&mut self) {
        if self.errored {
            return;
        }
        log::warn!(
            "{}: forced into error state during {:?}",
            self.participant.engine_name(),
            self.position
        );
        self.errored = true;
        self.participant.set_error_state();
    }

    pub fn state_pre_init(&mut self) -> CcResult<()> {
        if self.skip_if_errored(EnginePhase::PreInitLocked) {
            return Ok(());
        }
        self.expect(EnginePhase::Constructed, "state_pre_init")?;

        if !self.presence_checked {
            self.presence_checked = true;
            if !self.participant.is_present() {
                self.present = false;
                self.participant.init_missing();
                log::info!(
                    "{}: not present on this variant, phases become no-ops",
                    self.participant.engine_name()
                );
            }
        }

        self.forward_locked(EnginePhase::PreInitLocked, |p| p.state_pre_init_locked())?;
        self.forward(|p| p.state_pre_init_unlocked())?;
        Ok(())
    }

    pub fn state_init(&mut self) -> CcResult<()> {
        if self.skip_if_errored(EnginePhase::InitLocked) {
            return Ok(());
        }
        self.expect(EnginePhase::PreInitLocked, "state_init")?;
        self.forward_locked(EnginePhase::InitLocked, |p| p.state_init_locked())?;
        self.forward(|p| p.state_init_unlocked())?;
        Ok(())
    }

    pub fn state_load(&mut self, flags: PhaseFlags) -> CcResult<()> {
        if self.skip_if_errored(EnginePhase::Load) {
            return Ok(());
        }
        self.expect(EnginePhase::InitLocked, "state_load")?;
        self.forward(|p| p.state_pre_load(flags))?;
        self.advance_forward(EnginePhase::Load, |p| p.state_load(flags))
    }

    pub fn state_post_load(&mut self, flags: PhaseFlags) -> CcResult<()> {
        if self.skip_if_errored(EnginePhase::PostLoad) {
            return Ok(());
        }
        self.expect(EnginePhase::Load, "state_post_load")?;
        self.advance_forward(EnginePhase::PostLoad, |p| p.state_post_load(flags))?;
        if !self.errored {
            self.position = EnginePhase::Active;
        }
        Ok(())
    }

    pub fn state_pre_unload(&mut self, flags: PhaseFlags) -> CcResult<()> {
        if !self.errored {
            self.expect(EnginePhase::Active, "state_pre_unload")?;
        }
        self.advance_teardown(EnginePhase::PreUnload, |p| p.state_pre_unload(flags))
    }

    pub fn state_unload(&mut self, flags: PhaseFlags) -> CcResult<()> {
        if !self.errored {
            self.expect(EnginePhase::PreUnload, "state_unload")?;
        }
        self.advance_teardown(EnginePhase::Unload, |p| p.state_unload(flags))
    }

    pub fn state_post_unload(&mut self, flags: PhaseFlags) -> CcResult<()> {
        if !self.errored {
            self.expect(EnginePhase::Unload, "state_post_unload")?;
        }
        self.advance_teardown(EnginePhase::PostUnload, |p| p.state_post_unload(flags))
    }

    /// Final teardown. Runs from any position, including after an error or
    /// a partial init; the destroy hook releases and zeroizes regardless.
    pub fn state_destroy(&mut self) {
        if self.position == EnginePhase::Destroyed {
            return;
        }
        if self.present {
            self.participant.state_destroy();
        }
        self.position = EnginePhase::Destroyed;
        log::info!("{}: destroyed", self.participant.engine_name());
    }

    /// After the error state, forward phases become no-ops that keep pace
    /// with the host's phase sequence so teardown lands where it expects.
    fn skip_if_errored(&mut self, target: EnginePhase) -> bool {
        if self.errored {
            self.position = target;
            true
        } else {
            false
        }
    }

    fn expect(&self, expected: EnginePhase, operation: &'static str) -> CcResult<()> {
        if self.position == expected {
            Ok(())
        } else {
            Err(CcError::UnsupportedOperation { operation })
        }
    }

    /// Run a forward hook that does not advance the position.
    fn forward(&mut self, hook: impl FnOnce(&mut P) -> CcResult<()>) -> CcResult<()> {
        if !self.present || self.errored {
            return Ok(());
        }
        hook(&mut self.participant).map_err(|err| {
            self.errored = true;
            self.participant.set_error_state();
            err
        })
    }

    /// Run a forward hook under the device lock and advance on completion.
    fn forward_locked(
        &mut self,
        next: EnginePhase,
        hook: impl FnOnce(&mut P) -> CcResult<()>,
    ) -> CcResult<()> {
        let lock = self.device_lock.clone();
        let result = if !self.present || self.errored {
            Ok(())
        } else {
            let _guard = lock.lock();
            hook(&mut self.participant)
        };
        match result {
            Ok(()) => {
                self.position = next;
                Ok(())
            }
            Err(err) => {
                // A locked-phase failure is non-recoverable for this engine.
                self.errored = true;
                self.participant.set_error_state();
                Err(err)
            }
        }
    }

    /// Run an unlocked forward hook and advance on completion.
    fn advance_forward(
        &mut self,
        next: EnginePhase,
        hook: impl FnOnce(&mut P) -> CcResult<()>,
    ) -> CcResult<()> {
        let result = if !self.present || self.errored {
            Ok(())
        } else {
            hook(&mut self.participant)
        };
        match result {
            Ok(()) => {
                self.position = next;
                Ok(())
            }
            Err(err) => {
                self.errored = true;
                self.participant.set_error_state();
                Err(err)
            }
        }
    }

    /// Teardown hooks run even in the error state so resources and secrets
    /// are always released; only a missing engine skips them.
    fn advance_teardown(
        &mut self,
        next: EnginePhase,
        hook: impl FnOnce(&mut P) -> CcResult<()>,
    ) -> CcResult<()> {
        let result = if !self.present {
            Ok(())
        } else {
            hook(&mut self.participant)
        };
        self.position = next;
        result
    }
}
