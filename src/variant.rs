//! Device variant classification and property flags
//!
//! The Engine Host hands this crate an opaque classification word at attach.
//! [`DeviceVariant::resolve`] turns it into the (silicon generation,
//! privilege role) pair everything else dispatches on, exactly once; the
//! variant is immutable afterwards.

use std::sync::atomic::{AtomicBool, Ordering};

/// Silicon generation of the attached device, as far as confidential compute
/// is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SiliconGeneration {
    /// First generation with the confidential-compute block; key rotation is
    /// driven externally only
    Cc1,
    /// Adds internal key rotation and a second bank of copy-engine key spaces
    Cc2,
    /// No confidential-compute hardware
    Unsupported,
}

/// Virtualization role of the entity hosting this code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrivilegeRole {
    /// Privileged host driver: attests, derives, rotates
    HostKernel,
    /// Guest virtual function: receives keys from the host, never attests or
    /// rotates on its own
    GuestVf,
}

/// Immutable (generation, role) pair resolved once per device attach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceVariant {
    pub silicon: SiliconGeneration,
    pub role: PrivilegeRole,
}

/// Layout of the raw classification word.
///
/// Bits [7:0] carry the silicon generation code from the build-time
/// classification tables; bit 8 is set for a guest virtual function. All
/// other bits are reserved and ignored.
const SILICON_CODE_MASK: u32 = 0x0000_00ff;
const ROLE_VF_BIT: u32 = 0x0000_0100;

const SILICON_CODE_CC1: u32 = 0x41;
const SILICON_CODE_CC2: u32 = 0x42;

impl DeviceVariant {
    /// Resolve a raw classification word to a variant.
    ///
    /// Pure, total and deterministic: every input maps to a variant, and
    /// unmapped silicon codes resolve to [`SiliconGeneration::Unsupported`]
    /// so they reach the fail-fast dispatch stub rather than a partially
    /// working engine.
    pub fn resolve(raw_bits: u32) -> DeviceVariant {
        let silicon = match raw_bits & SILICON_CODE_MASK {
            SILICON_CODE_CC1 => SiliconGeneration::Cc1,
            SILICON_CODE_CC2 => SiliconGeneration::Cc2,
            _ => SiliconGeneration::Unsupported,
        };
        let role = if raw_bits & ROLE_VF_BIT != 0 {
            PrivilegeRole::GuestVf
        } else {
            PrivilegeRole::HostKernel
        };
        DeviceVariant { silicon, role }
    }

    pub fn is_host_kernel(&self) -> bool {
        self.role == PrivilegeRole::HostKernel
    }

    pub fn is_guest(&self) -> bool {
        self.role == PrivilegeRole::GuestVf
    }
}

/// Raw classification words for the known variants, exported for embedders
/// whose classification tables are generated against this crate.
pub mod raw {
    use super::{ROLE_VF_BIT, SILICON_CODE_CC1, SILICON_CODE_CC2};

    pub const CC1_HOST: u32 = SILICON_CODE_CC1;
    pub const CC1_GUEST: u32 = SILICON_CODE_CC1 | ROLE_VF_BIT;
    pub const CC2_HOST: u32 = SILICON_CODE_CC2;
    pub const CC2_GUEST: u32 = SILICON_CODE_CC2 | ROLE_VF_BIT;
}

/// Fixed named-boolean property surface for the engine.
///
/// Computed from the device variant at construction and read-only from then
/// on, with one exception: the rotation controller owns the three rotation
/// flags and may flip them after attach. Those are atomics so collaborators
/// can query concurrently with a rotation-policy update; everything else is
/// plain data.
#[derive(Debug)]
pub struct PropertyFlags {
    missing: bool,
    cc_enabled: bool,
    apm_enabled: bool,
    devtools_mode: bool,
    spdm_enabled: bool,
    multi_gpu_protected_mode: bool,
    ready_check: bool,
    early_init: bool,
    rotation_supported: AtomicBool,
    rotation_enabled: AtomicBool,
    internal_rotation_enabled: AtomicBool,
}

impl PropertyFlags {
    /// Compute the construction-time flag set for a variant.
    pub fn for_variant(variant: DeviceVariant) -> Self {
        let capable = variant.silicon != SiliconGeneration::Unsupported;
        PropertyFlags {
            missing: !capable,
            cc_enabled: capable,
            apm_enabled: false,
            devtools_mode: false,
            spdm_enabled: capable && variant.is_host_kernel(),
            multi_gpu_protected_mode: false,
            ready_check: capable,
            early_init: false,
            rotation_supported: AtomicBool::new(false),
            rotation_enabled: AtomicBool::new(false),
            internal_rotation_enabled: AtomicBool::new(false),
        }
    }

    pub fn is_missing(&self) -> bool {
        self.missing
    }

    pub fn cc_enabled(&self) -> bool {
        self.cc_enabled
    }

    pub fn apm_enabled(&self) -> bool {
        self.apm_enabled
    }

    pub fn devtools_mode(&self) -> bool {
        self.devtools_mode
    }

    pub fn spdm_enabled(&self) -> bool {
        self.spdm_enabled
    }

    pub fn multi_gpu_protected_mode(&self) -> bool {
        self.multi_gpu_protected_mode
    }

    pub fn ready_check(&self) -> bool {
        self.ready_check
    }

    pub fn early_init(&self) -> bool {
        self.early_init
    }

    pub fn rotation_supported(&self) -> bool {
        self.rotation_supported.load(Ordering::Acquire)
    }

    pub fn rotation_enabled(&self) -> bool {
        self.rotation_enabled.load(Ordering::Acquire)
    }

    pub fn internal_rotation_enabled(&self) -> bool {
        self.internal_rotation_enabled.load(Ordering::Acquire)
    }

    // Rotation-controller-only mutators. `enabled` implies `supported`, so
    // the setters keep that invariant instead of trusting the caller.

    pub(crate) fn set_rotation_supported(&self, supported: bool) {
        self.rotation_supported.store(supported, Ordering::Release);
        if !supported {
            self.rotation_enabled.store(false, Ordering::Release);
        }
    }

    pub(crate) fn set_rotation_enabled(&self, enabled: bool) {
        if enabled && !self.rotation_supported() {
            return;
        }
        self.rotation_enabled.store(enabled, Ordering::Release);
    }

    pub(crate) fn set_internal_rotation_enabled(&self, enabled: bool) {
        self.internal_rotation_enabled
            .store(enabled, Ordering::Release);
    }
}
