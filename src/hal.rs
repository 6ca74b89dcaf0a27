//! Variant-dispatched hardware abstraction
//!
//! One [`CcHal`] implementation exists per (silicon generation × privilege
//! role). [`hal_for`] binds a variant to its implementation exactly once, at
//! engine construction; after that no component branches on the variant
//! again, it just calls through the trait object. Unmapped combinations get
//! [`StubHal`], which fails fast, except where a safe no-op default is
//! defined (rotation support and the boolean predicates default to
//! disabled/false rather than error).

use crate::error::{CcError, CcResult};
use crate::keystore::ids::{
    ChannelDescriptor, EngineId, GlobalKeyId, KeyDirection, KeyPair, KeySpace, LocalKeyId,
};
use crate::variant::{DeviceVariant, PrivilegeRole, SiliconGeneration};

/// Function bindings selected by device variant.
///
/// All queries are pure: they read the descriptor arguments and nothing
/// else, so every path is independently testable.
pub trait CcHal: Send + Sync {
    /// Implementation name for logs
    fn name(&self) -> &'static str;

    /// Whether the silicon carries the confidential-compute block
    fn is_gpu_cc_capable(&self) -> bool;

    /// Whether this variant performs an attested session handshake
    fn is_spdm_enabled(&self) -> bool;

    /// Whether devtools debug mode is reachable on this variant
    fn is_debug_mode_enabled(&self) -> bool;

    /// Whether the rotation controller may ever enable rotation here
    fn supports_key_rotation(&self) -> bool;

    /// Whether the silicon can rotate keys without an external trigger
    fn supports_internal_key_rotation(&self) -> bool;

    /// Highest valid logical-copy-engine key-space index
    fn max_lce_key_space_index(&self) -> CcResult<u8>;

    /// Range/class validation; every key-store entry point calls this first
    fn is_valid_global_key_id(&self, id: GlobalKeyId) -> bool;

    /// Whether the key belongs to the kernel trust domain
    fn global_key_is_kernel_priv(&self, id: GlobalKeyId) -> bool;

    /// Whether the key is owned by the unified-memory driver
    fn global_key_is_uvm_key(&self, id: GlobalKeyId) -> bool;

    fn key_space_from_channel(&self, channel: &ChannelDescriptor) -> CcResult<KeySpace>;

    fn lce_key_id_from_channel(
        &self,
        channel: &ChannelDescriptor,
        direction: KeyDirection,
    ) -> CcResult<GlobalKeyId>;

    fn engine_id_from_key_space(&self, key_space: KeySpace) -> CcResult<EngineId>;

    fn key_pair_by_channel(&self, channel: &ChannelDescriptor) -> CcResult<KeyPair>;

    fn key_pair_for_key_space(&self, key_space: KeySpace) -> CcResult<KeyPair>;
}

/// Resolve the function bindings for a variant. Called once per attach.
pub fn hal_for(variant: DeviceVariant) -> &'static dyn CcHal {
    match (variant.silicon, variant.role) {
        (SiliconGeneration::Cc1, PrivilegeRole::HostKernel) => &Cc1HostHal,
        (SiliconGeneration::Cc2, PrivilegeRole::HostKernel) => &Cc2HostHal,
        (SiliconGeneration::Cc1, PrivilegeRole::GuestVf) => &Cc1GuestHal,
        (SiliconGeneration::Cc2, PrivilegeRole::GuestVf) => &Cc2GuestHal,
        (SiliconGeneration::Unsupported, _) => &StubHal,
    }
}

/// Generation parameters shared between the host and guest bindings of the
/// same silicon. The role axis never changes the taxonomy, only who may
/// attest and rotate.
mod taxonomy {
    use super::*;

    pub(super) struct GenParams {
        pub max_lce_index: u8,
        pub scrubber_key: bool,
    }

    pub(super) const CC1: GenParams = GenParams {
        max_lce_index: 7,
        scrubber_key: false,
    };

    pub(super) const CC2: GenParams = GenParams {
        max_lce_index: 15,
        scrubber_key: true,
    };

    pub(super) fn is_valid_global_key_id(p: &GenParams, id: GlobalKeyId) -> bool {
        match id.space {
            KeySpace::Gsp => matches!(
                id.key,
                LocalKeyId::HostToDeviceKernel | LocalKeyId::DeviceToHostKernel
            ),
            KeySpace::Sec2 => id.key != LocalKeyId::Scrubber,
            KeySpace::Lce(n) => {
                if n > p.max_lce_index {
                    return false;
                }
                id.key != LocalKeyId::Scrubber || p.scrubber_key
            }
        }
    }

    pub(super) fn key_space_from_channel(
        p: &GenParams,
        channel: &ChannelDescriptor,
    ) -> CcResult<KeySpace> {
        match channel.engine {
            EngineId::Gsp => Ok(KeySpace::Gsp),
            EngineId::Sec2 => Ok(KeySpace::Sec2),
            EngineId::Ce(n) if n <= p.max_lce_index => Ok(KeySpace::Lce(n)),
            EngineId::Ce(n) => Err(CcError::invalid_identifier(
                format!("channel {:#x} on ce{}", channel.handle, n),
                "copy engine index beyond this silicon's key spaces",
            )),
        }
    }

    pub(super) fn lce_key_id_from_channel(
        p: &GenParams,
        channel: &ChannelDescriptor,
        direction: KeyDirection,
    ) -> CcResult<GlobalKeyId> {
        let space = match key_space_from_channel(p, channel)? {
            s @ KeySpace::Lce(_) => s,
            other => {
                return Err(CcError::invalid_identifier(
                    format!("channel {:#x} on {}", channel.handle, other),
                    "channel is not scheduled on a copy engine",
                ))
            }
        };
        let key = match (channel.kernel_mode, direction) {
            (false, KeyDirection::HostToDevice) => LocalKeyId::HostToDeviceUser,
            (false, KeyDirection::DeviceToHost) => LocalKeyId::DeviceToHostUser,
            (true, KeyDirection::HostToDevice) => LocalKeyId::HostToDeviceKernel,
            (true, KeyDirection::DeviceToHost) => LocalKeyId::DeviceToHostKernel,
        };
        Ok(GlobalKeyId::new(space, key))
    }

    pub(super) fn engine_id_from_key_space(
        p: &GenParams,
        key_space: KeySpace,
    ) -> CcResult<EngineId> {
        match key_space {
            KeySpace::Gsp => Ok(EngineId::Gsp),
            KeySpace::Sec2 => Ok(EngineId::Sec2),
            KeySpace::Lce(n) if n <= p.max_lce_index => Ok(EngineId::Ce(n)),
            KeySpace::Lce(n) => Err(CcError::invalid_identifier(
                format!("lce{}", n),
                "key space index beyond this silicon's copy engines",
            )),
        }
    }

    pub(super) fn key_pair_by_channel(
        p: &GenParams,
        channel: &ChannelDescriptor,
    ) -> CcResult<KeyPair> {
        let space = key_space_from_channel(p, channel)?;
        let (h2d, d2h) = match space {
            // The secure processor only talks to the kernel trust domain.
            KeySpace::Gsp => (
                LocalKeyId::HostToDeviceKernel,
                LocalKeyId::DeviceToHostKernel,
            ),
            _ if channel.kernel_mode => (
                LocalKeyId::HostToDeviceKernel,
                LocalKeyId::DeviceToHostKernel,
            ),
            _ => (LocalKeyId::HostToDeviceUser, LocalKeyId::DeviceToHostUser),
        };
        Ok(KeyPair {
            h2d: GlobalKeyId::new(space, h2d),
            d2h: GlobalKeyId::new(space, d2h),
        })
    }

    pub(super) fn key_pair_for_key_space(p: &GenParams, key_space: KeySpace) -> CcResult<KeyPair> {
        engine_id_from_key_space(p, key_space)?;
        let (h2d, d2h) = match key_space {
            KeySpace::Gsp => (
                LocalKeyId::HostToDeviceKernel,
                LocalKeyId::DeviceToHostKernel,
            ),
            _ => (LocalKeyId::HostToDeviceUser, LocalKeyId::DeviceToHostUser),
        };
        Ok(KeyPair {
            h2d: GlobalKeyId::new(key_space, h2d),
            d2h: GlobalKeyId::new(key_space, d2h),
        })
    }
}

macro_rules! delegate_taxonomy {
    ($params:expr) => {
        fn max_lce_key_space_index(&self) -> CcResult<u8> {
            Ok($params.max_lce_index)
        }

        fn is_valid_global_key_id(&self, id: GlobalKeyId) -> bool {
            taxonomy::is_valid_global_key_id(&$params, id)
        }

        fn global_key_is_kernel_priv(&self, id: GlobalKeyId) -> bool {
            taxonomy::is_valid_global_key_id(&$params, id) && id.key.is_kernel()
        }

        fn global_key_is_uvm_key(&self, id: GlobalKeyId) -> bool {
            taxonomy::is_valid_global_key_id(&$params, id)
                && matches!(id.space, KeySpace::Lce(_))
                && matches!(
                    id.key,
                    LocalKeyId::HostToDeviceKernel | LocalKeyId::DeviceToHostKernel
                )
        }

        fn key_space_from_channel(&self, channel: &ChannelDescriptor) -> CcResult<KeySpace> {
            taxonomy::key_space_from_channel(&$params, channel)
        }

        fn lce_key_id_from_channel(
            &self,
            channel: &ChannelDescriptor,
            direction: KeyDirection,
        ) -> CcResult<GlobalKeyId> {
            taxonomy::lce_key_id_from_channel(&$params, channel, direction)
        }

        fn engine_id_from_key_space(&self, key_space: KeySpace) -> CcResult<EngineId> {
            taxonomy::engine_id_from_key_space(&$params, key_space)
        }

        fn key_pair_by_channel(&self, channel: &ChannelDescriptor) -> CcResult<KeyPair> {
            taxonomy::key_pair_by_channel(&$params, channel)
        }

        fn key_pair_for_key_space(&self, key_space: KeySpace) -> CcResult<KeyPair> {
            taxonomy::key_pair_for_key_space(&$params, key_space)
        }
    };
}

/// First-generation silicon, privileged host driver.
pub struct Cc1HostHal;

impl CcHal for Cc1HostHal {
    fn name(&self) -> &'static str {
        "cc1-host"
    }

    fn is_gpu_cc_capable(&self) -> bool {
        true
    }

    fn is_spdm_enabled(&self) -> bool {
        true
    }

    fn is_debug_mode_enabled(&self) -> bool {
        false
    }

    fn supports_key_rotation(&self) -> bool {
        true
    }

    fn supports_internal_key_rotation(&self) -> bool {
        false
    }

    delegate_taxonomy!(taxonomy::CC1);
}

/// Second-generation silicon, privileged host driver.
pub struct Cc2HostHal;

impl CcHal for Cc2HostHal {
    fn name(&self) -> &'static str {
        "cc2-host"
    }

    fn is_gpu_cc_capable(&self) -> bool {
        true
    }

    fn is_spdm_enabled(&self) -> bool {
        true
    }

    fn is_debug_mode_enabled(&self) -> bool {
        false
    }

    fn supports_key_rotation(&self) -> bool {
        true
    }

    fn supports_internal_key_rotation(&self) -> bool {
        true
    }

    delegate_taxonomy!(taxonomy::CC2);
}

/// Guest virtual function on first-generation silicon. Shares the host
/// taxonomy; attestation and rotation stay with the host.
pub struct Cc1GuestHal;

impl CcHal for Cc1GuestHal {
    fn name(&self) -> &'static str {
        "cc1-guest"
    }

    fn is_gpu_cc_capable(&self) -> bool {
        true
    }

    fn is_spdm_enabled(&self) -> bool {
        false
    }

    fn is_debug_mode_enabled(&self) -> bool {
        false
    }

    fn supports_key_rotation(&self) -> bool {
        false
    }

    fn supports_internal_key_rotation(&self) -> bool {
        false
    }

    delegate_taxonomy!(taxonomy::CC1);
}

/// Guest virtual function on second-generation silicon.
pub struct Cc2GuestHal;

impl CcHal for Cc2GuestHal {
    fn name(&self) -> &'static str {
        "cc2-guest"
    }

    fn is_gpu_cc_capable(&self) -> bool {
        true
    }

    fn is_spdm_enabled(&self) -> bool {
        false
    }

    fn is_debug_mode_enabled(&self) -> bool {
        false
    }

    fn supports_key_rotation(&self) -> bool {
        false
    }

    fn supports_internal_key_rotation(&self) -> bool {
        false
    }

    delegate_taxonomy!(taxonomy::CC2);
}

/// Fail-fast bindings for silicon without the confidential-compute block.
/// Predicates answer false so presence checks short-circuit cleanly; any
/// operation that would touch keys fails `UnsupportedOperation`.
pub struct StubHal;

impl StubHal {
    fn unsupported<T>(operation: &'static str) -> CcResult<T> {
        Err(CcError::UnsupportedOperation { operation })
    }
}

impl CcHal for StubHal {
    fn name(&self) -> &'static str {
        "unsupported"
    }

    fn is_gpu_cc_capable(&self) -> bool {
        false
    }

    fn is_spdm_enabled(&self) -> bool {
        false
    }

    fn is_debug_mode_enabled(&self) -> bool {
        false
    }

    fn supports_key_rotation(&self) -> bool {
        false
    }

    fn supports_internal_key_rotation(&self) -> bool {
        false
    }

    fn max_lce_key_space_index(&self) -> CcResult<u8> {
        Self::unsupported("max_lce_key_space_index")
    }

    fn is_valid_global_key_id(&self, _id: GlobalKeyId) -> bool {
        false
    }

    fn global_key_is_kernel_priv(&self, _id: GlobalKeyId) -> bool {
        false
    }

    fn global_key_is_uvm_key(&self, _id: GlobalKeyId) -> bool {
        false
    }

    fn key_space_from_channel(&self, _channel: &ChannelDescriptor) -> CcResult<KeySpace> {
        Self::unsupported("key_space_from_channel")
    }

    fn lce_key_id_from_channel(
        &self,
        _channel: &ChannelDescriptor,
        _direction: KeyDirection,
    ) -> CcResult<GlobalKeyId> {
        Self::unsupported("lce_key_id_from_channel")
    }

    fn engine_id_from_key_space(&self, _key_space: KeySpace) -> CcResult<EngineId> {
        Self::unsupported("engine_id_from_key_space")
    }

    fn key_pair_by_channel(&self, _channel: &ChannelDescriptor) -> CcResult<KeyPair> {
        Self::unsupported("key_pair_by_channel")
    }

    fn key_pair_for_key_space(&self, _key_space: KeySpace) -> CcResult<KeyPair> {
        Self::unsupported("key_pair_for_key_space")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variant::raw;

    fn user_channel(engine: EngineId) -> ChannelDescriptor {
        ChannelDescriptor {
            handle: 0x1a0,
            engine,
            kernel_mode: false,
        }
    }

    #[test]
    fn test_hal_binding_per_variant() {
        assert_eq!(hal_for(DeviceVariant::resolve(raw::CC1_HOST)).name(), "cc1-host");
        assert_eq!(hal_for(DeviceVariant::resolve(raw::CC2_HOST)).name(), "cc2-host");
        assert_eq!(hal_for(DeviceVariant::resolve(raw::CC2_GUEST)).name(), "cc2-guest");
        assert_eq!(hal_for(DeviceVariant::resolve(0x7)).name(), "unsupported");
    }

    #[test]
    fn test_generation_key_space_ranges() {
        let cc1 = hal_for(DeviceVariant::resolve(raw::CC1_HOST));
        let cc2 = hal_for(DeviceVariant::resolve(raw::CC2_HOST));

        let lce9_user = GlobalKeyId::new(KeySpace::Lce(9), LocalKeyId::HostToDeviceUser);
        assert!(!cc1.is_valid_global_key_id(lce9_user));
        assert!(cc2.is_valid_global_key_id(lce9_user));

        let scrubber = GlobalKeyId::new(KeySpace::Lce(0), LocalKeyId::Scrubber);
        assert!(!cc1.is_valid_global_key_id(scrubber));
        assert!(cc2.is_valid_global_key_id(scrubber));
    }

    #[test]
    fn test_gsp_space_is_kernel_only() {
        let hal = hal_for(DeviceVariant::resolve(raw::CC2_HOST));
        assert!(!hal.is_valid_global_key_id(GlobalKeyId::new(
            KeySpace::Gsp,
            LocalKeyId::HostToDeviceUser
        )));
        let gsp_kernel = GlobalKeyId::new(KeySpace::Gsp, LocalKeyId::DeviceToHostKernel);
        assert!(hal.is_valid_global_key_id(gsp_kernel));
        assert!(hal.global_key_is_kernel_priv(gsp_kernel));
        assert!(!hal.global_key_is_uvm_key(gsp_kernel));
    }

    #[test]
    fn test_uvm_keys_are_kernel_lce_keys() {
        let hal = hal_for(DeviceVariant::resolve(raw::CC2_HOST));
        let id = GlobalKeyId::new(KeySpace::Lce(2), LocalKeyId::DeviceToHostKernel);
        assert!(hal.global_key_is_uvm_key(id));
        let id = GlobalKeyId::new(KeySpace::Lce(2), LocalKeyId::DeviceToHostUser);
        assert!(!hal.global_key_is_uvm_key(id));
    }

    #[test]
    fn test_channel_resolution() {
        let hal = hal_for(DeviceVariant::resolve(raw::CC1_HOST));
        let ch = user_channel(EngineId::Ce(3));

        assert_eq!(hal.key_space_from_channel(&ch).unwrap(), KeySpace::Lce(3));
        let id = hal
            .lce_key_id_from_channel(&ch, KeyDirection::DeviceToHost)
            .unwrap();
        assert_eq!(id, GlobalKeyId::new(KeySpace::Lce(3), LocalKeyId::DeviceToHostUser));

        let pair = hal.key_pair_by_channel(&ch).unwrap();
        assert_eq!(pair.h2d.key, LocalKeyId::HostToDeviceUser);
        assert_eq!(pair.d2h.key, LocalKeyId::DeviceToHostUser);
    }

    #[test]
    fn test_channel_beyond_lce_range_is_invalid() {
        let hal = hal_for(DeviceVariant::resolve(raw::CC1_HOST));
        let ch = user_channel(EngineId::Ce(12));
        assert!(matches!(
            hal.key_space_from_channel(&ch),
            Err(CcError::InvalidIdentifier { .. })
        ));
    }

    #[test]
    fn test_non_ce_channel_has_no_lce_key() {
        let hal = hal_for(DeviceVariant::resolve(raw::CC1_HOST));
        let ch = user_channel(EngineId::Sec2);
        assert!(matches!(
            hal.lce_key_id_from_channel(&ch, KeyDirection::HostToDevice),
            Err(CcError::InvalidIdentifier { .. })
        ));
    }

    #[test]
    fn test_guest_shares_taxonomy_but_not_rotation() {
        let guest = hal_for(DeviceVariant::resolve(raw::CC2_GUEST));
        assert!(guest.is_gpu_cc_capable());
        assert!(!guest.supports_key_rotation());
        assert!(!guest.is_spdm_enabled());
        assert!(guest.is_valid_global_key_id(GlobalKeyId::new(
            KeySpace::Lce(10),
            LocalKeyId::HostToDeviceUser
        )));
    }

    #[test]
    fn test_stub_fails_fast() {
        let stub = hal_for(DeviceVariant::resolve(0));
        assert!(!stub.is_gpu_cc_capable());
        assert!(!stub.is_valid_global_key_id(GlobalKeyId::new(
            KeySpace::Sec2,
            LocalKeyId::HostToDeviceUser
        )));
        assert!(matches!(
            stub.key_pair_for_key_space(KeySpace::Sec2),
            Err(CcError::UnsupportedOperation { .. })
        ));
    }
}
