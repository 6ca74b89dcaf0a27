//! Key identifier taxonomy
//!
//! Keys are namespaced into key spaces: one device-wide space for the secure
//! processor, one for the security engine, and one per logical copy engine.
//! Within a space, a local id names the key's direction and trust domain.
//! A `GlobalKeyId` is the (space, local) pair and is what the key store maps
//! to material. Channels and engines resolve to global ids through the
//! variant-dispatched queries on [`crate::hal::CcHal`].

use std::fmt;

/// Namespace a key belongs to: the secure processor, the security engine,
/// or one logical copy engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeySpace {
    /// Secure-processor transport keys, kernel trust domain only
    Gsp,
    /// Security-engine keys
    Sec2,
    /// Per-copy-engine keys, index is the logical copy engine
    Lce(u8),
}

impl KeySpace {
    /// Stable numeric code used in KDF context strings and diagnostics
    pub fn code(self) -> u8 {
        match self {
            KeySpace::Gsp => 0,
            KeySpace::Sec2 => 1,
            KeySpace::Lce(n) => 2 + n,
        }
    }
}

impl fmt::Display for KeySpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeySpace::Gsp => write!(f, "gsp"),
            KeySpace::Sec2 => write!(f, "sec2"),
            KeySpace::Lce(n) => write!(f, "lce{}", n),
        }
    }
}

/// Key name within a key space: direction plus trust domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LocalKeyId {
    HostToDeviceUser,
    DeviceToHostUser,
    HostToDeviceKernel,
    DeviceToHostKernel,
    /// Memory-scrubber key, copy-engine spaces on rotation-capable parts only
    Scrubber,
}

impl LocalKeyId {
    /// Stable numeric code used in KDF context strings and diagnostics
    pub fn code(self) -> u8 {
        match self {
            LocalKeyId::HostToDeviceUser => 0,
            LocalKeyId::DeviceToHostUser => 1,
            LocalKeyId::HostToDeviceKernel => 2,
            LocalKeyId::DeviceToHostKernel => 3,
            LocalKeyId::Scrubber => 4,
        }
    }

    /// Whether this key belongs to the kernel trust domain
    pub fn is_kernel(self) -> bool {
        matches!(
            self,
            LocalKeyId::HostToDeviceKernel | LocalKeyId::DeviceToHostKernel | LocalKeyId::Scrubber
        )
    }
}

impl fmt::Display for LocalKeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LocalKeyId::HostToDeviceUser => "h2d-user",
            LocalKeyId::DeviceToHostUser => "d2h-user",
            LocalKeyId::HostToDeviceKernel => "h2d-kernel",
            LocalKeyId::DeviceToHostKernel => "d2h-kernel",
            LocalKeyId::Scrubber => "scrubber",
        };
        f.write_str(name)
    }
}

/// Traffic direction relative to the host, used when a channel resolves to
/// one key of its pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyDirection {
    HostToDevice,
    DeviceToHost,
}

/// Fully-qualified key identifier: (key space, local id).
///
/// Must pass variant-specific validation before any store lookup; the raw
/// encoding is used for KDF context and log rendering, never as an index
/// without validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GlobalKeyId {
    pub space: KeySpace,
    pub key: LocalKeyId,
}

impl GlobalKeyId {
    pub fn new(space: KeySpace, key: LocalKeyId) -> Self {
        Self { space, key }
    }

    /// Stable 16-bit encoding: key space code in the high byte, local id in
    /// the low byte. Feeds KDF context strings, so it must never change for
    /// an existing id.
    pub fn to_raw(self) -> u16 {
        (u16::from(self.space.code()) << 8) | u16::from(self.key.code())
    }
}

impl fmt::Display for GlobalKeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} (0x{})",
            self.space,
            self.key,
            hex::encode(self.to_raw().to_be_bytes())
        )
    }
}

/// Hardware engine owning a key space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineId {
    Gsp,
    Sec2,
    /// Logical copy engine by index
    Ce(u8),
}

impl fmt::Display for EngineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineId::Gsp => write!(f, "gsp"),
            EngineId::Sec2 => write!(f, "sec2"),
            EngineId::Ce(n) => write!(f, "ce{}", n),
        }
    }
}

/// The caller-visible description of a channel, as handed over by the Engine
/// Host. Only the fields the key taxonomy needs cross into this crate.
#[derive(Debug, Clone, Copy)]
pub struct ChannelDescriptor {
    /// Opaque channel handle, used for logging only
    pub handle: u32,
    /// Engine the channel is scheduled on
    pub engine: EngineId,
    /// Whether the channel was created by a kernel-trust-domain client
    pub kernel_mode: bool,
}

/// The encrypt/decrypt key pair a channel or key space operates with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyPair {
    pub h2d: GlobalKeyId,
    pub d2h: GlobalKeyId,
}

/// Identifier accepted by key-store entry points: a fully-qualified global
/// id, a channel still to be resolved, or a whole engine key space.
#[derive(Debug, Clone, Copy)]
pub enum KeyIdentifier {
    Global(GlobalKeyId),
    Channel {
        channel: ChannelDescriptor,
        key_space: KeySpace,
    },
    EngineKeySpace {
        engine: EngineId,
        key_space: KeySpace,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_encoding_is_stable() {
        let id = GlobalKeyId::new(KeySpace::Lce(3), LocalKeyId::DeviceToHostUser);
        assert_eq!(id.to_raw(), 0x0501);
        let id = GlobalKeyId::new(KeySpace::Gsp, LocalKeyId::HostToDeviceKernel);
        assert_eq!(id.to_raw(), 0x0002);
    }

    #[test]
    fn test_raw_encoding_unique_across_spaces() {
        let mut seen = std::collections::HashSet::new();
        let locals = [
            LocalKeyId::HostToDeviceUser,
            LocalKeyId::DeviceToHostUser,
            LocalKeyId::HostToDeviceKernel,
            LocalKeyId::DeviceToHostKernel,
            LocalKeyId::Scrubber,
        ];
        let mut spaces = vec![KeySpace::Gsp, KeySpace::Sec2];
        spaces.extend((0..16).map(KeySpace::Lce));
        for space in spaces {
            for key in locals {
                assert!(seen.insert(GlobalKeyId::new(space, key).to_raw()));
            }
        }
    }

    #[test]
    fn test_kernel_trust_domain() {
        assert!(LocalKeyId::DeviceToHostKernel.is_kernel());
        assert!(LocalKeyId::Scrubber.is_kernel());
        assert!(!LocalKeyId::HostToDeviceUser.is_kernel());
    }

    #[test]
    fn test_display_rendering() {
        let id = GlobalKeyId::new(KeySpace::Lce(0), LocalKeyId::HostToDeviceUser);
        assert_eq!(id.to_string(), "lce0/h2d-user (0x0200)");
    }
}
