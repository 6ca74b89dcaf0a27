//! Secure Memory Handling
//!
//! Containers and scope helpers for bytes that must never outlive their use:
//! the export master key, the session seed secret, and any transient copy of
//! derived key material. Everything here zeroizes on release, so a buffer
//! holding secret bytes is cleared on every exit path, including panics.

use std::fmt;
use std::ops::{Deref, DerefMut};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// A byte container for secret material that is zeroized when dropped.
///
/// Used for the export master key and the session seed secret, whose sizes
/// are fixed by the firmware contract but opaque to this crate. The Debug
/// impl never prints the contents.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecureBytes {
    bytes: Vec<u8>,
}

impl SecureBytes {
    /// Create a new container holding a copy of `data`
    pub fn new(data: &[u8]) -> Self {
        Self {
            bytes: data.to_vec(),
        }
    }

    /// Read-only access to the protected bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Number of bytes held
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the container is empty
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Zeroize the contents in place and drop them, keeping the container
    pub fn clear(&mut self) {
        self.bytes.zeroize();
        self.bytes.clear();
    }
}

impl From<Vec<u8>> for SecureBytes {
    fn from(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }
}

impl Deref for SecureBytes {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.bytes
    }
}

impl DerefMut for SecureBytes {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.bytes
    }
}

impl fmt::Debug for SecureBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecureBytes({} bytes)", self.bytes.len())
    }
}

/// Run `f` over mutable secret data, zeroizing the data when the scope ends.
///
/// The zeroization happens in a drop guard, so it also runs if `f` panics or
/// returns early through `?`.
pub fn with_secure_scope<T, F, R>(data: &mut T, f: F) -> R
where
    T: Zeroize,
    F: FnOnce(&mut T) -> R,
{
    struct ScopeGuard<'a, T: Zeroize> {
        data: &'a mut T,
    }

    impl<T: Zeroize> Drop for ScopeGuard<'_, T> {
        fn drop(&mut self) {
            self.data.zeroize();
        }
    }

    let guard = ScopeGuard { data };
    f(guard.data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secure_bytes_clear() {
        let mut secret = SecureBytes::new(&[0xAA; 32]);
        assert_eq!(secret.len(), 32);
        secret.clear();
        assert!(secret.is_empty());
    }

    #[test]
    fn test_debug_never_prints_contents() {
        let secret = SecureBytes::new(&[0xAA, 0xBB, 0xCC]);
        let rendered = format!("{:?}", secret);
        assert!(!rendered.contains("aa"));
        assert!(!rendered.contains("AA"));
        assert!(rendered.contains("3 bytes"));
    }

    #[test]
    fn test_with_secure_scope_zeroizes_on_exit() {
        let mut sensitive = vec![0x5Au8; 16];
        let sum: u32 = with_secure_scope(&mut sensitive, |data| {
            data.iter().map(|b| u32::from(*b)).sum()
        });
        assert_eq!(sum, 0x5A * 16);
        assert!(sensitive.iter().all(|b| *b == 0));
    }

    #[test]
    fn test_with_secure_scope_zeroizes_on_panic() {
        let mut sensitive = vec![0x5Au8; 16];
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            with_secure_scope(&mut sensitive, |_| panic!("mid-scope failure"));
        }));
        assert!(result.is_err());
        assert!(sensitive.iter().all(|b| *b == 0));
    }
}
