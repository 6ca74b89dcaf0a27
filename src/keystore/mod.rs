/*!
 * Key Store
 *
 * Owns the mapping from key identifiers to key material and the single
 * export master key derived from the session seed. Lookups and derivations
 * run concurrently from data-plane threads; inserts, rotation swaps and
 * teardown take the map exclusively. Secret bytes never leave store-owned
 * storage: callers get a [`KeyView`], a single-use copy that zeroizes on
 * drop.
 */

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{CcError, CcResult};
use crate::hal::CcHal;
use crate::secure_memory::SecureBytes;
use crate::session::SessionBootstrap;

pub mod ids;

#[cfg(test)]
mod tests;

use ids::{
    ChannelDescriptor, EngineId, GlobalKeyId, KeyDirection, KeyPair, KeySpace, LocalKeyId,
};

/// Symmetric key size fixed by the hardware block
pub const KEY_SIZE: usize = 32;

/// IV mask size fixed by the hardware block
pub const IV_MASK_SIZE: usize = 8;

const MASTER_KDF_LABEL: &[u8] = b"cc-export-master-v1";
const KEY_KDF_LABEL: &[u8] = b"cc-channel-key-v1";

/// All local ids a key space could hold; validity is still decided per
/// variant by the HAL.
const ALL_LOCAL_IDS: [LocalKeyId; 5] = [
    LocalKeyId::HostToDeviceUser,
    LocalKeyId::DeviceToHostUser,
    LocalKeyId::HostToDeviceKernel,
    LocalKeyId::DeviceToHostKernel,
    LocalKeyId::Scrubber,
];

/// Lifecycle state of one piece of key material.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    Uninitialized,
    Derived,
    Active,
    RotationPending,
    Retired,
}

/// Trust domain of a caller asking for key material. Kernel-privileged and
/// unified-memory keys are withheld from lesser callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallerClass {
    Kernel,
    Uvm,
    User,
}

/// Key material owned by the store. Secret bytes zeroize when the material
/// is dropped or replaced.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub(crate) struct KeyMaterial {
    secret: [u8; KEY_SIZE],
    iv_mask: [u8; IV_MASK_SIZE],
    #[zeroize(skip)]
    generation: u32,
    #[zeroize(skip)]
    state: KeyState,
}

impl KeyMaterial {
    fn uninitialized() -> Self {
        Self {
            secret: [0; KEY_SIZE],
            iv_mask: [0; IV_MASK_SIZE],
            generation: 0,
            state: KeyState::Uninitialized,
        }
    }
}

/// Single-use copy of key material handed to a consumer. Zeroizes on drop,
/// so programming it into hardware and letting it fall out of scope leaves
/// no secret bytes behind.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct KeyView {
    secret: [u8; KEY_SIZE],
    iv_mask: [u8; IV_MASK_SIZE],
    #[zeroize(skip)]
    id: GlobalKeyId,
    #[zeroize(skip)]
    generation: u32,
    #[zeroize(skip)]
    state: KeyState,
}

impl KeyView {
    fn of(id: GlobalKeyId, material: &KeyMaterial) -> Self {
        Self {
            secret: material.secret,
            iv_mask: material.iv_mask,
            id,
            generation: material.generation,
            state: material.state,
        }
    }

    pub fn id(&self) -> GlobalKeyId {
        self.id
    }

    pub fn secret(&self) -> &[u8; KEY_SIZE] {
        &self.secret
    }

    pub fn iv_mask(&self) -> &[u8; IV_MASK_SIZE] {
        &self.iv_mask
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn state(&self) -> KeyState {
        self.state
    }
}

impl std::fmt::Debug for KeyView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyView")
            .field("id", &self.id.to_string())
            .field("generation", &self.generation)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

/// One retired generation kept decryptable until the data plane signals
/// quiescence through [`KeyStore::release_retired`].
struct RetiredGeneration {
    material: KeyMaterial,
    refs: usize,
}

/// Per-identifier slot. The structure itself enforces the invariant of
/// exactly one Active entry per identifier: `active` is always it, `pending`
/// exists only mid-rotation, `retired` holds prior generations awaiting
/// release.
struct KeySlot {
    active: KeyMaterial,
    pending: Option<KeyMaterial>,
    retired: Vec<RetiredGeneration>,
}

/// The identifier→material mapping plus the export master key.
pub struct KeyStore {
    hal: &'static dyn CcHal,
    /// Set by the engine's error state; blocks new derivations and swaps
    /// without aborting in-flight ones
    halted: Arc<AtomicBool>,
    /// `None` until `init`; lock order is `slots` before `master` everywhere
    slots: RwLock<Option<HashMap<GlobalKeyId, KeySlot>>>,
    master: Mutex<Option<SecureBytes>>,
}

impl KeyStore {
    pub fn new(hal: &'static dyn CcHal, halted: Arc<AtomicBool>) -> Self {
        Self {
            hal,
            halted,
            slots: RwLock::new(None),
            master: Mutex::new(None),
        }
    }

    /// Allocate the mapping and install the export master key from the
    /// session seed. Fails `UnsupportedOperation` when the silicon lacks the
    /// confidential-compute block and `NoSession` when the session
    /// requirement is unmet. A guest session carries no seed; the guest
    /// store starts empty and is fed by the host.
    pub fn init(&self, session: &SessionBootstrap) -> CcResult<()> {
        self.ensure_capable("keystore_init")?;
        if !session.is_ready() {
            return Err(CcError::NoSession {
                operation: "keystore_init",
            });
        }

        let mut slots = self.slots.write().unwrap();
        if slots.is_some() {
            log::debug!("key store already initialized");
            return Ok(());
        }

        if session.is_established() {
            let master = session.with_seed(|seed| derive_master(seed))??;
            *self.master.lock().unwrap() = Some(master);
        }
        *slots = Some(HashMap::new());
        log::info!("key store initialized ({})", self.hal.name());
        Ok(())
    }

    /// Zeroize all material, clear the export master key and release the
    /// mapping. Idempotent, and safe on a store that never finished `init`;
    /// dropping the map zeroizes every secret it holds.
    pub fn deinit(&self) {
        let mut slots = self.slots.write().unwrap();
        if let Some(map) = slots.take() {
            log::info!("key store deinit, dropping {} key slot(s)", map.len());
        }
        drop(slots);
        self.clear_export_master_key();
    }

    /// One-way derivation of fresh material for `id` from the export master
    /// key and the identifier context. Deterministic for identical inputs.
    /// Inserts the result as the Active generation 0 entry; a repeated call
    /// returns the already-active entry.
    pub fn derive_key(&self, id: GlobalKeyId, context: &[u8]) -> CcResult<KeyView> {
        self.ensure_capable("derive_key")?;
        self.ensure_not_halted("derive_key")?;
        self.validate(id)?;

        let mut slots = self.slots.write().unwrap();
        let map = slots.as_mut().ok_or(CcError::NoSession {
            operation: "derive_key",
        })?;

        if let Some(slot) = map.get(&id) {
            return Ok(KeyView::of(id, &slot.active));
        }

        let master = self.master.lock().unwrap();
        let master = master.as_ref().ok_or(CcError::NoSession {
            operation: "derive_key",
        })?;
        let mut material = derive_material(master, id, 0, context)?;
        material.state = KeyState::Active;
        let view = KeyView::of(id, &material);
        map.insert(
            id,
            KeySlot {
                active: material,
                pending: None,
                retired: Vec::new(),
            },
        );
        log::debug!("derived key {} generation 0", id);
        Ok(view)
    }

    /// The Active entry for `id`, or `NotFound`.
    pub fn retrieve_via_key_id(&self, id: GlobalKeyId) -> CcResult<KeyView> {
        self.ensure_capable("retrieve_via_key_id")?;
        self.validate(id)?;
        let slots = self.slots.read().unwrap();
        let map = slots.as_ref().ok_or_else(|| CcError::not_found(id))?;
        map.get(&id)
            .map(|slot| KeyView::of(id, &slot.active))
            .ok_or_else(|| CcError::not_found(id))
    }

    /// The Active entry for the key a channel uses in `direction`.
    pub fn retrieve_via_channel(
        &self,
        channel: &ChannelDescriptor,
        direction: KeyDirection,
    ) -> CcResult<KeyView> {
        self.ensure_capable("retrieve_via_channel")?;
        let pair = self.hal.key_pair_by_channel(channel)?;
        let id = match direction {
            KeyDirection::HostToDevice => pair.h2d,
            KeyDirection::DeviceToHost => pair.d2h,
        };
        self.retrieve_via_key_id(id)
    }

    /// Retrieval gated on the caller's trust domain: kernel-privileged keys
    /// are withheld from user callers, and unified-memory keys from everyone
    /// but the kernel and UVM driver.
    pub fn retrieve_checked(
        &self,
        id: GlobalKeyId,
        caller: CallerClass,
    ) -> CcResult<KeyView> {
        self.ensure_capable("retrieve_checked")?;
        self.validate(id)?;
        let kernel_priv = self.hal.global_key_is_kernel_priv(id);
        let uvm = self.hal.global_key_is_uvm_key(id);
        let allowed = match caller {
            CallerClass::Kernel => true,
            CallerClass::Uvm => uvm || !kernel_priv,
            CallerClass::User => !kernel_priv,
        };
        if !allowed {
            return Err(CcError::invalid_identifier(
                id,
                "caller class is not permitted to retrieve this key",
            ));
        }
        self.retrieve_via_key_id(id)
    }

    /// Batch derivation of every identifier a key space owns, done once at
    /// load. Returns the derived ids.
    pub fn derive_secrets(&self, key_space: KeySpace) -> CcResult<Vec<GlobalKeyId>> {
        self.ensure_capable("derive_secrets")?;
        self.ensure_not_halted("derive_secrets")?;
        self.hal.engine_id_from_key_space(key_space)?;

        let mut derived = Vec::new();
        for local in ALL_LOCAL_IDS {
            let id = GlobalKeyId::new(key_space, local);
            if !self.hal.is_valid_global_key_id(id) {
                continue;
            }
            self.derive_key(id, &[])?;
            derived.push(id);
        }
        log::debug!("derived {} secret(s) for key space {}", derived.len(), key_space);
        Ok(derived)
    }

    /// Batch derivation for one engine's key space, validating that the
    /// engine actually owns it.
    pub fn derive_secrets_for_engine_key_space(
        &self,
        engine: EngineId,
        key_space: KeySpace,
    ) -> CcResult<Vec<GlobalKeyId>> {
        self.ensure_capable("derive_secrets_for_engine_key_space")?;
        let owner = self.hal.engine_id_from_key_space(key_space)?;
        if owner != engine {
            return Err(CcError::invalid_identifier(
                format!("{}:{}", engine, key_space),
                "engine does not own this key space",
            ));
        }
        self.derive_secrets(key_space)
    }

    /// Rotation swap for one identifier: derive generation N+1, validate it,
    /// publish it as Active and retire generation N. The publish is the last
    /// step; any failure before it leaves generation N Active, so a
    /// referenced identifier never has zero valid keys. Returns the new
    /// generation.
    pub fn update_secrets(&self, id: GlobalKeyId) -> CcResult<u32> {
        self.ensure_capable("update_secrets")?;
        self.ensure_not_halted("update_secrets")?;
        self.validate(id)?;

        // Derive the incoming generation and park it in the pending slot.
        // The pending slot doubles as the per-identifier rotation guard.
        let next_gen = {
            let mut slots = self.slots.write().unwrap();
            let map = slots.as_mut().ok_or(CcError::NoSession {
                operation: "update_secrets",
            })?;
            let slot = map.get_mut(&id).ok_or_else(|| CcError::not_found(id))?;
            if slot.pending.is_some() {
                return Err(CcError::rotation_in_progress(id));
            }
            let next_gen = slot.active.generation + 1;
            let master = self.master.lock().unwrap();
            let master = master.as_ref().ok_or(CcError::NoSession {
                operation: "update_secrets",
            })?;
            let mut material = derive_material(master, id, next_gen, &[])?;
            material.state = KeyState::RotationPending;
            slot.pending = Some(material);
            next_gen
        };

        // Validate the incoming material without blocking readers.
        let degenerate = {
            let slots = self.slots.read().unwrap();
            let map = slots.as_ref().ok_or(CcError::NoSession {
                operation: "update_secrets",
            })?;
            let slot = map.get(&id).ok_or_else(|| CcError::not_found(id))?;
            let pending = slot.pending.as_ref().ok_or_else(|| {
                CcError::derivation_failed("update_secrets", "pending material vanished")
            })?;
            bool::from(pending.secret.ct_eq(&slot.active.secret))
                || pending.secret.iter().all(|b| *b == 0)
        };

        if degenerate {
            let mut slots = self.slots.write().unwrap();
            if let Some(slot) = slots.as_mut().and_then(|m| m.get_mut(&id)) {
                slot.pending = None;
            }
            log::warn!("rotation of {} aborted: degenerate derived material", id);
            return Err(CcError::derivation_failed(
                "update_secrets",
                "derived material failed validation",
            ));
        }

        // Publish. Observers see either generation N or N+1, never neither.
        let mut slots = self.slots.write().unwrap();
        let map = slots.as_mut().ok_or(CcError::NoSession {
            operation: "update_secrets",
        })?;
        let slot = map.get_mut(&id).ok_or_else(|| CcError::not_found(id))?;
        let mut incoming = slot.pending.take().ok_or_else(|| {
            CcError::derivation_failed("update_secrets", "pending material vanished")
        })?;
        incoming.state = KeyState::Active;
        let mut outgoing = std::mem::replace(&mut slot.active, incoming);
        outgoing.state = KeyState::Retired;
        slot.retired.push(RetiredGeneration {
            material: outgoing,
            refs: 1,
        });
        log::info!("rotated {} to generation {}", id, next_gen);
        Ok(next_gen)
    }

    /// Re-derive the Active generation in place from the current export
    /// master key, keeping the generation number. Used when the master
    /// secret itself was re-established.
    pub fn update_key(&self, id: GlobalKeyId) -> CcResult<()> {
        self.ensure_capable("update_key")?;
        self.ensure_not_halted("update_key")?;
        self.validate(id)?;

        let mut slots = self.slots.write().unwrap();
        let map = slots.as_mut().ok_or(CcError::NoSession {
            operation: "update_key",
        })?;
        let slot = map.get_mut(&id).ok_or_else(|| CcError::not_found(id))?;
        if slot.pending.is_some() {
            return Err(CcError::rotation_in_progress(id));
        }
        let generation = slot.active.generation;
        let master = self.master.lock().unwrap();
        let master = master.as_ref().ok_or(CcError::NoSession {
            operation: "update_key",
        })?;
        let mut material = derive_material(master, id, generation, &[])?;
        material.state = KeyState::Active;
        let _old = std::mem::replace(&mut slot.active, material);
        Ok(())
    }

    /// Install an externally supplied IV mask for the Active entry.
    pub fn deposit_iv_mask(&self, id: GlobalKeyId, mask: [u8; IV_MASK_SIZE]) -> CcResult<()> {
        self.ensure_capable("deposit_iv_mask")?;
        self.validate(id)?;
        let mut slots = self.slots.write().unwrap();
        let slot = slots
            .as_mut()
            .and_then(|m| m.get_mut(&id))
            .ok_or_else(|| CcError::not_found(id))?;
        slot.active.iv_mask = mask;
        Ok(())
    }

    /// Fresh random IV mask for host-chosen directions.
    pub fn random_iv_mask() -> [u8; IV_MASK_SIZE] {
        let mut mask = [0u8; IV_MASK_SIZE];
        rand::thread_rng().fill_bytes(&mut mask);
        mask
    }

    /// Zeroize and drop the export master key. Derivations fail `NoSession`
    /// until a session re-establishes it.
    pub fn clear_export_master_key(&self) {
        let mut master = self.master.lock().unwrap();
        if let Some(secret) = master.as_mut() {
            secret.clear();
        }
        *master = None;
    }

    /// Scoped access to the export master key. Crate-private: only the
    /// session bootstrap and rotation/engine internals may see it.
    pub(crate) fn with_export_master_key<R>(
        &self,
        f: impl FnOnce(&SecureBytes) -> R,
    ) -> CcResult<R> {
        let master = self.master.lock().unwrap();
        match master.as_ref() {
            Some(secret) => Ok(f(secret)),
            None => Err(CcError::NoSession {
                operation: "with_export_master_key",
            }),
        }
    }

    /// Range/class check against the device variant.
    pub fn is_valid_global_key_id(&self, id: GlobalKeyId) -> bool {
        self.hal.is_valid_global_key_id(id)
    }

    // Pure taxonomy queries, dispatched through the variant bindings.

    pub fn key_space_from_channel(&self, channel: &ChannelDescriptor) -> CcResult<KeySpace> {
        self.hal.key_space_from_channel(channel)
    }

    pub fn engine_id_from_key_space(&self, key_space: KeySpace) -> CcResult<EngineId> {
        self.hal.engine_id_from_key_space(key_space)
    }

    pub fn lce_key_id_from_channel(
        &self,
        channel: &ChannelDescriptor,
        direction: KeyDirection,
    ) -> CcResult<GlobalKeyId> {
        self.hal.lce_key_id_from_channel(channel, direction)
    }

    pub fn max_key_space_index(&self) -> CcResult<u8> {
        self.hal.max_lce_key_space_index()
    }

    pub fn key_pair_by_channel(&self, channel: &ChannelDescriptor) -> CcResult<KeyPair> {
        self.hal.key_pair_by_channel(channel)
    }

    pub fn key_pair_for_key_space(&self, key_space: KeySpace) -> CcResult<KeyPair> {
        self.hal.key_pair_for_key_space(key_space)
    }

    pub fn global_key_is_kernel_priv(&self, id: GlobalKeyId) -> bool {
        self.hal.global_key_is_kernel_priv(id)
    }

    pub fn global_key_is_uvm_key(&self, id: GlobalKeyId) -> bool {
        self.hal.global_key_is_uvm_key(id)
    }

    /// Identifiers with an Active entry in `key_space`.
    pub fn active_ids_in_space(&self, key_space: KeySpace) -> Vec<GlobalKeyId> {
        let slots = self.slots.read().unwrap();
        match slots.as_ref() {
            Some(map) => map.keys().filter(|id| id.space == key_space).copied().collect(),
            None => Vec::new(),
        }
    }

    /// Borrow a retired generation for in-flight decryption. Pairs with
    /// [`KeyStore::release_retired`].
    pub fn acquire_retired(&self, id: GlobalKeyId, generation: u32) -> CcResult<KeyView> {
        self.ensure_capable("acquire_retired")?;
        self.validate(id)?;
        let mut slots = self.slots.write().unwrap();
        let slot = slots
            .as_mut()
            .and_then(|m| m.get_mut(&id))
            .ok_or_else(|| CcError::not_found(id))?;
        let retired = slot
            .retired
            .iter_mut()
            .find(|r| r.material.generation == generation)
            .ok_or_else(|| CcError::not_found(format!("{} generation {}", id, generation)))?;
        retired.refs += 1;
        Ok(KeyView::of(id, &retired.material))
    }

    /// Quiescence signal from the data plane: one reference to a retired
    /// generation is done. The rotation itself holds the initial reference,
    /// so the release matching the rotation's publish drops the material
    /// once all borrowers are gone.
    pub fn release_retired(&self, id: GlobalKeyId, generation: u32) -> CcResult<()> {
        self.ensure_capable("release_retired")?;
        self.validate(id)?;
        let mut slots = self.slots.write().unwrap();
        let slot = slots
            .as_mut()
            .and_then(|m| m.get_mut(&id))
            .ok_or_else(|| CcError::not_found(id))?;
        let index = slot
            .retired
            .iter()
            .position(|r| r.material.generation == generation)
            .ok_or_else(|| CcError::not_found(format!("{} generation {}", id, generation)))?;
        slot.retired[index].refs -= 1;
        if slot.retired[index].refs == 0 {
            slot.retired.remove(index);
            log::debug!("released retired {} generation {}", id, generation);
        }
        Ok(())
    }

    /// Generations of `id` currently Retired but not yet released.
    pub fn retired_generations(&self, id: GlobalKeyId) -> Vec<u32> {
        let slots = self.slots.read().unwrap();
        slots
            .as_ref()
            .and_then(|m| m.get(&id))
            .map(|slot| slot.retired.iter().map(|r| r.material.generation).collect())
            .unwrap_or_default()
    }

    fn validate(&self, id: GlobalKeyId) -> CcResult<()> {
        if self.hal.is_valid_global_key_id(id) {
            Ok(())
        } else {
            Err(CcError::invalid_identifier(
                id,
                "failed variant range validation",
            ))
        }
    }

    fn ensure_capable(&self, operation: &'static str) -> CcResult<()> {
        if self.hal.is_gpu_cc_capable() {
            Ok(())
        } else {
            Err(CcError::UnsupportedOperation { operation })
        }
    }

    fn ensure_not_halted(&self, operation: &'static str) -> CcResult<()> {
        if self.halted.load(Ordering::Acquire) {
            Err(CcError::derivation_failed(
                operation,
                "engine is in error state",
            ))
        } else {
            Ok(())
        }
    }
}

impl Drop for KeyStore {
    fn drop(&mut self) {
        // Belt and braces: material zeroizes via its own drop, the master
        // key is cleared explicitly so a partially-constructed store leaks
        // nothing either.
        self.clear_export_master_key();
    }
}

/// Derive the export master key from the session seed.
fn derive_master(seed: &SecureBytes) -> CcResult<SecureBytes> {
    let hk = Hkdf::<Sha256>::new(None, seed.as_bytes());
    let mut okm = [0u8; KEY_SIZE];
    hk.expand(MASTER_KDF_LABEL, &mut okm)
        .map_err(|e| CcError::derivation_failed("derive_master", e))?;
    let master = SecureBytes::new(&okm);
    okm.zeroize();
    Ok(master)
}

/// One-way derivation of key material for (id, generation, context) from the
/// export master key. The generation is folded into the KDF info, so each
/// rotation yields unrelated material while staying deterministic.
fn derive_material(
    master: &SecureBytes,
    id: GlobalKeyId,
    generation: u32,
    context: &[u8],
) -> CcResult<KeyMaterial> {
    let hk = Hkdf::<Sha256>::new(None, master.as_bytes());
    let mut info = Vec::with_capacity(KEY_KDF_LABEL.len() + 6 + context.len());
    info.extend_from_slice(KEY_KDF_LABEL);
    info.extend_from_slice(&id.to_raw().to_be_bytes());
    info.extend_from_slice(&generation.to_be_bytes());
    info.extend_from_slice(context);

    let mut okm = [0u8; KEY_SIZE + IV_MASK_SIZE];
    hk.expand(&info, &mut okm)
        .map_err(|e| CcError::derivation_failed("derive_material", e))?;

    let mut material = KeyMaterial::uninitialized();
    material.secret.copy_from_slice(&okm[..KEY_SIZE]);
    material.iv_mask.copy_from_slice(&okm[KEY_SIZE..]);
    material.generation = generation;
    material.state = KeyState::Derived;
    okm.zeroize();
    Ok(material)
}
