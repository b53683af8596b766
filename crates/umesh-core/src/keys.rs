//! Keys manager: one-time and group key derivation and storage
//!
//! ## Derivation
//!
//! ```text
//! one-time key = AES-128(key = mac || mac, block = ts || ts || ts || ts)
//! group key    = AES-128(key = master,     block = now || now || now || now)
//! ```
//!
//! `ts` is the joiner's attach timestamp and `now` the leader's clock when
//! it forms the network, both little-endian u32.
//!
//! ## Frame protection
//!
//! Frames are protected with AES-128-CTR under a fixed IV, applied from the
//! header-IEs offset to the end of the frame. Encryption and decryption are
//! the same keystream XOR.

use crate::error::{MeshError, MeshResult};
use crate::types::ExtAddr;
use zeroize::{Zeroize, ZeroizeOnDrop};

#[cfg(feature = "crypto")]
use aes::cipher::{generic_array::GenericArray, BlockEncrypt, KeyInit, KeyIvInit, StreamCipher};
#[cfg(feature = "crypto")]
use aes::Aes128;
#[cfg(feature = "crypto")]
use ctr::Ctr128BE;

/// AES-128 key size
pub const KEY_SIZE: usize = 16;

/// Key slot used for the attach handshake
pub const ONE_TIME_KEY_INDEX: u8 = 0;
/// Key slot of the network group key
pub const GROUP_KEY1_INDEX: u8 = 1;
/// Marker for frames sent in the clear
pub const INVALID_KEY_INDEX: u8 = 0xff;

const KEY_SLOTS: usize = 2;

/// Fixed CTR initial counter block
#[cfg(feature = "crypto")]
const FRAME_IV: [u8; 16] = [
    0x31, 0x41, 0x59, 0x26, 0x53, 0x58, 0x97, 0x93,
    0x23, 0x84, 0x62, 0x64, 0x33, 0x83, 0x27, 0x95,
];

/// A 128-bit key, wiped on drop
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Key([u8; KEY_SIZE]);

impl Key {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Key").field(&"[REDACTED]").finish()
    }
}

fn repeat_u32(value: u32) -> [u8; KEY_SIZE] {
    let mut block = [0u8; KEY_SIZE];
    for chunk in block.chunks_mut(4) {
        chunk.copy_from_slice(&value.to_le_bytes());
    }
    block
}

#[cfg(feature = "crypto")]
fn aes_encrypt_block(key: &[u8; KEY_SIZE], block: [u8; KEY_SIZE]) -> [u8; KEY_SIZE] {
    let cipher = Aes128::new(GenericArray::from_slice(key));
    let mut out = GenericArray::clone_from_slice(&block);
    cipher.encrypt_block(&mut out);
    let mut result = [0u8; KEY_SIZE];
    result.copy_from_slice(&out);
    result
}

/// Derive the attach one-time key shared by a joiner and its parent
#[cfg(feature = "crypto")]
pub fn derive_one_time_key(timestamp: u32, mac: &ExtAddr) -> MeshResult<Key> {
    let mut key = [0u8; KEY_SIZE];
    key[..8].copy_from_slice(mac.as_bytes());
    key[8..].copy_from_slice(mac.as_bytes());
    let derived = aes_encrypt_block(&key, repeat_u32(timestamp));
    key.zeroize();
    Ok(Key(derived))
}

/// Derive the attach one-time key (stub when crypto disabled)
#[cfg(not(feature = "crypto"))]
pub fn derive_one_time_key(_timestamp: u32, _mac: &ExtAddr) -> MeshResult<Key> {
    Err(MeshError::Fail)
}

/// Derive a fresh group key from the master key and the current time
#[cfg(feature = "crypto")]
pub fn derive_group_key(master: &[u8; KEY_SIZE], now: u32) -> MeshResult<Key> {
    Ok(Key(aes_encrypt_block(master, repeat_u32(now))))
}

/// Derive a fresh group key (stub when crypto disabled)
#[cfg(not(feature = "crypto"))]
pub fn derive_group_key(_master: &[u8; KEY_SIZE], _now: u32) -> MeshResult<Key> {
    Err(MeshError::Fail)
}

/// Apply the frame keystream in place
#[cfg(feature = "crypto")]
pub fn apply_frame_cipher(key: &Key, data: &mut [u8]) -> MeshResult<()> {
    let mut cipher = Ctr128BE::<Aes128>::new(key.as_bytes().into(), (&FRAME_IV).into());
    cipher.apply_keystream(data);
    Ok(())
}

/// Apply the frame keystream (stub when crypto disabled)
#[cfg(not(feature = "crypto"))]
pub fn apply_frame_cipher(_key: &Key, _data: &mut [u8]) -> MeshResult<()> {
    Err(MeshError::Fail)
}

/// Runtime key storage
#[derive(Debug, Default)]
pub struct KeyManager {
    keys: [Option<Key>; KEY_SLOTS],
}

impl KeyManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install or replace the key in a slot
    pub fn set_key(&mut self, index: u8, key: Key) -> MeshResult<()> {
        let slot = self
            .keys
            .get_mut(index as usize)
            .ok_or(MeshError::Fail)?;
        *slot = Some(key);
        Ok(())
    }

    pub fn get_key(&self, index: u8) -> Option<&Key> {
        self.keys.get(index as usize).and_then(|k| k.as_ref())
    }

    pub fn clear_key(&mut self, index: u8) {
        if let Some(slot) = self.keys.get_mut(index as usize) {
            *slot = None;
        }
    }

    /// Forget every key
    pub fn clear(&mut self) {
        self.keys = Default::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_slots() {
        let mut km = KeyManager::new();
        assert!(km.get_key(GROUP_KEY1_INDEX).is_none());
        km.set_key(GROUP_KEY1_INDEX, Key::from_bytes([7; 16])).unwrap();
        assert_eq!(km.get_key(GROUP_KEY1_INDEX).unwrap().as_bytes(), &[7; 16]);
        assert_eq!(km.set_key(5, Key::from_bytes([0; 16])), Err(MeshError::Fail));
        km.clear();
        assert!(km.get_key(GROUP_KEY1_INDEX).is_none());
    }

    #[test]
    fn test_debug_redacts() {
        let key = Key::from_bytes([0xaa; 16]);
        assert!(!format!("{:?}", key).contains("170"));
    }

    #[test]
    fn test_repeat_block() {
        let block = repeat_u32(0x01020304);
        assert_eq!(&block[..4], &[4, 3, 2, 1]);
        assert_eq!(&block[12..], &[4, 3, 2, 1]);
    }

    #[cfg(feature = "crypto")]
    #[test]
    fn test_one_time_key_is_deterministic() {
        let mac = ExtAddr([1, 2, 3, 4, 5, 6, 7, 8]);
        let a = derive_one_time_key(1000, &mac).unwrap();
        let b = derive_one_time_key(1000, &mac).unwrap();
        let c = derive_one_time_key(1001, &mac).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[cfg(feature = "crypto")]
    #[test]
    fn test_group_key_depends_on_time() {
        let a = derive_group_key(&[9; 16], 1).unwrap();
        let b = derive_group_key(&[9; 16], 2).unwrap();
        assert_ne!(a, b);
    }

    #[cfg(feature = "crypto")]
    #[test]
    fn test_frame_cipher_is_involution() {
        let key = Key::from_bytes([3; 16]);
        let plain = b"mesh frame body".to_vec();
        let mut data = plain.clone();
        apply_frame_cipher(&key, &mut data).unwrap();
        assert_ne!(data, plain);
        apply_frame_cipher(&key, &mut data).unwrap();
        assert_eq!(data, plain);
    }

    #[cfg(not(feature = "crypto"))]
    #[test]
    fn test_stubs_fail_without_crypto() {
        assert!(derive_group_key(&[0; 16], 1).is_err());
    }
}
