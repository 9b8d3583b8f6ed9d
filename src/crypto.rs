//! Tuya BLE key derivation and payload encryption.
//! Keys are MD5 based and payloads use AES-128-CBC with zero padding.

use crate::error::{Result, TuyaError};
use aes::Aes128;
use cipher::block_padding::NoPadding;
use cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use md5::{Digest, Md5};
use std::fmt;

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

pub const BLOCK_SIZE: usize = 16;
pub const KEY_LEN: usize = 16;
pub const IV_LEN: usize = 16;
pub const LOCAL_KEY_LEN: usize = 6;
pub const SALT_LEN: usize = 6;

/// Protocol version advertised before the device tells us its own.
pub const DEFAULT_PROTOCOL_VERSION: u8 = 2;

// Device-info response layout
const DEVICE_INFO_VERSION_OFFSET: usize = 2;
const DEVICE_INFO_SALT_OFFSET: usize = 6;
const DEVICE_INFO_AUTH_KEY: std::ops::Range<usize> = 14..46;

/// First 6 bytes of the device secret.
pub fn derive_local_key(secret: &str) -> Result<[u8; LOCAL_KEY_LEN]> {
    let bytes = secret.as_bytes();
    if bytes.len() < LOCAL_KEY_LEN {
        return Err(TuyaError::InvalidSecret);
    }
    let mut key = [0u8; LOCAL_KEY_LEN];
    key.copy_from_slice(&bytes[..LOCAL_KEY_LEN]);
    Ok(key)
}

fn md5(parts: &[&[u8]]) -> [u8; KEY_LEN] {
    let mut hasher = Md5::new();
    for part in parts {
        hasher.update(part);
    }
    let digest = hasher.finalize();
    let mut out = [0u8; KEY_LEN];
    out.copy_from_slice(&digest);
    out
}

/// MD5 of the local key. Encrypts all traffic before a session exists.
pub fn derive_login_key(local_key: &[u8]) -> [u8; KEY_LEN] {
    md5(&[local_key])
}

/// MD5 of the local key followed by the device-provided salt.
pub fn derive_session_key(local_key: &[u8], salt: &[u8]) -> [u8; KEY_LEN] {
    md5(&[local_key, salt])
}

/// TuyaCipher provides AES-128-CBC encryption and decryption.
pub struct TuyaCipher {
    /// 16-byte encryption key
    key: [u8; KEY_LEN],
}

impl TuyaCipher {
    /// Create a new TuyaCipher with a 16-byte key.
    pub fn new(key: &[u8]) -> Result<Self> {
        if key.len() != KEY_LEN {
            return Err(TuyaError::EncryptionFailed);
        }
        let mut k = [0u8; KEY_LEN];
        k.copy_from_slice(key);
        Ok(Self { key: k })
    }

    /// Encrypt `data`, zero-padding it up to the next block boundary.
    ///
    /// Already aligned input gets no extra block.
    pub fn encrypt(&self, data: &[u8], iv: &[u8]) -> Result<Vec<u8>> {
        let encryptor = Aes128CbcEnc::new_from_slices(&self.key, iv)
            .map_err(|_| TuyaError::EncryptionFailed)?;

        let mut buf = data.to_vec();
        buf.resize(data.len().div_ceil(BLOCK_SIZE) * BLOCK_SIZE, 0);
        let len = buf.len();
        encryptor
            .encrypt_padded_mut::<NoPadding>(&mut buf, len)
            .map_err(|_| TuyaError::EncryptionFailed)?;
        Ok(buf)
    }

    /// Decrypt `data` without removing any padding.
    ///
    /// The caller trims the zero padding using the length stored inside the block.
    pub fn decrypt(&self, data: &[u8], iv: &[u8]) -> Result<Vec<u8>> {
        if data.len() % BLOCK_SIZE != 0 {
            return Err(TuyaError::DecryptionFailed);
        }
        let decryptor = Aes128CbcDec::new_from_slices(&self.key, iv)
            .map_err(|_| TuyaError::DecryptionFailed)?;

        let mut buf = data.to_vec();
        decryptor
            .decrypt_padded_mut::<NoPadding>(&mut buf)
            .map_err(|_| TuyaError::DecryptionFailed)?;
        Ok(buf)
    }
}

/// Per-connection key slots.
///
/// The login key is fixed for the lifetime of the value; the session key only
/// exists between a successful device-info exchange and the next reset.
#[derive(Clone)]
pub struct KeyMaterial {
    local_key: [u8; LOCAL_KEY_LEN],
    login_key: [u8; KEY_LEN],
    session_key: Option<[u8; KEY_LEN]>,
    auth_key: Option<Vec<u8>>,
    protocol_version: u8,
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("session_key", &self.session_key.is_some())
            .field("auth_key", &self.auth_key.is_some())
            .field("protocol_version", &self.protocol_version)
            .finish_non_exhaustive()
    }
}

impl KeyMaterial {
    /// Derive the local and login keys from the stored device secret.
    pub fn from_secret(secret: &str, protocol_version: u8) -> Result<Self> {
        let local_key = derive_local_key(secret)?;
        Ok(Self {
            local_key,
            login_key: derive_login_key(&local_key),
            session_key: None,
            auth_key: None,
            protocol_version,
        })
    }

    pub fn local_key(&self) -> &[u8; LOCAL_KEY_LEN] {
        &self.local_key
    }

    pub fn login_key(&self) -> &[u8; KEY_LEN] {
        &self.login_key
    }

    pub fn session_key(&self) -> Option<&[u8; KEY_LEN]> {
        self.session_key.as_ref()
    }

    pub fn auth_key(&self) -> Option<&[u8]> {
        self.auth_key.as_deref()
    }

    pub fn protocol_version(&self) -> u8 {
        self.protocol_version
    }

    pub fn set_protocol_version(&mut self, version: u8) {
        self.protocol_version = version;
    }

    pub fn has_session(&self) -> bool {
        self.session_key.is_some()
    }

    /// Derive and store the session key from a 6-byte salt.
    pub fn establish_session(&mut self, salt: &[u8]) -> Result<()> {
        if salt.len() != SALT_LEN {
            return Err(TuyaError::InvalidPayload);
        }
        self.session_key = Some(derive_session_key(&self.local_key, salt));
        Ok(())
    }

    /// Apply a device-info response: protocol version, salt and auth key.
    pub fn apply_device_info(&mut self, payload: &[u8]) -> Result<()> {
        let salt_end = DEVICE_INFO_SALT_OFFSET + SALT_LEN;
        if payload.len() < salt_end {
            return Err(TuyaError::InvalidPayload);
        }
        self.establish_session(&payload[DEVICE_INFO_SALT_OFFSET..salt_end])?;
        self.protocol_version = payload[DEVICE_INFO_VERSION_OFFSET];
        self.auth_key = payload.get(DEVICE_INFO_AUTH_KEY).map(<[u8]>::to_vec);
        Ok(())
    }

    /// Forget everything learned during the handshake.
    pub fn clear_session(&mut self) {
        self.session_key = None;
        self.auth_key = None;
    }

    /// Overwrite every key slot. Used when the owning connection is disposed.
    pub fn wipe(&mut self) {
        self.clear_session();
        self.local_key = [0u8; LOCAL_KEY_LEN];
        self.login_key = [0u8; KEY_LEN];
    }
}
