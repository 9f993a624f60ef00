use std::fmt;

use rand::RngCore;
use rand::rngs::OsRng;
use zeroize::Zeroizing;

use crate::crypto::algorithm::CipherKind;
use crate::error::Result;

/// Symmetric key and IV bound to a cipher.
///
/// Generated once at registration and rebuilt from shares at retrieval; the
/// key buffer is wiped when the value is dropped.
#[derive(Clone)]
pub struct KeyMaterial {
    pub cipher: CipherKind,
    pub key: Zeroizing<Vec<u8>>,
    pub iv: Vec<u8>,
}

impl KeyMaterial {
    /// Fresh random key and IV. `key_size_bits == 0` selects the cipher default.
    pub fn generate(cipher: CipherKind, key_size_bits: usize) -> Result<Self> {
        let key_len = cipher.key_len_for_bits(key_size_bits)?;

        let mut key = Zeroizing::new(vec![0u8; key_len]);
        OsRng.fill_bytes(&mut key[..]);

        let mut iv = vec![0u8; cipher.iv_len()];
        OsRng.fill_bytes(&mut iv);

        Ok(Self { cipher, key, iv })
    }

    pub fn key_len_bits(&self) -> usize {
        self.key.len() * 8
    }

    /// Key-length string stored as `edskeyinfo`.
    pub fn key_info(&self) -> String {
        self.key_len_bits().to_string()
    }

    /// Short BLAKE3 fingerprint of the key, safe to log.
    pub fn fingerprint(&self) -> String {
        let digest = blake3::hash(&self.key);
        hex::encode(&digest.as_bytes()[..8])
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("cipher", &self.cipher.name())
            .field("key_bits", &self.key_len_bits())
            .field("fingerprint", &self.fingerprint())
            .finish_non_exhaustive()
    }
}
