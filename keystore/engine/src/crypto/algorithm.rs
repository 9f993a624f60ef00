//! Cipher catalogue and the CBC block engines behind a session.

use aes::{Aes128, Aes192, Aes256};
use blowfish::Blowfish;
use cipher::generic_array::GenericArray;
use cipher::{BlockCipher, BlockDecryptMut, BlockEncryptMut, KeyInit, KeyIvInit};

use crate::error::{EdsError, Result};

/// Cipher used when a registration names none.
pub const DEFAULT_CIPHER: &str = "bf-cbc";

/// Ciphers a key can be registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherKind {
    Aes128Cbc,
    Aes192Cbc,
    Aes256Cbc,
    BlowfishCbc,
}

impl CipherKind {
    /// Resolve a cipher by name. Matching ignores case and accepts the usual
    /// short aliases.
    pub fn from_name(name: &str) -> Result<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "aes-128-cbc" | "aes128" => Ok(CipherKind::Aes128Cbc),
            "aes-192-cbc" | "aes192" => Ok(CipherKind::Aes192Cbc),
            "aes-256-cbc" | "aes256" => Ok(CipherKind::Aes256Cbc),
            "bf-cbc" | "bf" | "blowfish" => Ok(CipherKind::BlowfishCbc),
            other => Err(EdsError::CipherInit(format!("unknown cipher '{other}'"))),
        }
    }

    /// Canonical name stored in the catalog.
    pub fn name(&self) -> &'static str {
        match self {
            CipherKind::Aes128Cbc => "aes-128-cbc",
            CipherKind::Aes192Cbc => "aes-192-cbc",
            CipherKind::Aes256Cbc => "aes-256-cbc",
            CipherKind::BlowfishCbc => "bf-cbc",
        }
    }

    pub fn block_size(&self) -> usize {
        match self {
            CipherKind::BlowfishCbc => 8,
            _ => 16,
        }
    }

    pub fn iv_len(&self) -> usize {
        self.block_size()
    }

    /// Key length in bytes when the caller does not ask for one.
    pub fn default_key_len(&self) -> usize {
        match self {
            CipherKind::Aes128Cbc => 16,
            CipherKind::Aes192Cbc => 24,
            CipherKind::Aes256Cbc => 32,
            CipherKind::BlowfishCbc => 16,
        }
    }

    pub fn accepts_key_len(&self, len: usize) -> bool {
        match self {
            CipherKind::BlowfishCbc => (4..=56).contains(&len),
            _ => len == self.default_key_len(),
        }
    }

    /// Key length in bytes for a requested size in bits; 0 selects the default.
    pub fn key_len_for_bits(&self, bits: usize) -> Result<usize> {
        if bits == 0 {
            return Ok(self.default_key_len());
        }
        if bits % 8 != 0 {
            return Err(EdsError::CipherInit(format!(
                "key size {bits} is not a whole number of bytes"
            )));
        }
        let len = bits / 8;
        if !self.accepts_key_len(len) {
            return Err(EdsError::CipherInit(format!(
                "{} does not support {bits}-bit keys",
                self.name()
            )));
        }
        Ok(len)
    }

    /// Build the block engine for one direction.
    pub(crate) fn engine(&self, direction: Direction, key: &[u8], iv: &[u8]) -> Result<Box<dyn BlockTransform>> {
        if !self.accepts_key_len(key.len()) {
            return Err(EdsError::CipherInit(format!(
                "{} does not accept a {}-byte key",
                self.name(),
                key.len()
            )));
        }
        if iv.len() != self.iv_len() {
            return Err(EdsError::CipherInit(format!(
                "{} needs a {}-byte IV, got {}",
                self.name(),
                self.iv_len(),
                iv.len()
            )));
        }

        match (self, direction) {
            (CipherKind::Aes128Cbc, Direction::Encrypt) => CbcEncrypt::<Aes128>::boxed(key, iv),
            (CipherKind::Aes128Cbc, Direction::Decrypt) => CbcDecrypt::<Aes128>::boxed(key, iv),
            (CipherKind::Aes192Cbc, Direction::Encrypt) => CbcEncrypt::<Aes192>::boxed(key, iv),
            (CipherKind::Aes192Cbc, Direction::Decrypt) => CbcDecrypt::<Aes192>::boxed(key, iv),
            (CipherKind::Aes256Cbc, Direction::Encrypt) => CbcEncrypt::<Aes256>::boxed(key, iv),
            (CipherKind::Aes256Cbc, Direction::Decrypt) => CbcDecrypt::<Aes256>::boxed(key, iv),
            (CipherKind::BlowfishCbc, Direction::Encrypt) => CbcEncrypt::<Blowfish>::boxed(key, iv),
            (CipherKind::BlowfishCbc, Direction::Decrypt) => CbcDecrypt::<Blowfish>::boxed(key, iv),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Encrypt,
    Decrypt,
}

/// Transforms one cipher block in place, chaining state across calls.
pub(crate) trait BlockTransform: Send {
    fn transform(&mut self, block: &mut [u8]);
}

struct CbcEncrypt<C: BlockEncryptMut + BlockCipher>(cbc::Encryptor<C>);

impl<C> CbcEncrypt<C>
where
    C: BlockEncryptMut + BlockCipher + KeyInit + Send + 'static,
{
    fn boxed(key: &[u8], iv: &[u8]) -> Result<Box<dyn BlockTransform>> {
        let inner = cbc::Encryptor::<C>::new_from_slices(key, iv)
            .map_err(|e| EdsError::CipherInit(format!("invalid key or IV length: {e}")))?;
        Ok(Box::new(CbcEncrypt(inner)))
    }
}

impl<C> BlockTransform for CbcEncrypt<C>
where
    C: BlockEncryptMut + BlockCipher + Send,
{
    fn transform(&mut self, block: &mut [u8]) {
        self.0.encrypt_block_mut(GenericArray::from_mut_slice(block));
    }
}

struct CbcDecrypt<C: BlockDecryptMut + BlockCipher>(cbc::Decryptor<C>);

impl<C> CbcDecrypt<C>
where
    C: BlockDecryptMut + BlockCipher + KeyInit + Send + 'static,
{
    fn boxed(key: &[u8], iv: &[u8]) -> Result<Box<dyn BlockTransform>> {
        let inner = cbc::Decryptor::<C>::new_from_slices(key, iv)
            .map_err(|e| EdsError::CipherInit(format!("invalid key or IV length: {e}")))?;
        Ok(Box::new(CbcDecrypt(inner)))
    }
}

impl<C> BlockTransform for CbcDecrypt<C>
where
    C: BlockDecryptMut + BlockCipher + Send,
{
    fn transform(&mut self, block: &mut [u8]) {
        self.0.decrypt_block_mut(GenericArray::from_mut_slice(block));
    }
}

/// Streaming PKCS#7 padding over a block engine.
///
/// Encryption emits every complete block as soon as it is buffered.
/// Decryption always holds back the last complete block, since only the
/// final call can tell whether it carries padding.
pub(crate) struct BlockStream {
    engine: Box<dyn BlockTransform>,
    direction: Direction,
    block_size: usize,
    pending: Vec<u8>,
}

impl BlockStream {
    pub(crate) fn new(engine: Box<dyn BlockTransform>, direction: Direction, block_size: usize) -> Self {
        Self {
            engine,
            direction,
            block_size,
            pending: Vec::with_capacity(block_size),
        }
    }

    pub(crate) fn update(&mut self, input: &[u8]) -> Vec<u8> {
        self.pending.extend_from_slice(input);

        let bs = self.block_size;
        let mut ready = self.pending.len() / bs * bs;
        if self.direction == Direction::Decrypt && ready == self.pending.len() && ready > 0 {
            ready -= bs;
        }

        let mut out: Vec<u8> = self.pending.drain(..ready).collect();
        for block in out.chunks_exact_mut(bs) {
            self.engine.transform(block);
        }
        out
    }

    pub(crate) fn finish(&mut self) -> Result<Vec<u8>> {
        let bs = self.block_size;
        let mut block = std::mem::take(&mut self.pending);

        match self.direction {
            Direction::Encrypt => {
                let pad = bs - block.len();
                block.resize(bs, pad as u8);
                self.engine.transform(&mut block);
                Ok(block)
            }
            Direction::Decrypt => {
                if block.len() != bs {
                    return Err(EdsError::CipherIo(format!(
                        "ciphertext length is not a multiple of the {bs}-byte block size"
                    )));
                }
                self.engine.transform(&mut block);
                let pad = block[bs - 1] as usize;
                if pad == 0 || pad > bs || block[bs - pad..].iter().any(|&b| b as usize != pad) {
                    return Err(EdsError::CipherIo("bad padding in final block".into()));
                }
                block.truncate(bs - pad);
                Ok(block)
            }
        }
    }
}
