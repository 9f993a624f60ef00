use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::crypto::algorithm::{BlockStream, CipherKind, Direction};
use crate::crypto::key_material::KeyMaterial;
use crate::error::{EdsError, Result};

/// One encryption or decryption stream bound to a key.
///
/// Feed blocks with `*_block`, flush padding with exactly one `*_final`,
/// then release the key with [`CipherSession::finalize`]. A session is
/// single-owner and strictly sequential.
pub struct CipherSession {
    material: KeyMaterial,
    direction: Direction,
    stream: BlockStream,
    flushed: bool, // set by the final call, or by any streaming failure
    processed: u64, // input bytes consumed so far
}

impl CipherSession {
    /// Start an encryption stream from raw key bytes.
    pub fn init_encrypt(key: &[u8], iv: &[u8], cipher_name: &str) -> Result<Self> {
        Self::from_parts(key, iv, cipher_name, Direction::Encrypt)
    }

    /// Start a decryption stream from raw key bytes.
    pub fn init_decrypt(key: &[u8], iv: &[u8], cipher_name: &str) -> Result<Self> {
        Self::from_parts(key, iv, cipher_name, Direction::Decrypt)
    }

    fn from_parts(key: &[u8], iv: &[u8], cipher_name: &str, direction: Direction) -> Result<Self> {
        let material = KeyMaterial {
            cipher: CipherKind::from_name(cipher_name)?,
            key: Zeroizing::new(key.to_vec()),
            iv: iv.to_vec(),
        };
        Self::new(material, direction)
    }

    /// Bind an already resolved key to a stream.
    pub fn new(material: KeyMaterial, direction: Direction) -> Result<Self> {
        let engine = material.cipher.engine(direction, &material.key, &material.iv)?;
        let stream = BlockStream::new(engine, direction, material.cipher.block_size());

        Ok(Self {
            material,
            direction,
            stream,
            flushed: false,
            processed: 0,
        })
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn cipher(&self) -> CipherKind {
        self.material.cipher
    }

    pub fn block_size(&self) -> usize {
        self.material.cipher.block_size()
    }

    /// Encrypt the next chunk. Output may lag input by up to one block.
    pub fn encrypt_block(&mut self, input: &[u8]) -> Result<Vec<u8>> {
        self.update(Direction::Encrypt, input)
    }

    /// Flush the padded last block of an encryption stream.
    pub fn encrypt_final(&mut self) -> Result<Vec<u8>> {
        self.flush(Direction::Encrypt)
    }

    /// Decrypt the next chunk. The last full block is held until `decrypt_final`.
    pub fn decrypt_block(&mut self, input: &[u8]) -> Result<Vec<u8>> {
        self.update(Direction::Decrypt, input)
    }

    /// Verify and strip padding from the end of a decryption stream.
    pub fn decrypt_final(&mut self) -> Result<Vec<u8>> {
        self.flush(Direction::Decrypt)
    }

    /// Tear the session down and wipe its key.
    pub fn finalize(self) -> Result<()> {
        if !self.flushed {
            warn!(
                cipher = self.material.cipher.name(),
                processed = self.processed,
                "cipher session finalized before its stream was flushed"
            );
        }
        debug!(fingerprint = %self.material.fingerprint(), "cipher session closed");
        Ok(())
    }

    fn check(&self, wanted: Direction) -> Result<()> {
        if self.direction != wanted {
            return Err(EdsError::CipherIo(format!(
                "session was opened for {:?}, not {:?}",
                self.direction, wanted
            )));
        }
        if self.flushed {
            return Err(EdsError::CipherIo("session stream already finished".into()));
        }
        Ok(())
    }

    fn update(&mut self, wanted: Direction, input: &[u8]) -> Result<Vec<u8>> {
        self.check(wanted)?;
        self.processed += input.len() as u64;
        Ok(self.stream.update(input))
    }

    fn flush(&mut self, wanted: Direction) -> Result<Vec<u8>> {
        self.check(wanted)?;
        self.flushed = true;
        self.stream.finish()
    }
}
