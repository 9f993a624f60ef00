//! Symmetric key material and the block-cipher streams it drives.

pub mod algorithm;
pub mod key_material;
pub mod session;

pub use algorithm::{CipherKind, DEFAULT_CIPHER, Direction};
pub use key_material::KeyMaterial;
pub use session::CipherSession;
