//! Rolling-hash signatures over destination files.
//!
//! A signature is the chunked weak+strong hash description of a file that
//! delta construction matches new content against.

use fast_rsync::{Signature, SignatureOptions};
use std::io;
use std::path::Path;

/// Default chunk size for signature generation (16 KiB)
const DEFAULT_BLOCK_SIZE: u32 = 16 * 1024;

/// Strong-hash truncation (8 bytes = 64 bits)
const CRYPTO_HASH_SIZE: u32 = 8;

/// Pick a block size proportional to the file, rsync-style: roughly the
/// square root of the length, clamped to [2 KiB, 128 KiB].
pub fn block_size_for(len: u64) -> u32 {
    let sqrt = (len as f64).sqrt() as u32;
    // Clamp first so the power-of-two rounding cannot overflow
    sqrt.clamp(2 * 1024, 128 * 1024).next_power_of_two()
}

/// Generate a signature from a byte buffer.
pub fn generate_signature_from_bytes(data: &[u8], block_size: Option<u32>) -> Signature {
    let options = SignatureOptions {
        block_size: block_size.unwrap_or(DEFAULT_BLOCK_SIZE),
        crypto_hash_size: CRYPTO_HASH_SIZE,
    };

    Signature::calculate(data, options)
}

/// Generate a signature for a file on disk.
///
/// Reads the file into memory; the delta gate keeps this bounded to files
/// where diffing beats recopying.
pub fn generate_signature(path: &Path, block_size: Option<u32>) -> io::Result<Signature> {
    let data = std::fs::read(path)?;
    let block = block_size.unwrap_or_else(|| block_size_for(data.len() as u64));
    Ok(generate_signature_from_bytes(&data, Some(block)))
}

/// Serialized signature bytes for persistence or transmission.
pub fn serialize_signature(signature: &Signature) -> Vec<u8> {
    signature.serialized().to_vec()
}
