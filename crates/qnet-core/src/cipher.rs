//! XOR stream cipher keyed by QKD output.
//!
//! Encryption and decryption are the same operation: each byte is XORed
//! with the key cycled to the payload length. The cipher has no
//! cryptographic strength; it exists so that the bytes on a secure segment
//! differ observably from the plaintext.

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CipherError {
    #[error("key material is empty")]
    EmptyKeyMaterial,
}

/// XOR `data` with `key` repeated.
pub fn apply_keystream(data: &[u8], key: &[u8]) -> Result<Vec<u8>, CipherError> {
    if key.is_empty() {
        return Err(CipherError::EmptyKeyMaterial);
    }
    Ok(data
        .iter()
        .zip(key.iter().cycle())
        .map(|(d, k)| d ^ k)
        .collect())
}

pub fn encrypt(plaintext: &[u8], key: &[u8]) -> Result<Vec<u8>, CipherError> {
    apply_keystream(plaintext, key)
}

pub fn decrypt(ciphertext: &[u8], key: &[u8]) -> Result<Vec<u8>, CipherError> {
    apply_keystream(ciphertext, key)
}

/// Pack key bits MSB-first into bytes; the final byte is zero-padded.
pub fn pack_bits(bits: &[bool]) -> Vec<u8> {
    bits.chunks(8)
        .map(|chunk| {
            chunk
                .iter()
                .enumerate()
                .fold(0u8, |acc, (i, &b)| acc | ((b as u8) << (7 - i)))
        })
        .collect()
}
