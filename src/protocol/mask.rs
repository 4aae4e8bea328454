//! Payload masking (RFC 6455 Section 5.3).
//!
//! Masking XORs every payload byte with one byte of a 4-byte key, cycling
//! through the key from the start of the payload. The transform is its own
//! inverse, so the same function masks and unmasks.

/// Byte-by-byte XOR masking: `data[i] ^= mask[i % 4]`.
#[inline]
pub fn apply_mask(data: &mut [u8], mask: [u8; 4]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= mask[i % 4];
    }
}

/// Word-at-a-time masking. Produces exactly the output of [`apply_mask`].
///
/// Used on the decode path, where payloads can be large.
#[inline]
pub fn apply_mask_fast(data: &mut [u8], mask: [u8; 4]) {
    let mask_u64 = u64::from_ne_bytes([
        mask[0], mask[1], mask[2], mask[3], mask[0], mask[1], mask[2], mask[3],
    ]);

    let mut chunks = data.chunks_exact_mut(8);
    for chunk in &mut chunks {
        let mut word = [0u8; 8];
        word.copy_from_slice(chunk);
        let masked = u64::from_ne_bytes(word) ^ mask_u64;
        chunk.copy_from_slice(&masked.to_ne_bytes());
    }

    // Chunks are a multiple of 8 bytes, so the tail starts at key index 0.
    apply_mask(chunks.into_remainder(), mask);
}
