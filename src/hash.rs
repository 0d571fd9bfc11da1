//! 64-bit scrambler shared by the node cache's hash table and the lock
//! manager's bucket table, so both stay coherent off the same hash.

/// Spreads a (likely sequential) `u64` page id evenly across buckets.
///
/// Native-endian reads are used when scrambling raw byte slices; on a
/// big-endian target the byte-wise fallback in [`hash_bytes`] is used
/// instead, per the module-globals design note (no runtime platform probe).
#[inline]
pub fn scramble(id: u64) -> u64 {
    // Fibonacci hashing: multiply by the odd 64-bit golden-ratio constant and
    // fold the high bits down so sequential ids don't collide in low bits.
    let mut x = id.wrapping_mul(0x9E3779B97F4A7C15);
    x ^= x >> 32;
    x
}

/// Wang-Jenkins-variant hash over an arbitrary byte string (used for lock
/// keys). Consumes 8-byte chunks, multiplying the accumulator by 31 and
/// XOR-ing in each chunk's scrambled value; the tail (<8 bytes) is folded in
/// byte-wise.
pub fn hash_bytes(bytes: &[u8]) -> u64 {
    let mut acc: u64 = 0xcbf29ce484222325; // arbitrary odd seed
    let mut chunks = bytes.chunks_exact(8);
    for chunk in &mut chunks {
        #[cfg(target_endian = "little")]
        let word = u64::from_le_bytes(chunk.try_into().unwrap());
        #[cfg(target_endian = "big")]
        let word = u64::from_be_bytes(chunk.try_into().unwrap());
        acc = acc.wrapping_mul(31) ^ scramble(word);
    }
    let tail = chunks.remainder();
    if !tail.is_empty() {
        let mut word = 0u64;
        for (i, &b) in tail.iter().enumerate() {
            word |= (b as u64) << (i * 8);
        }
        acc = acc.wrapping_mul(31) ^ scramble(word ^ (tail.len() as u64));
    }
    acc
}

/// Combines an index id and a pre-hashed key into the hash that keys a
/// `LockRecord`'s bucket: locks are keyed by `(index_id, key_hash,
/// key_bytes)`.
#[inline]
pub fn combine(index_id: u64, key_hash: u64) -> u64 {
    scramble(index_id) ^ key_hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scramble_spreads_sequential_ids() {
        let a = scramble(1) as usize % 16;
        let b = scramble(2) as usize % 16;
        // Not a strict guarantee, but sequential ids should usually land in
        // different buckets out of 16.
        assert_ne!(scramble(1), scramble(2));
        let _ = (a, b);
    }

    #[test]
    fn hash_bytes_is_deterministic() {
        assert_eq!(hash_bytes(b"hello world"), hash_bytes(b"hello world"));
        assert_ne!(hash_bytes(b"hello world"), hash_bytes(b"hello worlD"));
    }

    #[test]
    fn hash_bytes_handles_short_and_empty() {
        let _ = hash_bytes(b"");
        let _ = hash_bytes(b"a");
        let _ = hash_bytes(b"1234567");
        let _ = hash_bytes(b"12345678");
    }
}
