//! Payload masking per RFC 6455 Section 5.3.

/// Mask/unmask a payload in place. XOR is its own inverse, so the same call
/// both applies and removes a mask.
#[inline]
pub fn apply_mask(buf: &mut [u8], mask: [u8; 4]) {
    apply_mask_fast64(buf, mask);
}

/// A safe unoptimized mask application.
#[inline]
fn apply_mask_fallback(buf: &mut [u8], mask: [u8; 4]) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte ^= mask[i & 3];
    }
}

/// Amortized version operating on 8-byte blocks.
///
/// Because the block size is a multiple of the 4-byte key, the remainder
/// starts at a key offset of zero and the plain fallback finishes it off.
#[inline]
fn apply_mask_fast64(buf: &mut [u8], mask: [u8; 4]) {
    let mask_u64 = u64::from_ne_bytes([
        mask[0], mask[1], mask[2], mask[3], mask[0], mask[1], mask[2], mask[3],
    ]);

    let mut chunks = buf.chunks_exact_mut(8);
    for chunk in &mut chunks {
        let word = u64::from_ne_bytes(chunk.try_into().expect("8-byte chunk")) ^ mask_u64;
        chunk.copy_from_slice(&word.to_ne_bytes());
    }
    apply_mask_fallback(chunks.into_remainder(), mask);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fast_matches_fallback() {
        let masks = [
            [0x00, 0x00, 0x00, 0x00],
            [0xFF, 0xFF, 0xFF, 0xFF],
            [0x12, 0x34, 0x56, 0x78],
            [0x6d, 0xb6, 0xb2, 0x80],
        ];

        for mask in masks {
            for size in 0..=64 {
                let data: Vec<u8> = (0..size).map(|i| (i * 7) as u8).collect();

                let mut fallback = data.clone();
                apply_mask_fallback(&mut fallback, mask);

                let mut fast = data.clone();
                apply_mask_fast64(&mut fast, mask);

                assert_eq!(fallback, fast, "mismatch for mask {mask:?} size {size}");
            }
        }
    }

    #[test]
    fn test_mask_is_involution() {
        let mask = [0xAA, 0xBB, 0xCC, 0xDD];
        let original = b"Hello, World! This message is long enough to hit the word path.";

        let mut data = original.to_vec();
        apply_mask(&mut data, mask);
        assert_ne!(&data[..], &original[..]);

        apply_mask(&mut data, mask);
        assert_eq!(&data[..], &original[..]);
    }

    #[test]
    fn test_key_cycles_modulo_four() {
        let mask = [0x01, 0x02, 0x03, 0x04];
        let mut data: Vec<u8> = (0..1000).map(|i| (i % 256) as u8).collect();
        let original = data.clone();

        apply_mask(&mut data, mask);

        for (i, &byte) in data.iter().enumerate() {
            assert_eq!(byte, original[i] ^ mask[i % 4], "mismatch at index {i}");
        }
    }

    #[test]
    fn test_empty_and_sub_word_buffers() {
        let mask = [0x12, 0x34, 0x56, 0x78];

        let mut empty: Vec<u8> = vec![];
        apply_mask(&mut empty, mask);
        assert!(empty.is_empty());

        let mut three = vec![0xAB, 0xCD, 0xEF];
        apply_mask(&mut three, mask);
        assert_eq!(three, vec![0xAB ^ 0x12, 0xCD ^ 0x34, 0xEF ^ 0x56]);
    }
}
