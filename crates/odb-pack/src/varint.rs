//! Variable-length integer encodings used inside packs.
//!
//! Two encodings appear in the format:
//!
//! - little-endian base-128 ("LEB128"), used by delta headers
//! - the big-endian offset encoding of ofs-delta back-references, where each
//!   continuation adds one before shifting so that no value has two encodings

/// Append `value` as LEB128.
pub fn encode_leb128(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value > 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if value == 0 {
            break;
        }
    }
}

/// Decode a LEB128 value starting at `*pos`, advancing `*pos` past it.
///
/// Returns `None` on truncation or if the value does not fit in 64 bits.
pub fn decode_leb128(data: &[u8], pos: &mut usize) -> Option<u64> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let byte = *data.get(*pos)?;
        *pos += 1;
        let bits = u64::from(byte & 0x7f);
        if shift >= 64 || (shift > 0 && bits >> (64 - shift) != 0) {
            return None;
        }
        value |= bits << shift;
        if byte & 0x80 == 0 {
            return Some(value);
        }
        shift += 7;
    }
}

/// Append an ofs-delta back-reference distance.
pub fn encode_ofs(buf: &mut Vec<u8>, mut distance: u64) {
    let mut tmp = [0u8; 10];
    let mut i = tmp.len() - 1;
    tmp[i] = (distance & 0x7f) as u8;
    distance >>= 7;
    while distance > 0 {
        distance -= 1;
        i -= 1;
        tmp[i] = 0x80 | (distance & 0x7f) as u8;
        distance >>= 7;
    }
    buf.extend_from_slice(&tmp[i..]);
}

/// Decode an ofs-delta back-reference distance. Returns the distance and the
/// number of bytes consumed.
pub fn decode_ofs(data: &[u8]) -> Option<(u64, usize)> {
    let mut used = 0;
    let mut byte = *data.first()?;
    used += 1;
    let mut value = u64::from(byte & 0x7f);
    while byte & 0x80 != 0 {
        byte = *data.get(used)?;
        used += 1;
        value = value
            .checked_add(1)?
            .checked_mul(128)?
            | u64::from(byte & 0x7f);
    }
    Some((value, used))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leb128_small_and_large() {
        let mut buf = Vec::new();
        encode_leb128(&mut buf, 42);
        assert_eq!(buf, [42]);

        buf.clear();
        encode_leb128(&mut buf, 300);
        assert_eq!(buf, [0xac, 0x02]);

        let mut pos = 0;
        assert_eq!(decode_leb128(&buf, &mut pos), Some(300));
        assert_eq!(pos, 2);
    }

    #[test]
    fn leb128_max() {
        let mut buf = Vec::new();
        encode_leb128(&mut buf, u64::MAX);
        assert_eq!(buf.len(), 10);
        let mut pos = 0;
        assert_eq!(decode_leb128(&buf, &mut pos), Some(u64::MAX));
    }

    #[test]
    fn leb128_truncated() {
        let mut pos = 0;
        assert_eq!(decode_leb128(&[0x80, 0x80], &mut pos), None);
    }

    #[test]
    fn leb128_overflow() {
        let mut pos = 0;
        let too_long = [0xff; 11];
        assert_eq!(decode_leb128(&too_long, &mut pos), None);
        pos = 0;
        // Ten bytes whose last group carries bits past 64.
        let mut wide = [0xffu8; 10];
        wide[9] = 0x02;
        assert_eq!(decode_leb128(&wide, &mut pos), None);
    }

    #[test]
    fn ofs_known_encodings() {
        let mut buf = Vec::new();
        encode_ofs(&mut buf, 127);
        assert_eq!(buf, [0x7f]);

        buf.clear();
        encode_ofs(&mut buf, 128);
        assert_eq!(buf, [0x80, 0x00]);
        assert_eq!(decode_ofs(&buf), Some((128, 2)));
    }

    #[test]
    fn ofs_truncated_and_overflowing() {
        assert_eq!(decode_ofs(&[]), None);
        assert_eq!(decode_ofs(&[0x81]), None);
        assert_eq!(decode_ofs(&[0xff; 12]), None);
    }

    proptest::proptest! {
        #[test]
        fn ofs_decode_inverts_encode(distance in 0u64..(1u64 << 62)) {
            let mut buf = Vec::new();
            encode_ofs(&mut buf, distance);
            proptest::prop_assert_eq!(decode_ofs(&buf), Some((distance, buf.len())));
        }
    }
}
