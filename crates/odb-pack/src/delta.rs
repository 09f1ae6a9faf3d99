//! Binary delta codec.
//!
//! A delta is two LEB128 lengths (base, result) followed by opcodes:
//!
//! - `1xxxxxxx` copy: bits 0-3 select which of four little-endian offset
//!   bytes follow, bits 4-6 which of three size bytes follow. A size of zero
//!   means `0x10000`.
//! - `0nnnnnnn` with `n > 0` insert: the next `n` bytes are literal output.
//! - `00000000` is reserved and always rejected.
//!
//! Deltas come from untrusted packs, so [`apply`] validates every bound and
//! never panics.

use std::collections::HashMap;

use crate::error::DeltaError;
use crate::varint::{decode_leb128, encode_leb128};

/// Largest literal run a single insert opcode can carry.
const MAX_INSERT: usize = 0x7f;

/// Largest copy emitted by the encoder (fits in the 3 size bytes).
const MAX_COPY: usize = 0x00ff_ffff;

/// Block length used by the encoder to find matches in the base.
const BLOCK: usize = 16;

/// Read the `(base_len, result_len)` header. Returns the lengths and the
/// number of bytes they occupy.
pub fn header(delta: &[u8]) -> Result<(u64, u64, usize), DeltaError> {
    let mut pos = 0;
    let base_len = decode_leb128(delta, &mut pos).ok_or(DeltaError::TruncatedHeader)?;
    let result_len = decode_leb128(delta, &mut pos).ok_or(DeltaError::TruncatedHeader)?;
    Ok((base_len, result_len, pos))
}

/// Apply `delta` to `base`, producing the target object.
pub fn apply(base: &[u8], delta: &[u8]) -> Result<Vec<u8>, DeltaError> {
    let (base_len, result_len, mut pos) = header(delta)?;
    if base_len != base.len() as u64 {
        return Err(DeltaError::BaseLengthMismatch {
            expected: base_len,
            actual: base.len() as u64,
        });
    }

    let capacity = usize::try_from(result_len).map_err(|_| DeltaError::OutOfMemory(result_len))?;
    let mut out = Vec::new();
    out.try_reserve_exact(capacity)
        .map_err(|_| DeltaError::OutOfMemory(result_len))?;

    while pos < delta.len() {
        let op = delta[pos];
        let op_at = pos;
        pos += 1;

        if op & 0x80 != 0 {
            let (offset, len) = decode_copy(op, delta, &mut pos).ok_or(DeltaError::TruncatedInstruction(op_at))?;
            let end = offset
                .checked_add(len)
                .filter(|&end| end <= base.len() as u64)
                .ok_or(DeltaError::CopyOutOfBounds {
                    offset,
                    len,
                    base_len: base.len() as u64,
                })?;
            if out.len() as u64 + len > result_len {
                return Err(DeltaError::ResultOverflow(result_len));
            }
            // Both bounds were checked against base.len() above.
            out.extend_from_slice(&base[offset as usize..end as usize]);
        } else if op != 0 {
            let len = usize::from(op);
            let literal = delta
                .get(pos..pos + len)
                .ok_or(DeltaError::TruncatedInstruction(op_at))?;
            if (out.len() + len) as u64 > result_len {
                return Err(DeltaError::ResultOverflow(result_len));
            }
            out.extend_from_slice(literal);
            pos += len;
        } else {
            return Err(DeltaError::ReservedOpcode(op_at));
        }
    }

    if out.len() as u64 != result_len {
        return Err(DeltaError::ResultLengthMismatch {
            expected: result_len,
            actual: out.len() as u64,
        });
    }
    Ok(out)
}

/// Decode the offset and size operands of a copy opcode.
fn decode_copy(op: u8, delta: &[u8], pos: &mut usize) -> Option<(u64, u64)> {
    let mut offset = 0u64;
    for i in 0..4 {
        if op & (1 << i) != 0 {
            offset |= u64::from(*delta.get(*pos)?) << (8 * i);
            *pos += 1;
        }
    }
    let mut len = 0u64;
    for i in 0..3 {
        if op & (0x10 << i) != 0 {
            len |= u64::from(*delta.get(*pos)?) << (8 * i);
            *pos += 1;
        }
    }
    if len == 0 {
        len = 0x10000;
    }
    Some((offset, len))
}

/// Append a copy opcode for `base[offset..offset + len]`.
pub fn push_copy(out: &mut Vec<u8>, offset: u32, len: u32) {
    debug_assert!(len as usize <= MAX_COPY && len > 0);
    let op_at = out.len();
    out.push(0x80);
    let mut op = 0x80u8;
    for i in 0..4 {
        let byte = (offset >> (8 * i)) as u8;
        if byte != 0 {
            op |= 1 << i;
            out.push(byte);
        }
    }
    // A size of exactly 0x10000 is encoded by omitting every size byte.
    if len != 0x10000 {
        for i in 0..3 {
            let byte = (len >> (8 * i)) as u8;
            if byte != 0 {
                op |= 0x10 << i;
                out.push(byte);
            }
        }
    }
    out[op_at] = op;
}

/// Append insert opcodes carrying `literal`.
pub fn push_insert(out: &mut Vec<u8>, literal: &[u8]) {
    for chunk in literal.chunks(MAX_INSERT) {
        out.push(chunk.len() as u8);
        out.extend_from_slice(chunk);
    }
}

/// Build a delta that turns `base` into `target`.
///
/// Greedy block matcher: not tuned for size, but every delta it emits is
/// valid input for [`apply`].
pub fn encode(base: &[u8], target: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    encode_leb128(&mut out, base.len() as u64);
    encode_leb128(&mut out, target.len() as u64);

    let mut blocks: HashMap<&[u8], usize> = HashMap::new();
    if base.len() >= BLOCK && base.len() <= u32::MAX as usize {
        for start in (0..=base.len() - BLOCK).step_by(BLOCK) {
            blocks.entry(&base[start..start + BLOCK]).or_insert(start);
        }
    }

    let mut pending = 0;
    let mut i = 0;
    while i < target.len() {
        let found = target
            .get(i..i + BLOCK)
            .and_then(|block| blocks.get(block).copied());
        let Some(base_at) = found else {
            i += 1;
            continue;
        };

        let mut len = BLOCK;
        while i + len < target.len() && base_at + len < base.len() && target[i + len] == base[base_at + len] {
            len += 1;
        }

        push_insert(&mut out, &target[pending..i]);
        let mut done = 0;
        while done < len {
            let step = (len - done).min(MAX_COPY);
            push_copy(&mut out, (base_at + done) as u32, step as u32);
            done += step;
        }
        i += len;
        pending = i;
    }
    push_insert(&mut out, &target[pending..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Delta with an explicit header followed by raw opcode bytes.
    fn delta(base_len: u64, result_len: u64, ops: &[u8]) -> Vec<u8> {
        let mut d = Vec::new();
        encode_leb128(&mut d, base_len);
        encode_leb128(&mut d, result_len);
        d.extend_from_slice(ops);
        d
    }

    #[test]
    fn copy_then_insert() {
        // copy(offset 0, size 5) then insert "world"
        let d = delta(5, 10, &[0x90, 0x05, 0x05, b'w', b'o', b'r', b'l', b'd']);
        assert_eq!(apply(b"hello", &d).unwrap(), b"helloworld");
    }

    #[test]
    fn copy_with_offset_bytes() {
        let base = b"0123456789";
        let d = delta(10, 3, &[0x91, 0x04, 0x03]);
        assert_eq!(apply(base, &d).unwrap(), b"456");
    }

    #[test]
    fn zero_size_means_64k() {
        let base = vec![7u8; 0x10000];
        let d = delta(0x10000, 0x10000, &[0x80]);
        assert_eq!(apply(&base, &d).unwrap(), base);
    }

    #[test]
    fn base_length_mismatch() {
        let d = delta(6, 5, &[0x90, 0x05]);
        assert_eq!(
            apply(b"hello", &d).unwrap_err(),
            DeltaError::BaseLengthMismatch { expected: 6, actual: 5 }
        );
    }

    #[test]
    fn reserved_opcode() {
        let d = delta(5, 5, &[0x00]);
        assert!(matches!(apply(b"hello", &d), Err(DeltaError::ReservedOpcode(_))));
    }

    #[test]
    fn copy_past_base() {
        let d = delta(5, 6, &[0x90, 0x06]);
        assert!(matches!(apply(b"hello", &d), Err(DeltaError::CopyOutOfBounds { .. })));
        let d = delta(5, 2, &[0x91, 0x04, 0x02]);
        assert!(matches!(apply(b"hello", &d), Err(DeltaError::CopyOutOfBounds { .. })));
    }

    #[test]
    fn output_overrun_and_shortfall() {
        let d = delta(5, 4, &[0x90, 0x05]);
        assert_eq!(apply(b"hello", &d).unwrap_err(), DeltaError::ResultOverflow(4));
        let d = delta(5, 6, &[0x90, 0x05]);
        assert_eq!(
            apply(b"hello", &d).unwrap_err(),
            DeltaError::ResultLengthMismatch { expected: 6, actual: 5 }
        );
    }

    #[test]
    fn truncated_streams() {
        assert_eq!(apply(b"", &[]).unwrap_err(), DeltaError::TruncatedHeader);
        assert_eq!(apply(b"", &[0x00]).unwrap_err(), DeltaError::TruncatedHeader);
        let d = delta(5, 5, &[0x90]);
        assert!(matches!(apply(b"hello", &d), Err(DeltaError::TruncatedInstruction(_))));
        let d = delta(5, 5, &[0x05, b'a', b'b']);
        assert!(matches!(apply(b"hello", &d), Err(DeltaError::TruncatedInstruction(_))));
    }

    #[test]
    fn huge_result_len_is_out_of_memory() {
        let d = delta(0, u64::MAX >> 1, &[]);
        assert!(matches!(apply(b"", &d), Err(DeltaError::OutOfMemory(_))));
    }

    #[test]
    fn push_copy_encodes_minimal_operands() {
        let mut out = Vec::new();
        push_copy(&mut out, 0, 5);
        assert_eq!(out, [0x90, 0x05]);

        out.clear();
        push_copy(&mut out, 0x0100, 0x10000);
        assert_eq!(out, [0x82, 0x01]);
    }

    #[test]
    fn encoder_reuses_base() {
        let base: Vec<u8> = (0..4096u32).map(|i| (i * 31 % 251) as u8).collect();
        let mut target = base.clone();
        target.splice(1000..1000, b"inserted text".iter().copied());
        let d = encode(&base, &target);
        assert!(d.len() < target.len() / 4, "delta of {} bytes", d.len());
        assert_eq!(apply(&base, &d).unwrap(), target);
    }

    #[test]
    fn header_reports_lengths() {
        let d = delta(300, 7, &[0x07]);
        assert_eq!(header(&d).unwrap(), (300, 7, 3));
    }

    proptest::proptest! {
        #[test]
        fn encode_then_apply_recovers_target(
            base in proptest::collection::vec(0u8..4, 0..600),
            edits in proptest::collection::vec((0usize..600, proptest::collection::vec(proptest::num::u8::ANY, 0..40)), 0..5),
        ) {
            let mut target = base.clone();
            for (at, bytes) in edits {
                let at = at.min(target.len());
                target.splice(at..at, bytes);
            }
            let d = encode(&base, &target);
            proptest::prop_assert_eq!(apply(&base, &d).unwrap(), target);
        }

        #[test]
        fn arbitrary_bytes_never_panic(
            base in proptest::collection::vec(proptest::num::u8::ANY, 0..64),
            ops in proptest::collection::vec(proptest::num::u8::ANY, 0..64),
            result_len in 0u64..256,
        ) {
            let d = delta(base.len() as u64, result_len, &ops);
            if let Ok(out) = apply(&base, &d) {
                proptest::prop_assert_eq!(out.len() as u64, result_len);
            }
        }
    }
}
