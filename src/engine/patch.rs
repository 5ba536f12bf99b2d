//! Binary Patch Reconstruction
//!
//! Applies BSDIFF40 differential patches: an 8-byte magic tag, three
//! little-endian 64-bit lengths (control block, diff block, reconstructed
//! size), then three independently bzip2-compressed blocks back-to-back.
//!
//! Integers use the bsdiff sign-magnitude encoding: bit 63 carries the sign
//! and must be decoded explicitly, not reinterpreted as two's-complement.
//!
//! This is the most failure-sensitive routine in the engine. Every cursor
//! advance is bounds-checked and the reconstruction must land exactly on the
//! declared output size; anything else rejects the patch outright.

use crate::error::{OtaError, Result};
use bzip2::read::BzDecoder;
use std::fs;
use std::io::Read;
use std::path::Path;

const MAGIC: &[u8; 8] = b"BSDIFF40";
const HEADER_LEN: usize = 32;

/// Decode a little-endian 64-bit value with the sign carried in bit 63.
fn decode_i64(bytes: &[u8]) -> i64 {
    let raw = u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]);
    let magnitude = (raw & !(1 << 63)) as i64;
    if raw & (1 << 63) != 0 {
        -magnitude
    } else {
        magnitude
    }
}

fn decompress(block: &[u8], name: &str) -> Result<Vec<u8>> {
    let mut decoder = BzDecoder::new(block);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| OtaError::PatchCorrupt(format!("{} block decompression failed: {}", name, e)))?;
    Ok(out)
}

/// Reconstruct the new artifact from `base` and `patch` bytes.
pub fn apply(base: &[u8], patch: &[u8]) -> Result<Vec<u8>> {
    if patch.len() < HEADER_LEN {
        return Err(OtaError::PatchCorrupt(format!(
            "patch too small ({} bytes)",
            patch.len()
        )));
    }
    if &patch[..8] != MAGIC {
        return Err(OtaError::PatchCorrupt("bad magic tag".into()));
    }

    let ctrl_len = decode_i64(&patch[8..16]);
    let diff_len = decode_i64(&patch[16..24]);
    let new_size = decode_i64(&patch[24..32]);

    if ctrl_len < 0 || diff_len < 0 || new_size < 0 {
        return Err(OtaError::PatchCorrupt("negative header length".into()));
    }
    let ctrl_len = ctrl_len as usize;
    let diff_len = diff_len as usize;
    let new_size = new_size as usize;

    let ctrl_end = HEADER_LEN
        .checked_add(ctrl_len)
        .ok_or_else(|| OtaError::PatchCorrupt("control length overflow".into()))?;
    let diff_end = ctrl_end
        .checked_add(diff_len)
        .ok_or_else(|| OtaError::PatchCorrupt("diff length overflow".into()))?;
    if diff_end > patch.len() {
        return Err(OtaError::PatchCorrupt("block lengths exceed patch size".into()));
    }

    let ctrl = decompress(&patch[HEADER_LEN..ctrl_end], "control")?;
    let diff = decompress(&patch[ctrl_end..diff_end], "diff")?;
    let extra = decompress(&patch[diff_end..], "extra")?;

    let mut new_data = vec![0u8; new_size];
    let mut old_pos: i64 = 0;
    let mut new_pos: usize = 0;
    let mut ctrl_pos: usize = 0;
    let mut diff_pos: usize = 0;
    let mut extra_pos: usize = 0;

    while new_pos < new_size {
        if ctrl_pos + 24 > ctrl.len() {
            return Err(OtaError::PatchCorrupt(format!(
                "control block exhausted at output offset {}",
                new_pos
            )));
        }
        let add_len = decode_i64(&ctrl[ctrl_pos..ctrl_pos + 8]);
        let copy_len = decode_i64(&ctrl[ctrl_pos + 8..ctrl_pos + 16]);
        let seek_len = decode_i64(&ctrl[ctrl_pos + 16..ctrl_pos + 24]);
        ctrl_pos += 24;

        if add_len < 0 || copy_len < 0 {
            return Err(OtaError::PatchCorrupt("negative control length".into()));
        }
        let add_len = add_len as usize;
        let copy_len = copy_len as usize;

        // Add step: diff bytes combined with base bytes, 8-bit wraparound.
        // Base reads outside the buffer contribute 0.
        if new_pos + add_len > new_size {
            return Err(OtaError::PatchCorrupt("add run exceeds declared size".into()));
        }
        if diff_pos + add_len > diff.len() {
            return Err(OtaError::PatchCorrupt("diff block exhausted".into()));
        }
        for i in 0..add_len {
            let base_byte = match usize::try_from(old_pos + i as i64) {
                Ok(idx) if idx < base.len() => base[idx],
                _ => 0,
            };
            new_data[new_pos + i] = base_byte.wrapping_add(diff[diff_pos + i]);
        }
        new_pos += add_len;
        old_pos += add_len as i64;
        diff_pos += add_len;

        // Copy step: verbatim extra bytes; the base cursor does not move.
        if new_pos + copy_len > new_size {
            return Err(OtaError::PatchCorrupt("copy run exceeds declared size".into()));
        }
        if extra_pos + copy_len > extra.len() {
            return Err(OtaError::PatchCorrupt("extra block exhausted".into()));
        }
        new_data[new_pos..new_pos + copy_len]
            .copy_from_slice(&extra[extra_pos..extra_pos + copy_len]);
        new_pos += copy_len;
        extra_pos += copy_len;

        old_pos += seek_len;
    }

    if new_pos != new_size {
        return Err(OtaError::PatchCorrupt(format!(
            "reconstructed {} bytes, expected {}",
            new_pos, new_size
        )));
    }

    Ok(new_data)
}

/// File-level convenience around [`apply`].
pub fn apply_file(base_path: &Path, patch_path: &Path, out_path: &Path) -> Result<()> {
    let base = fs::read(base_path)?;
    let patch = fs::read(patch_path)?;
    let new_data = apply(&base, &patch)?;
    fs::write(out_path, new_data)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn make_patch(base: &[u8], target: &[u8]) -> Vec<u8> {
        let mut patch = Vec::new();
        qbsdiff::Bsdiff::new(base, target)
            .compare(Cursor::new(&mut patch))
            .unwrap();
        patch
    }

    #[test]
    fn test_round_trip_small_edit() {
        let base = b"the quick brown fox jumps over the lazy dog".to_vec();
        let target = b"the quick brown cat jumps over the lazy dog!".to_vec();
        let patch = make_patch(&base, &target);
        assert_eq!(apply(&base, &patch).unwrap(), target);
    }

    #[test]
    fn test_round_trip_larger_artifacts() {
        // Structured, partially repeating input so the diff exercises all
        // three blocks (add runs, extra runs, seeks).
        let base: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
        let mut target = base.clone();
        target[500..600].fill(0xAA);
        target.extend_from_slice(&[0x55; 300]);
        target.drain(10_000..10_050);

        let patch = make_patch(&base, &target);
        assert_eq!(apply(&base, &patch).unwrap(), target);
    }

    #[test]
    fn test_round_trip_empty_base() {
        let base = Vec::new();
        let target = b"fresh content with no base".to_vec();
        let patch = make_patch(&base, &target);
        assert_eq!(apply(&base, &patch).unwrap(), target);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let base = b"base".to_vec();
        let mut patch = make_patch(&base, b"target");
        patch[0] = b'X';
        assert!(matches!(
            apply(&base, &patch),
            Err(OtaError::PatchCorrupt(_))
        ));
    }

    #[test]
    fn test_truncated_patch_rejected() {
        let base = b"some base content for the patch".to_vec();
        let patch = make_patch(&base, b"some new content for the patch!");
        let truncated = &patch[..patch.len() - 5];
        assert!(matches!(
            apply(&base, truncated),
            Err(OtaError::PatchCorrupt(_))
        ));
    }

    #[test]
    fn test_header_shorter_than_32_bytes_rejected() {
        assert!(matches!(
            apply(b"base", b"BSDIFF40"),
            Err(OtaError::PatchCorrupt(_))
        ));
    }

    #[test]
    fn test_declared_size_mismatch_rejected() {
        let base = b"aaaaaaaaaaaaaaaaaaaaaaaaaaaaaa".to_vec();
        let mut patch = make_patch(&base, b"aaaaaaaaaaaaaaaaaaaaaaaaaaaaab");
        // Inflate the declared output size; the control stream runs dry.
        let declared = decode_i64(&patch[24..32]) + 64;
        patch[24..32].copy_from_slice(&(declared as u64).to_le_bytes());
        assert!(matches!(
            apply(&base, &patch),
            Err(OtaError::PatchCorrupt(_))
        ));
    }

    #[test]
    fn test_sign_magnitude_decode() {
        assert_eq!(decode_i64(&42u64.to_le_bytes()), 42);
        assert_eq!(decode_i64(&(42u64 | 1 << 63).to_le_bytes()), -42);
        assert_eq!(decode_i64(&0u64.to_le_bytes()), 0);
    }

    #[test]
    fn test_corrupt_compressed_block_rejected() {
        let base = b"base data".to_vec();
        let mut patch = make_patch(&base, b"target data");
        // Scramble the first compressed block past the header.
        for b in patch[HEADER_LEN..HEADER_LEN + 4].iter_mut() {
            *b ^= 0xFF;
        }
        assert!(matches!(
            apply(&base, &patch),
            Err(OtaError::PatchCorrupt(_))
        ));
    }
}
