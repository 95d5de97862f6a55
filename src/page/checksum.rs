//! Page checksum computation and corruption detection.
//!
//! Uncompressed pages carry two checksums: the modern whole-page CRC32 in
//! the header and a legacy truncated-prefix CRC32 in the trailer, kept for
//! compatibility with pages written by older code. Both must validate.
//! Compressed pages carry a single CRC32 over the compact payload.
//!
//! Independent of checksum mode, the low 32 bits of the header LSN are
//! duplicated in the last 4 bytes of an uncompressed page; a mismatch
//! means the page was torn mid-write.

use crate::common::{ChecksumMode, Lsn, PAGE_SIZE};
use crate::page::layout::{read_u32, read_u64, write_u32, write_u64, OFF_CHECKSUM, OFF_LSN};

/// Reserved checksum value meaning "checksums disabled when written".
pub const CHECKSUM_DISABLED: u32 = 0xDEAD_BEEF;

/// Length of the legacy-checksum prefix.
const LEGACY_PREFIX: usize = 64;

fn crc32(bytes: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(bytes);
    hasher.finalize()
}

/// Modern whole-page checksum.
///
/// CRC32 folded over two disjoint ranges: the header fields after the
/// stored checksum, and the payload. The stored-checksum field, the
/// alloc-marker and the 8-byte tail are excluded so they can be restamped
/// without invalidating the value.
pub fn calc_modern(data: &[u8]) -> u32 {
    crc32(&data[4..24]) ^ crc32(&data[32..data.len() - 8])
}

/// Legacy truncated-prefix checksum: CRC32 of the first 64 bytes,
/// including the stored modern checksum. Stamp order is therefore modern
/// first, legacy second.
pub fn calc_legacy(data: &[u8]) -> u32 {
    crc32(&data[..LEGACY_PREFIX])
}

/// Single-algorithm checksum of a compressed image: CRC32 over everything
/// after the stored-checksum field.
pub fn calc_zip(data: &[u8]) -> u32 {
    crc32(&data[4..])
}

/// Stamp the LSN (header + tail duplicate) and both checksums onto an
/// uncompressed page, honoring the checksum mode.
pub fn stamp(data: &mut [u8], lsn: Lsn, mode: ChecksumMode) {
    let len = data.len();
    write_u64(data, OFF_LSN, lsn);
    write_u32(data, len - 4, lsn as u32);

    match mode {
        ChecksumMode::Enabled => {
            let modern = calc_modern(data);
            write_u32(data, OFF_CHECKSUM, modern);
            let legacy = calc_legacy(data);
            write_u32(data, len - 8, legacy);
        }
        ChecksumMode::Disabled => {
            write_u32(data, OFF_CHECKSUM, CHECKSUM_DISABLED);
            write_u32(data, len - 8, CHECKSUM_DISABLED);
        }
    }
}

/// Stamp the LSN and payload checksum onto a compressed image.
pub fn stamp_zip(data: &mut [u8], lsn: Lsn, mode: ChecksumMode) {
    write_u64(data, OFF_LSN, lsn);
    let value = match mode {
        ChecksumMode::Enabled => calc_zip(data),
        ChecksumMode::Disabled => CHECKSUM_DISABLED,
    };
    write_u32(data, OFF_CHECKSUM, value);
}

/// Whether an uncompressed page read from disk is corrupt.
///
/// The LSN tail check applies unconditionally; the checksum checks only
/// when enabled, and the disabled sentinel is always accepted.
pub fn is_corrupted(data: &[u8], mode: ChecksumMode) -> bool {
    debug_assert_eq!(data.len(), PAGE_SIZE);
    let len = data.len();

    let lsn_low = read_u64(data, OFF_LSN) as u32;
    if lsn_low != read_u32(data, len - 4) {
        return true;
    }

    if mode == ChecksumMode::Disabled {
        return false;
    }

    let stored = read_u32(data, OFF_CHECKSUM);
    if stored != CHECKSUM_DISABLED && stored != calc_modern(data) {
        return true;
    }
    let stored_legacy = read_u32(data, len - 8);
    if stored_legacy != CHECKSUM_DISABLED && stored_legacy != calc_legacy(data) {
        return true;
    }
    false
}

/// Whether a compressed image read from disk is corrupt.
pub fn zip_is_corrupted(data: &[u8], mode: ChecksumMode) -> bool {
    if mode == ChecksumMode::Disabled {
        return false;
    }
    let stored = read_u32(data, OFF_CHECKSUM);
    stored != CHECKSUM_DISABLED && stored != calc_zip(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::PageId;
    use crate::page::layout::{init_page, PageType};
    use crate::page::Frame;

    fn stamped_page() -> Frame {
        let mut frame = Frame::new();
        init_page(&mut frame, PageId::new(1, 9), PageType::BtreeLeaf, 5);
        frame.as_mut_slice()[200] = 0x42;
        stamp(frame.as_mut_slice(), 0x1_0000_0001, ChecksumMode::Enabled);
        frame
    }

    #[test]
    fn test_fresh_page_not_corrupt() {
        let frame = stamped_page();
        assert!(!is_corrupted(frame.as_slice(), ChecksumMode::Enabled));
    }

    #[test]
    fn test_every_byte_flip_detected() {
        let frame = stamped_page();
        // Probe a spread of offsets across header, payload and tail;
        // skip the two stored-checksum fields themselves.
        for off in [4, 17, 25, 33, 200, 8000, PAGE_SIZE - 3] {
            let mut copy = frame.clone();
            copy.as_mut_slice()[off] ^= 0x01;
            assert!(
                is_corrupted(copy.as_slice(), ChecksumMode::Enabled),
                "flip at {} not detected",
                off
            );
        }
    }

    #[test]
    fn test_checksum_field_flip_detected() {
        let mut frame = stamped_page();
        frame.as_mut_slice()[OFF_CHECKSUM] ^= 0xFF;
        assert!(is_corrupted(frame.as_slice(), ChecksumMode::Enabled));
    }

    #[test]
    fn test_lsn_tail_checked_even_when_disabled() {
        let mut frame = Frame::new();
        init_page(&mut frame, PageId::new(1, 9), PageType::BtreeLeaf, 5);
        stamp(frame.as_mut_slice(), 77, ChecksumMode::Disabled);
        assert!(!is_corrupted(frame.as_slice(), ChecksumMode::Disabled));

        let len = frame.as_slice().len();
        frame.as_mut_slice()[len - 2] ^= 0x01;
        assert!(is_corrupted(frame.as_slice(), ChecksumMode::Disabled));
    }

    #[test]
    fn test_disabled_sentinel_accepted() {
        let mut frame = stamped_page();
        // A page stamped with checksums off must pass a reader that has
        // checksums on.
        stamp(frame.as_mut_slice(), 0x1_0000_0001, ChecksumMode::Disabled);
        assert!(!is_corrupted(frame.as_slice(), ChecksumMode::Enabled));
    }

    #[test]
    fn test_zip_checksum() {
        let mut buf = vec![0u8; 4096];
        buf[100] = 7;
        stamp_zip(&mut buf, 9, ChecksumMode::Enabled);
        assert!(!zip_is_corrupted(&buf, ChecksumMode::Enabled));

        buf[100] = 8;
        assert!(zip_is_corrupted(&buf, ChecksumMode::Enabled));
    }
}
