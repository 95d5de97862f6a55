//! Compressed page codec.
//!
//! Pure functions over a page frame and a [`FieldLayout`]; no shared
//! state. The on-disk layout of a compressed page of size `Z`:
//!
//! ```text
//! 0..52        copy of the uncompressed page header
//! 52..m_end    raw deflate stream: layout metadata, then each record's
//!              header + payload in heap order
//! m_end..T     modification log gap (append-only, zero terminated)
//! T..Z         trailer, built backward from the end:
//!              - dense directory (2 bytes/record, heap order)
//!              - trx-id/roll-ptr block (clustered leaf pages)
//!              - BLOB reference block
//! ```
//!
//! The codec never partially mutates its destination: [`compress`]
//! returns a fresh image or nothing, and [`decompress`] writes the
//! destination frame only after the whole page validated.

mod compress;
mod decompress;
mod mod_log;
mod stream;
mod zip;

pub use compress::compress;
pub use decompress::decompress;
pub use mod_log::{append_log, log_gap};
pub use zip::ZipImage;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::PageId;
    use crate::page::build::append_record;
    use crate::page::layout::{self, init_page, OFF_HEAP_TOP};
    use crate::page::records::{read_values, ColVal, Field, FieldLayout};
    use crate::page::{Frame, PageType};

    fn leaf_layout() -> FieldLayout {
        // key, trx-id/roll-ptr system column, one variable payload column
        FieldLayout::new(
            vec![Field::fixed(8), Field::fixed(16), Field::variable(2000)],
            Some(1),
        )
        .unwrap()
    }

    fn sample_vals(k: u8, payload_len: usize) -> Vec<ColVal> {
        vec![
            ColVal::Val(vec![k; 8]),
            ColVal::Val(vec![0x40 + k; 16]),
            ColVal::Val(vec![k ^ 0x55; payload_len]),
        ]
    }

    fn sample_page(n: u8) -> (Frame, FieldLayout, Vec<u16>) {
        let mut frame = Frame::new();
        init_page(&mut frame, PageId::new(1, 2), PageType::BtreeLeaf, 10);
        let fl = leaf_layout();
        let origins = (0..n)
            .map(|k| append_record(&mut frame, &fl, &sample_vals(k, 40), false).unwrap())
            .collect();
        (frame, fl, origins)
    }

    #[test]
    fn test_roundtrip_preserves_field_values() {
        let (frame, fl, origins) = sample_page(5);
        let mut image = compress(&frame, &fl, 3).unwrap();
        assert_eq!(image.n_blobs(), 0);

        let mut out = Frame::new();
        let fl2 = decompress(&mut image, &mut out).unwrap();
        assert_eq!(fl2, fl);

        for (k, &origin) in origins.iter().enumerate() {
            assert_eq!(
                read_values(out.as_slice(), origin as usize, &fl).unwrap(),
                sample_vals(k as u8, 40)
            );
        }
        assert_eq!(
            layout::live_chain(out.as_slice()).unwrap(),
            layout::live_chain(frame.as_slice()).unwrap()
        );
    }

    #[test]
    fn test_roundtrip_empty_page() {
        let mut frame = Frame::new();
        init_page(&mut frame, PageId::new(0, 9), PageType::BtreeLeaf, 3);
        let fl = leaf_layout();

        let mut image = compress(&frame, &fl, 1).unwrap();
        let mut out = Frame::new();
        assert!(decompress(&mut image, &mut out).is_some());
        assert!(layout::system_records_valid(out.as_slice()));
        assert_eq!(layout::live_chain(out.as_slice()), Some(vec![]));
    }

    #[test]
    fn test_roundtrip_deleted_records() {
        let mut frame = Frame::new();
        init_page(&mut frame, PageId::new(1, 2), PageType::BtreeLeaf, 10);
        let fl = leaf_layout();
        let a = append_record(&mut frame, &fl, &sample_vals(1, 30), false).unwrap();
        let d = append_record(&mut frame, &fl, &sample_vals(2, 30), true).unwrap();

        let mut image = compress(&frame, &fl, 3).unwrap();
        let mut out = Frame::new();
        decompress(&mut image, &mut out).unwrap();

        assert_eq!(layout::live_chain(out.as_slice()), Some(vec![a]));
        assert_eq!(layout::free_chain(out.as_slice()), Some(vec![d]));
        assert!(layout::rec_deleted(out.as_slice(), d as usize));
    }

    #[test]
    fn test_roundtrip_extern_columns() {
        let mut frame = Frame::new();
        init_page(&mut frame, PageId::new(1, 2), PageType::BtreeLeaf, 10);
        let fl = leaf_layout();

        let mut ext = vec![7u8; 50];
        ext.extend_from_slice(&[0xEB; 16]);
        let vals = vec![
            ColVal::Val(vec![1; 8]),
            ColVal::Val(vec![2; 16]),
            ColVal::Ext(ext),
        ];
        let origin = append_record(&mut frame, &fl, &vals, false).unwrap();

        let mut image = compress(&frame, &fl, 3).unwrap();
        assert_eq!(image.n_blobs(), 1);

        let mut out = Frame::new();
        decompress(&mut image, &mut out).unwrap();
        assert_eq!(
            read_values(out.as_slice(), origin as usize, &fl).unwrap(),
            vals
        );
    }

    #[test]
    fn test_budget_too_small_fails_cleanly() {
        let mut frame = Frame::new();
        init_page(&mut frame, PageId::new(1, 2), PageType::BtreeLeaf, 10);
        let fl = leaf_layout();
        // Incompressible payloads: pseudo-random bytes.
        let mut seed = 0x12345678u32;
        for k in 0..6u8 {
            let payload: Vec<u8> = (0..900)
                .map(|_| {
                    seed = seed.wrapping_mul(1664525).wrapping_add(1013904223);
                    (seed >> 24) as u8
                })
                .collect();
            let vals = vec![
                ColVal::Val(vec![k; 8]),
                ColVal::Val(vec![k; 16]),
                ColVal::Val(payload),
            ];
            append_record(&mut frame, &fl, &vals, false).unwrap();
        }
        // ~5.4KB of noise cannot deflate into a 1KB class.
        assert!(compress(&frame, &fl, 1).is_none());
        // A roomy class succeeds.
        assert!(compress(&frame, &fl, 4).is_some());
    }

    #[test]
    fn test_bad_system_records_rejected() {
        let (mut frame, fl, _) = sample_page(2);
        frame.as_mut_slice()[layout::INFIMUM_ORIGIN] ^= 0xFF;
        assert!(compress(&frame, &fl, 3).is_none());
    }

    #[test]
    fn test_corrupt_dense_directory_rejected() {
        let (frame, fl, _) = sample_page(3);
        let mut image = compress(&frame, &fl, 3).unwrap();

        // Point a dense directory entry past the heap top.
        let zip_len = image.data().len();
        let heap_top = layout::read_u16(frame.as_slice(), OFF_HEAP_TOP);
        layout::write_u16(image.data_mut(), zip_len - 2, heap_top + 100);

        let mut out = Frame::new();
        assert!(decompress(&mut image, &mut out).is_none());
        // Destination untouched on failure.
        assert_eq!(out.as_slice(), Frame::new().as_slice());
    }

    #[test]
    fn test_truncated_stream_rejected() {
        let (frame, fl, _) = sample_page(3);
        let mut image = compress(&frame, &fl, 3).unwrap();

        // Clobber the deflate stream.
        for b in image.data_mut()[60..80].iter_mut() {
            *b = 0;
        }
        let mut out = Frame::new();
        assert!(decompress(&mut image, &mut out).is_none());
    }

    #[test]
    fn test_empty_mod_log_replay_is_idempotent() {
        let (frame, fl, _) = sample_page(4);
        let mut image = compress(&frame, &fl, 3).unwrap();
        assert_eq!(image.m_start(), image.m_end());

        let mut first = Frame::new();
        decompress(&mut image, &mut first).unwrap();
        let mut second = Frame::new();
        decompress(&mut image, &mut second).unwrap();
        assert_eq!(first.as_slice(), second.as_slice());
    }

    #[test]
    fn test_append_log_and_replay() {
        let (mut frame, fl, origins) = sample_page(4);
        let mut image = compress(&frame, &fl, 3).unwrap();

        // Same-length in-place edit of record 2 on the uncompressed page.
        let origin = origins[2];
        let parsed =
            crate::page::records::parse_record(frame.as_slice(), origin as usize, &fl).unwrap();
        let edited = sample_vals(0x33, 40);
        // Rewrite payload in place by re-serializing the same-shape values.
        let data = frame.as_mut_slice();
        let start = origin as usize - parsed.extra;
        crate::page::records::write_record(
            data,
            start,
            &fl,
            &edited,
            false,
            layout::rec_heap_no(data, origin as usize),
            layout::rec_status(data, origin as usize),
            layout::rec_next(data, origin as usize),
        )
        .unwrap();

        assert!(append_log(&mut image, &frame, &fl, origin));
        assert!(image.m_end() > image.m_start());

        let mut out = Frame::new();
        decompress(&mut image, &mut out).unwrap();
        assert_eq!(
            read_values(out.as_slice(), origin as usize, &fl).unwrap(),
            edited
        );
        // Other records unaffected.
        assert_eq!(
            read_values(out.as_slice(), origins[1] as usize, &fl).unwrap(),
            sample_vals(1, 40)
        );
    }

    #[test]
    fn test_append_log_gap_exhaustion() {
        let (frame, fl, origins) = sample_page(4);
        let mut image = compress(&frame, &fl, 1).unwrap_or_else(|| {
            // If 1KB is too tight for this page use 2KB; the test only
            // needs a small gap.
            compress(&frame, &fl, 2).unwrap()
        });

        let mut appended = 0usize;
        while append_log(&mut image, &frame, &fl, origins[0]) {
            appended += 1;
            assert!(appended < 10_000, "gap never exhausted");
        }
        // Refusal means the remaining gap is smaller than one entry:
        // varint + header + prefix + the 64-byte payload.
        assert!(log_gap(&image, &fl, PageType::BtreeLeaf) < 69);
    }
}
