//! Page decompression and modification-log replay.

use flate2::{Decompress, FlushDecompress, Status};
use tracing::trace;

use crate::common::PAGE_SIZE;
use crate::page::layout::{
    self, page_type_of, user_origin_in_range, DIR_END, HEAP_NO_SUPREMUM, HEAP_NO_USER_START,
    HEAP_START, INFIMUM_BYTES, INFIMUM_ORIGIN, OFF_FREE, OFF_HEAP_TOP, OFF_N_DIR_SLOTS,
    OFF_N_HEAP, OFF_N_RECS, PAGE_DATA_END, REC_STATUS_INFIMUM, REC_STATUS_NODE_PTR,
    REC_STATUS_ORDINARY, REC_STATUS_SUPREMUM, SUPREMUM_BYTES, SUPREMUM_ORIGIN,
};
use crate::page::records::{FieldLayout, BLOB_REF_LEN, TRX_COL_LEN};
use crate::page::{Frame, PageType};

use super::stream::{decode_layout, parse_rec, read_varint, Divert, StreamRec};
use super::zip::{
    dense_dir_start, trailer_start, trx_block_start, ZipImage, DENSE_DELETED, DENSE_OFFSET_MASK,
    DENSE_OWNED,
};

struct DenseSlot {
    origin: u16,
    owned: bool,
    deleted: bool,
}

/// Decompress an image into `frame`, reconstructing the field layout.
///
/// The destination is only written on success; any structural
/// inconsistency (truncated stream, out-of-range directory entry,
/// inconsistent chains) returns `None` without panicking. On success the
/// image's modification-log bounds and blob count are refreshed.
pub fn decompress(image: &mut ZipImage, frame: &mut Frame) -> Option<FieldLayout> {
    let zip = image.data();
    let zip_len = zip.len();

    let mut work = Frame::new();
    let wd = work.as_mut_slice();
    wd[..PAGE_DATA_END].copy_from_slice(&zip[..PAGE_DATA_END]);

    let n_heap = layout::read_u16(wd, OFF_N_HEAP);
    let n_dense = (n_heap.checked_sub(2)?) as usize;
    let heap_top = layout::read_u16(wd, OFF_HEAP_TOP) as usize;
    if heap_top < HEAP_START || heap_top > DIR_END {
        return None;
    }

    // Dense directory: validate offsets and uniqueness up front.
    let dir_start = dense_dir_start(zip_len, n_dense)?;
    let mut slots = Vec::with_capacity(n_dense);
    let mut seen = vec![false; PAGE_SIZE];
    for i in 0..n_dense {
        let raw = layout::read_u16(zip, dir_start + 2 * i);
        let origin = raw & DENSE_OFFSET_MASK;
        if !user_origin_in_range(wd, origin) || seen[origin as usize] {
            return None;
        }
        seen[origin as usize] = true;
        slots.push(DenseSlot {
            origin,
            owned: raw & DENSE_OWNED != 0,
            deleted: raw & DENSE_DELETED != 0,
        });
    }

    // Inflate the whole stream; it is self-terminating, so the input may
    // conservatively extend to the directory.
    let mut scratch = vec![0u8; PAGE_SIZE + 512];
    let consumed;
    let stream_len;
    {
        let mut d = Decompress::new(false);
        let mut in_pos = PAGE_DATA_END;
        let mut out_pos = 0usize;
        loop {
            let before_in = d.total_in();
            let before_out = d.total_out();
            let status = d
                .decompress(
                    &zip[in_pos..dir_start],
                    &mut scratch[out_pos..],
                    FlushDecompress::Finish,
                )
                .ok()?;
            in_pos += (d.total_in() - before_in) as usize;
            out_pos += (d.total_out() - before_out) as usize;
            match status {
                Status::StreamEnd => break,
                Status::Ok | Status::BufError => {
                    if in_pos == dir_start || out_pos == scratch.len() {
                        return None;
                    }
                }
            }
        }
        consumed = in_pos;
        stream_len = out_pos;
    }
    let m_start = consumed;
    scratch.truncate(stream_len);

    // Stream preamble: infimum successor + field layout.
    let mut pos = 0usize;
    let infimum_next = {
        let lo = *scratch.first()?;
        let hi = *scratch.get(1)?;
        pos += 2;
        u16::from_le_bytes([lo, hi])
    };
    let fl = decode_layout(&scratch, &mut pos)?;
    let has_trx = fl.trx_pos().is_some() && page_type_of(wd) == PageType::BtreeLeaf;

    let divert = Divert {
        trx: has_trx,
        blob: true,
    };
    let mut recs: Vec<StreamRec> = Vec::with_capacity(n_dense);
    let mut n_blobs = 0usize;
    for _ in 0..n_dense {
        let rec = parse_rec(&scratch, &mut pos, &fl, divert)?;
        n_blobs += rec.n_ext();
        recs.push(rec);
    }
    if pos != scratch.len() {
        return None;
    }

    let blob_start = trailer_start(zip_len, n_dense, has_trx, n_blobs)?;
    let trx_start = trx_block_start(zip_len, n_dense, has_trx)?;
    if m_start > blob_start {
        return None;
    }

    // Materialize records at their original origins, splicing the trx
    // column and external references back from the trailer.
    let user_status = if page_type_of(wd) == PageType::BtreeLeaf {
        REC_STATUS_ORDINARY
    } else {
        REC_STATUS_NODE_PTR
    };
    let mut blob_pos = blob_start;
    for (i, rec) in recs.iter().enumerate() {
        let trx = if has_trx {
            let off = trx_start + TRX_COL_LEN * i;
            Some(&zip[off..off + TRX_COL_LEN])
        } else {
            None
        };
        let mut refs = std::iter::from_fn(|| {
            if blob_pos + BLOB_REF_LEN > trx_start {
                return None;
            }
            let mut r = [0u8; BLOB_REF_LEN];
            r.copy_from_slice(&zip[blob_pos..blob_pos + BLOB_REF_LEN]);
            blob_pos += BLOB_REF_LEN;
            Some(r)
        });
        super::stream::materialize_rec(
            wd,
            slots[i].origin as usize,
            rec,
            &fl,
            HEAP_NO_USER_START + i as u16,
            user_status,
            trx,
            &mut refs,
        )?;
    }

    // System records.
    wd[INFIMUM_ORIGIN..INFIMUM_ORIGIN + 8].copy_from_slice(INFIMUM_BYTES);
    layout::rec_set_info(wd, INFIMUM_ORIGIN, 1);
    layout::rec_set_heap_status(wd, INFIMUM_ORIGIN, 0, REC_STATUS_INFIMUM);
    layout::rec_set_next(wd, INFIMUM_ORIGIN, infimum_next);
    wd[SUPREMUM_ORIGIN..SUPREMUM_ORIGIN + 8].copy_from_slice(SUPREMUM_BYTES);
    layout::rec_set_heap_status(wd, SUPREMUM_ORIGIN, HEAP_NO_SUPREMUM, REC_STATUS_SUPREMUM);
    layout::rec_set_next(wd, SUPREMUM_ORIGIN, 0);

    rebuild_chains_and_dir(wd, &slots)?;

    // Replay the modification log on top of the inflated baseline.
    let m_end = replay_log(
        zip,
        m_start,
        blob_start,
        &fl,
        wd,
        &slots,
        user_status,
    )?;

    trace!(
        n_dense,
        n_blobs,
        m_start,
        m_end,
        "page decompressed"
    );

    frame.as_mut_slice().copy_from_slice(work.as_slice());
    image.set_bounds(m_start as u16, m_end as u16, n_blobs as u16);
    Some(fl)
}

/// Walk the reconstructed chains, deriving slot ownership and validating
/// the dense directory's deleted bits against free-chain membership.
fn rebuild_chains_and_dir(wd: &mut [u8], slots: &[DenseSlot]) -> Option<()> {
    let n_dense = slots.len();
    let mut origin_index = std::collections::HashMap::with_capacity(n_dense);
    for (i, s) in slots.iter().enumerate() {
        origin_index.insert(s.origin, i);
    }

    // Live chain: infimum -> ... -> supremum.
    let mut dir: Vec<u16> = vec![INFIMUM_ORIGIN as u16];
    layout::rec_set_n_owned(wd, INFIMUM_ORIGIN, 1);
    let mut live = 0usize;
    let mut owned_run: u8 = 0;
    let mut cur = layout::rec_next(wd, INFIMUM_ORIGIN);
    while cur != SUPREMUM_ORIGIN as u16 {
        let &idx = origin_index.get(&cur)?;
        if slots[idx].deleted || live >= n_dense {
            return None;
        }
        live += 1;
        owned_run += 1;
        if slots[idx].owned {
            layout::rec_set_n_owned(wd, cur as usize, owned_run);
            dir.push(cur);
            owned_run = 0;
        } else {
            layout::rec_set_n_owned(wd, cur as usize, 0);
        }
        if owned_run > layout::DIR_SLOT_MAX_OWNED {
            return None;
        }
        cur = layout::rec_next(wd, cur as usize);
    }
    layout::rec_set_n_owned(wd, SUPREMUM_ORIGIN, owned_run + 1);
    dir.push(SUPREMUM_ORIGIN as u16);

    if live != layout::read_u16(wd, OFF_N_RECS) as usize {
        return None;
    }

    // Free chain must cover exactly the deleted dense entries.
    let mut freed = 0usize;
    let mut cur = layout::read_u16(wd, OFF_FREE);
    while cur != 0 {
        let &idx = origin_index.get(&cur)?;
        if !slots[idx].deleted || freed >= n_dense {
            return None;
        }
        freed += 1;
        cur = layout::rec_next(wd, cur as usize);
    }
    if live + freed != n_dense {
        return None;
    }

    if dir.len() != layout::read_u16(wd, OFF_N_DIR_SLOTS) as usize {
        return None;
    }
    for (k, &origin) in dir.iter().enumerate() {
        layout::write_u16(wd, DIR_END - 2 * (k + 1), origin);
    }
    Some(())
}

/// Replay `[varint heap_no][record]` entries until the zero terminator.
///
/// Entries are self-contained (nothing diverted). Returns the offset of
/// the terminator, the new `m_end`.
fn replay_log(
    zip: &[u8],
    m_start: usize,
    blob_start: usize,
    fl: &FieldLayout,
    wd: &mut [u8],
    slots: &[DenseSlot],
    user_status: u8,
) -> Option<usize> {
    let log = &zip[..blob_start];
    let mut pos = m_start;
    loop {
        if pos == blob_start {
            return Some(blob_start);
        }
        let at = pos;
        let heap_no = u16::try_from(read_varint(log, &mut pos)?).ok()?;
        if heap_no == 0 {
            return Some(at);
        }
        let idx = heap_no.checked_sub(HEAP_NO_USER_START)? as usize;
        let slot = slots.get(idx)?;
        let rec = parse_rec(log, &mut pos, fl, Divert::NONE)?;
        let mut no_refs = std::iter::empty();
        super::stream::materialize_rec(
            wd,
            slot.origin as usize,
            &rec,
            fl,
            heap_no,
            user_status,
            None,
            &mut no_refs,
        )?;
    }
}
