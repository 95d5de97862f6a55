//! Modification log: incremental in-place edits without recompression.
//!
//! An edit to a record on a compressed page is appended to the image as
//! `[varint heap_no][stream-form record]`, bounded by the gap between the
//! deflate stream end and the trailer start. Replay happens inside
//! decompress. Once the gap is exhausted the caller must fall back to a
//! full recompression.

use crate::page::layout::{self, page_type_of, OFF_N_HEAP};
use crate::page::records::FieldLayout;
use crate::page::{Frame, PageType};

use super::stream::{serialize_rec_at, write_varint, Divert};
use super::zip::{trailer_start, ZipImage};

/// Append the record at `origin` on the (already edited) uncompressed
/// page to the image's modification log.
///
/// The entry is self-contained: the trx-id column and external references
/// are logged inline rather than diverted. Returns `false`, leaving the
/// image untouched, when the gap cannot hold the entry or the record does
/// not parse against the layout; the caller then recompresses.
pub fn append_log(image: &mut ZipImage, frame: &Frame, fl: &FieldLayout, origin: u16) -> bool {
    let data = frame.as_slice();

    let heap_no = layout::rec_heap_no(data, origin as usize);
    if heap_no < layout::HEAP_NO_USER_START {
        return false;
    }

    let mut entry = Vec::with_capacity(64);
    write_varint(&mut entry, heap_no as u32);
    if serialize_rec_at(&mut entry, data, origin as usize, fl, Divert::NONE).is_none() {
        return false;
    }

    let zip_len = image.data().len();
    let n_heap = layout::read_u16(image.data(), OFF_N_HEAP);
    let n_dense = match n_heap.checked_sub(2) {
        Some(n) => n as usize,
        None => return false,
    };
    let has_trx = fl.trx_pos().is_some() && page_type_of(data) == PageType::BtreeLeaf;
    let blob_start = match trailer_start(zip_len, n_dense, has_trx, image.n_blobs() as usize) {
        Some(b) => b,
        None => return false,
    };

    let m_end = image.m_end() as usize;
    if m_end + entry.len() > blob_start {
        return false;
    }

    image.data_mut()[m_end..m_end + entry.len()].copy_from_slice(&entry);
    image.set_m_end((m_end + entry.len()) as u16);
    true
}

/// Bytes left in the modification-log gap.
pub fn log_gap(image: &ZipImage, fl: &FieldLayout, page_type: PageType) -> usize {
    let n_heap = layout::read_u16(image.data(), OFF_N_HEAP);
    let n_dense = match n_heap.checked_sub(2) {
        Some(n) => n as usize,
        None => return 0,
    };
    let has_trx = fl.trx_pos().is_some() && page_type == PageType::BtreeLeaf;
    match trailer_start(image.data().len(), n_dense, has_trx, image.n_blobs() as usize) {
        Some(b) => b.saturating_sub(image.m_end() as usize),
        None => 0,
    }
}
