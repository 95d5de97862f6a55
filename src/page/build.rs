//! In-place page construction: appending records to an index page.
//!
//! The B-tree layer proper is outside this crate; these helpers cover
//! what the cache core itself needs: manufacturing well-formed record
//! pages for compression, decompression and flushing.

use crate::page::layout::{
    self, read_u16, write_u16, DIR_END, OFF_FREE, OFF_GARBAGE, OFF_HEAP_TOP, OFF_N_DIR_SLOTS,
    OFF_N_HEAP, OFF_N_RECS, REC_STATUS_NODE_PTR, REC_STATUS_ORDINARY, SUPREMUM_ORIGIN,
};
use crate::page::records::{record_sizes, write_record, ColVal, FieldLayout};
use crate::page::{Frame, PageType};

/// Append a record to the page heap, linking it at the end of the live
/// chain (callers append in key order).
///
/// With `deleted` set, the record is instead pushed onto the free chain,
/// modelling a record that was delete-marked and purged. Returns the new
/// record's origin, or `None` when the page is full or the values do not
/// match the layout.
pub fn append_record(
    frame: &mut Frame,
    layout: &FieldLayout,
    vals: &[ColVal],
    deleted: bool,
) -> Option<u16> {
    let (extra, payload) = record_sizes(layout, vals)?;
    let data = frame.as_mut_slice();

    let heap_top = read_u16(data, OFF_HEAP_TOP) as usize;
    let n_heap = read_u16(data, OFF_N_HEAP);
    let n_dir_slots = read_u16(data, OFF_N_DIR_SLOTS) as usize;

    // Leave room for the record, a possible extra directory slot, and the
    // trailer.
    let dir_floor = DIR_END - 2 * (n_dir_slots + 1);
    if heap_top + extra + payload > dir_floor || n_heap == 0x1fff {
        return None;
    }

    let status = match layout::page_type_of(data) {
        PageType::BtreeInternal => REC_STATUS_NODE_PTR,
        _ => REC_STATUS_ORDINARY,
    };

    let origin = write_record(data, heap_top, layout, vals, deleted, n_heap, status, 0)?;

    write_u16(data, OFF_HEAP_TOP, (heap_top + extra + payload) as u16);
    write_u16(data, OFF_N_HEAP, n_heap + 1);

    if deleted {
        // Push onto the free chain.
        let free_head = read_u16(data, OFF_FREE);
        layout::rec_set_next(data, origin as usize, free_head);
        write_u16(data, OFF_FREE, origin);
        let garbage = read_u16(data, OFF_GARBAGE);
        write_u16(data, OFF_GARBAGE, garbage + (extra + payload) as u16);
    } else {
        // Splice before supremum.
        let mut prev = layout::INFIMUM_ORIGIN as u16;
        loop {
            let next = layout::rec_next(data, prev as usize);
            if next == SUPREMUM_ORIGIN as u16 {
                break;
            }
            prev = next;
        }
        layout::rec_set_next(data, prev as usize, origin);
        layout::rec_set_next(data, origin as usize, SUPREMUM_ORIGIN as u16);
        let n_recs = read_u16(data, OFF_N_RECS);
        write_u16(data, OFF_N_RECS, n_recs + 1);
        layout::rebuild_dir(data)?;
    }

    Some(origin)
}
