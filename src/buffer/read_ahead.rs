//! Linear read-ahead: the pure decision helpers.
//!
//! The tablespace is viewed as aligned windows of `area` pages. When the
//! first touch of a page lands on a window border and enough of that
//! window was recently accessed, the pool prefetches the adjacent window
//! in the direction of travel. The thresholds are configuration
//! ([`crate::common::PoolConfig::read_ahead_area`],
//! [`crate::common::PoolConfig::read_ahead_threshold`]), not correctness
//! requirements; the pool applies them, this module only does the window
//! arithmetic.

/// Aligned window `[lo, hi)` containing `page_no`.
#[inline]
pub fn area_bounds(page_no: u32, area: u32) -> (u32, u32) {
    debug_assert!(area > 0);
    let lo = page_no - page_no % area;
    (lo, lo.saturating_add(area))
}

/// The window a border access points at: the following window when the
/// touch is on the last page of its area, the preceding one when on the
/// first. Interior touches (or travel past the ends of the page-number
/// space) trigger nothing.
pub fn linear_target(page_no: u32, area: u32) -> Option<(u32, u32)> {
    let (lo, hi) = area_bounds(page_no, area);
    if page_no.checked_add(1) == Some(hi) {
        // Ascending scan: prefetch the next window.
        let next_hi = hi.checked_add(area)?;
        Some((hi, next_hi))
    } else if page_no == lo {
        // Descending scan: prefetch the previous window.
        let prev_lo = lo.checked_sub(area)?;
        Some((prev_lo, lo))
    } else {
        None
    }
}
