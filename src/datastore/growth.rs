//! Sizing policy for new buffers.

use crate::config::BufferTypeConfig;
use crate::error::{Result, StoreError};

/// Usage figures the size of a replacement buffer is derived from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct GrowthInput {
    /// Payload elements used in the buffer(s) being replaced.
    pub used_elems: usize,
    /// Dead elements in the buffer(s) being replaced.
    pub dead_elems: usize,
    /// Elements the triggering allocation needs.
    pub elems_needed: usize,
    /// Lower bound requested by compaction or a fallback resize.
    pub min_size_needed: usize,
    /// Elements the new buffer reserves up front.
    pub reserved_elems: usize,
}

#[inline]
fn align_up(value: usize, alignment: usize) -> usize {
    value.div_ceil(alignment) * alignment
}

/// Elements to allocate for a new buffer.
///
/// The grown size is `(live + needed) * grow_factor + reserved`, rounded up to
/// the alignment unit, where `needed` is at least the pending minimum and the
/// factor only applies when the replaced buffer held data. If that exceeds
/// the maximum, a second attempt with `live + needed + reserved + slack`
/// decides between allocating the maximum and failing.
pub(crate) fn elems_to_alloc(config: &BufferTypeConfig, input: GrowthInput) -> Result<usize> {
    let alignment = config.alignment_elems();
    let max_elems = config.max_elems();
    let needed = input.elems_needed.max(input.min_size_needed);
    let live = input.used_elems.saturating_sub(input.dead_elems);

    let mut size = live + needed;
    if input.used_elems != 0 {
        size = (size as f64 * config.grow_factor).ceil() as usize;
    } else {
        size = size.max(config.num_arrays_for_new_buffer * config.array_size);
    }
    size = size.max(config.min_arrays * config.array_size);
    size = align_up(size + input.reserved_elems, alignment);
    if size <= max_elems {
        return Ok(size);
    }

    let just_enough = align_up(
        live + needed + input.reserved_elems + config.slack_elems,
        alignment,
    );
    if just_enough <= max_elems {
        return Ok(max_elems);
    }
    tracing::error!(
        needed = just_enough,
        max = max_elems,
        "new buffer size exceeds configured maximum"
    );
    Err(StoreError::CapacityExceeded {
        needed: just_enough as u64,
        max: max_elems as u64,
    })
}
