//! Buffer configuration.

use crate::entry_ref::{NUM_BUFFERS, OFFSET_SIZE};

/// Growth factor applied when a non-empty buffer is replaced.
pub const DEFAULT_GROW_FACTOR: f64 = 1.5;

/// Extra elements allowed on the "just enough" retry of the growth policy.
pub const DEFAULT_SLACK_ELEMS: usize = 1_000_000;

/// Configuration for the buffers of a data store.
///
/// Sizes are counted in arrays of `array_size` elements, matching how
/// allocations are aligned.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferTypeConfig {
    /// Elements per array (the allocation granule).
    pub array_size: usize,
    /// Minimum number of arrays in a new buffer.
    pub min_arrays: usize,
    /// Maximum number of arrays in a buffer.
    pub max_arrays: usize,
    /// Arrays to allocate for the very first buffer.
    pub num_arrays_for_new_buffer: usize,
    /// Multiplier applied to live usage when a buffer is replaced.
    pub grow_factor: f64,
    /// New buffer sizes are rounded up to a multiple of this many arrays.
    pub alloc_alignment: usize,
    /// Slack (in elements) used when the grown size would exceed the maximum.
    pub slack_elems: usize,
    /// Number of buffer ids available to the store.
    pub max_buffers: usize,
}

impl Default for BufferTypeConfig {
    fn default() -> Self {
        Self {
            array_size: 1,
            min_arrays: 16,
            max_arrays: OFFSET_SIZE,
            num_arrays_for_new_buffer: 0,
            grow_factor: DEFAULT_GROW_FACTOR,
            alloc_alignment: 16,
            slack_elems: DEFAULT_SLACK_ELEMS,
            max_buffers: NUM_BUFFERS,
        }
    }
}

impl BufferTypeConfig {
    pub fn with_array_size(mut self, array_size: usize) -> Self {
        self.array_size = array_size;
        self
    }

    pub fn with_min_arrays(mut self, min_arrays: usize) -> Self {
        self.min_arrays = min_arrays;
        self
    }

    pub fn with_max_arrays(mut self, max_arrays: usize) -> Self {
        self.max_arrays = max_arrays;
        self
    }

    /// Size hint for the first buffer, in arrays.
    pub fn with_initial_arrays(mut self, arrays: usize) -> Self {
        self.num_arrays_for_new_buffer = arrays;
        self
    }

    pub fn with_grow_factor(mut self, grow_factor: f64) -> Self {
        self.grow_factor = grow_factor;
        self
    }

    pub fn with_alloc_alignment(mut self, arrays: usize) -> Self {
        self.alloc_alignment = arrays;
        self
    }

    pub fn with_slack_elems(mut self, slack: usize) -> Self {
        self.slack_elems = slack;
        self
    }

    pub fn with_max_buffers(mut self, max_buffers: usize) -> Self {
        self.max_buffers = max_buffers;
        self
    }

    /// Maximum elements in one buffer.
    pub fn max_elems(&self) -> usize {
        self.max_arrays * self.array_size
    }

    /// Alignment unit for buffer sizes, in elements.
    pub fn alignment_elems(&self) -> usize {
        self.alloc_alignment.max(1) * self.array_size
    }

    /// Check the configuration against the ref layout.
    ///
    /// # Panics
    /// Panics on a configuration that the ref layout cannot address.
    pub(crate) fn validate(&self) {
        assert!(self.array_size > 0, "array_size must be positive");
        assert!(self.grow_factor >= 1.0, "grow_factor must be at least 1");
        assert!(
            self.max_elems() <= OFFSET_SIZE,
            "max buffer size ({} elements) exceeds ref offset range ({OFFSET_SIZE})",
            self.max_elems()
        );
        assert!(
            (2..=NUM_BUFFERS).contains(&self.max_buffers),
            "max_buffers must be in 2..={NUM_BUFFERS}"
        );
        assert!(self.min_arrays <= self.max_arrays, "min_arrays exceeds max_arrays");
    }
}
