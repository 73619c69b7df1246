//! Allocation failure.

use std::error::Error;
use std::fmt;

/// Error returned by [`Heap::try_allocate`](crate::Heap::try_allocate).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// Every region is full and the region limit has been reached.
    HeapExhausted {
        /// Configured region limit.
        max_regions: usize,
    },
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HeapExhausted { max_regions } => {
                write!(f, "heap exhausted: all {max_regions} regions are full")
            }
        }
    }
}

impl Error for AllocError {}
