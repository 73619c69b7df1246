//! Slots buffer for relocation.
//!
//! Records the locations of references that may point into an evacuation
//! candidate so the compactor can re-point them after objects move. The set
//! is a conservative superset: a recorded slot may since have been
//! overwritten, or its holder may have died. Such stale entries are filtered
//! when the slot is read back during patching.
//!
//! Appends are O(1); deduplication is deferred to [`RememberedSet::drain`]
//! so the cost lands in the pause rather than on the mutator.

/// Location of a reference field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) enum Slot {
    /// Slot `index` of a heap object (see [`crate::object`] for the layout).
    Field {
        /// Object holding the slot, at its address when recorded.
        holder: crate::ObjectRef,
        /// Slot index within the holder.
        index: u32,
    },
    /// A global reference cell.
    Global(u32),
    /// A shadow-stack root.
    Root(u32),
}

impl Slot {
    pub(crate) fn field(holder: crate::ObjectRef, index: usize) -> Self {
        Self::Field {
            holder,
            index: u32::try_from(index).expect("slot index exceeds u32"),
        }
    }
}

/// Append-only buffer of recorded slots.
#[derive(Debug, Default)]
pub(crate) struct RememberedSet {
    buffer: Vec<Slot>,
}

impl RememberedSet {
    /// Create an empty set.
    #[must_use]
    pub(crate) const fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Record a slot.
    #[inline]
    pub(crate) fn record(&mut self, slot: Slot) {
        self.buffer.push(slot);
    }

    /// Take every buffered slot, deduplicated, leaving the set empty.
    pub(crate) fn drain(&mut self) -> Vec<Slot> {
        let mut slots = std::mem::take(&mut self.buffer);
        slots.sort_unstable();
        slots.dedup();
        slots
    }

    /// Discard all buffered slots.
    pub(crate) fn clear(&mut self) {
        self.buffer.clear();
    }
}
