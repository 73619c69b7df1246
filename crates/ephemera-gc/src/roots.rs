//! Root tracking using a shadow stack.
//!
//! Embedder-designated roots live on a shadow stack organised in frames.
//! A frame corresponds to a handle scope: leaving the scope drops every
//! root pushed since it was entered.

use crate::object::ObjectRef;

/// Marker returned by [`Heap::enter_scope`](crate::Heap::enter_scope).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "a scope must be left with Heap::leave_scope"]
pub struct ScopeMarker {
    depth: usize,
    height: usize,
}

/// A shadow stack of object roots.
#[derive(Debug, Default)]
pub(crate) struct ShadowStack {
    roots: Vec<ObjectRef>,
    frame_markers: Vec<usize>,
}

impl ShadowStack {
    /// Create an empty shadow stack.
    #[must_use]
    pub(crate) const fn new() -> Self {
        Self {
            roots: Vec::new(),
            frame_markers: Vec::new(),
        }
    }

    /// Register a new root in the innermost frame.
    pub(crate) fn push(&mut self, obj: ObjectRef) -> u32 {
        let index = u32::try_from(self.roots.len()).expect("shadow stack overflow");
        self.roots.push(obj);
        index
    }

    /// Number of roots.
    #[must_use]
    pub(crate) fn len(&self) -> usize {
        self.roots.len()
    }

    /// Iterate over roots as `(index, object)`.
    pub(crate) fn iter(&self) -> impl Iterator<Item = (u32, ObjectRef)> + '_ {
        self.roots.iter().copied().zip(0u32..).map(|(obj, i)| (i, obj))
    }

    pub(crate) fn get(&self, index: u32) -> Option<ObjectRef> {
        self.roots.get(index as usize).copied()
    }

    pub(crate) fn set(&mut self, index: u32, obj: ObjectRef) {
        self.roots[index as usize] = obj;
    }

    /// Open a frame.
    pub(crate) fn push_frame(&mut self) -> ScopeMarker {
        self.frame_markers.push(self.roots.len());
        ScopeMarker {
            depth: self.frame_markers.len(),
            height: self.roots.len(),
        }
    }

    /// Close the frame opened by `marker`, dropping its roots.
    ///
    /// Returns whether any root was dropped.
    ///
    /// # Panics
    ///
    /// Panics if `marker` is not the innermost open frame.
    pub(crate) fn pop_frame(&mut self, marker: ScopeMarker) -> bool {
        assert_eq!(
            self.frame_markers.len(),
            marker.depth,
            "scopes must be left in LIFO order"
        );
        let height = self.frame_markers.pop().unwrap_or(0);
        debug_assert_eq!(height, marker.height);
        let dropped = self.roots.len() > height;
        self.roots.truncate(height);
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::RegionId;

    #[test]
    fn test_frames_truncate_roots() {
        let mut stack = ShadowStack::new();
        stack.push(ObjectRef::new(RegionId::new(0, 0), 0));

        let outer = stack.push_frame();
        stack.push(ObjectRef::new(RegionId::new(0, 0), 1));
        let inner = stack.push_frame();
        assert!(!stack.pop_frame(inner));
        assert_eq!(stack.len(), 2);

        assert!(stack.pop_frame(outer));
        assert_eq!(stack.len(), 1);
        assert_eq!(stack.iter().next(), Some((0, ObjectRef::new(RegionId::new(0, 0), 0))));
    }

    #[test]
    #[should_panic(expected = "LIFO")]
    fn test_out_of_order_pop_panics() {
        let mut stack = ShadowStack::new();
        let outer = stack.push_frame();
        let _inner = stack.push_frame();
        stack.pop_frame(outer);
    }
}
