//! Global reference registry.
//!
//! Global handles are off-heap root cells owned by the embedder. A strong
//! cell keeps its target alive; a weak cell does not, and may carry a
//! [`Finalizer`] that runs once the target is found dead.
//!
//! One-shot invocation is enforced by construction: the finalizer is an
//! `FnOnce` that is moved out of its node when the node is cleared, so a
//! cell can never be finalized twice.

use std::any::Any;
use std::fmt;

use crate::object::{IdentityHash, ObjectRef};

/// Handle to a global reference cell.
///
/// Handles carry a generation so a disposed cell is never confused with a
/// later cell reusing the same index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GlobalHandle {
    index: u32,
    generation: u32,
}

impl GlobalHandle {
    pub(crate) const fn index(self) -> u32 {
        self.index
    }
}

/// Whether a global cell keeps its target alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strength {
    /// The cell is a root.
    Strong,
    /// The cell is cleared once its target is otherwise unreachable.
    Weak,
}

/// Data handed to a finalization callback.
pub struct WeakCallbackInfo {
    /// The cell that was cleared.
    pub handle: GlobalHandle,
    /// Identity hash of the dead target, if one had been assigned.
    pub identity_hash: Option<IdentityHash>,
    /// The opaque parameter registered with the finalizer.
    pub parameter: Option<Box<dyn Any>>,
}

impl fmt::Debug for WeakCallbackInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakCallbackInfo")
            .field("handle", &self.handle)
            .field("identity_hash", &self.identity_hash)
            .field("has_parameter", &self.parameter.is_some())
            .finish()
    }
}

type WeakCallback = Box<dyn FnOnce(WeakCallbackInfo)>;

/// Finalization callback plus its opaque parameter.
pub struct Finalizer {
    callback: WeakCallback,
    parameter: Option<Box<dyn Any>>,
}

impl Finalizer {
    /// Finalizer without a parameter.
    pub fn new(callback: impl FnOnce(WeakCallbackInfo) + 'static) -> Self {
        Self {
            callback: Box::new(callback),
            parameter: None,
        }
    }

    /// Attach an opaque parameter handed back to the callback.
    #[must_use]
    pub fn with_parameter(mut self, parameter: impl Any) -> Self {
        self.parameter = Some(Box::new(parameter));
        self
    }

    pub(crate) fn invoke(self, handle: GlobalHandle, identity_hash: Option<IdentityHash>) {
        (self.callback)(WeakCallbackInfo {
            handle,
            identity_hash,
            parameter: self.parameter,
        });
    }
}

impl fmt::Debug for Finalizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Finalizer")
            .field("has_parameter", &self.parameter.is_some())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeState {
    Free,
    InUse,
    Cleared,
}

#[derive(Debug)]
struct Node {
    generation: u32,
    state: NodeState,
    target: Option<ObjectRef>,
    strength: Strength,
    finalizer: Option<Finalizer>,
}

/// A weak cell whose target died this cycle.
#[derive(Debug)]
pub(crate) struct PendingWeak {
    pub(crate) handle: GlobalHandle,
    pub(crate) target: ObjectRef,
    pub(crate) has_finalizer: bool,
}

/// The registry of global cells.
#[derive(Debug, Default)]
pub(crate) struct GlobalHandles {
    nodes: Vec<Node>,
    free: Vec<u32>,
}

impl GlobalHandles {
    pub(crate) const fn new() -> Self {
        Self {
            nodes: Vec::new(),
            free: Vec::new(),
        }
    }

    pub(crate) fn create(
        &mut self,
        target: ObjectRef,
        strength: Strength,
        finalizer: Option<Finalizer>,
    ) -> GlobalHandle {
        assert!(
            strength == Strength::Weak || finalizer.is_none(),
            "finalizers require a weak cell"
        );
        let index = if let Some(index) = self.free.pop() {
            index
        } else {
            let index = u32::try_from(self.nodes.len()).expect("too many global handles");
            self.nodes.push(Node {
                generation: 0,
                state: NodeState::Free,
                target: None,
                strength: Strength::Strong,
                finalizer: None,
            });
            index
        };
        let node = &mut self.nodes[index as usize];
        node.state = NodeState::InUse;
        node.target = Some(target);
        node.strength = strength;
        node.finalizer = finalizer;
        GlobalHandle {
            index,
            generation: node.generation,
        }
    }

    /// # Panics
    ///
    /// Panics if the handle was disposed.
    fn node(&self, handle: GlobalHandle) -> &Node {
        let node = self
            .nodes
            .get(handle.index as usize)
            .filter(|n| n.generation == handle.generation && n.state != NodeState::Free);
        node.unwrap_or_else(|| panic!("use of disposed global handle {handle:?}"))
    }

    fn node_mut(&mut self, handle: GlobalHandle) -> &mut Node {
        let node = self
            .nodes
            .get_mut(handle.index as usize)
            .filter(|n| n.generation == handle.generation && n.state != NodeState::Free);
        node.unwrap_or_else(|| panic!("use of disposed global handle {handle:?}"))
    }

    pub(crate) fn dispose(&mut self, handle: GlobalHandle) {
        let node = self.node_mut(handle);
        node.state = NodeState::Free;
        node.target = None;
        node.finalizer = None;
        node.generation = node.generation.wrapping_add(1);
        self.free.push(handle.index);
    }

    pub(crate) fn target(&self, handle: GlobalHandle) -> Option<ObjectRef> {
        self.node(handle).target
    }

    pub(crate) fn is_weak(&self, handle: GlobalHandle) -> bool {
        self.node(handle).strength == Strength::Weak
    }

    pub(crate) fn is_cleared(&self, handle: GlobalHandle) -> bool {
        self.node(handle).state == NodeState::Cleared
    }

    /// Returns `true` when a strong cell became weak.
    pub(crate) fn make_weak(&mut self, handle: GlobalHandle, finalizer: Option<Finalizer>) -> bool {
        let node = self.node_mut(handle);
        let relaxed = node.strength == Strength::Strong && node.target.is_some();
        node.strength = Strength::Weak;
        node.finalizer = finalizer;
        relaxed
    }

    pub(crate) fn clear_weak(&mut self, handle: GlobalHandle) -> Option<ObjectRef> {
        let node = self.node_mut(handle);
        node.strength = Strength::Strong;
        node.finalizer = None;
        node.target
    }

    /// Strong cells with a target, as `(cell index, target)`.
    pub(crate) fn strong_roots(&self) -> impl Iterator<Item = (u32, ObjectRef)> + '_ {
        self.live_cells(Strength::Strong)
    }

    /// Weak cells with a target, as `(cell index, target)`.
    pub(crate) fn weak_cells(&self) -> impl Iterator<Item = (u32, ObjectRef)> + '_ {
        self.live_cells(Strength::Weak)
    }

    fn live_cells(&self, strength: Strength) -> impl Iterator<Item = (u32, ObjectRef)> + '_ {
        self.nodes.iter().zip(0u32..).filter_map(move |(node, index)| {
            if node.state == NodeState::InUse && node.strength == strength {
                node.target.map(|target| (index, target))
            } else {
                None
            }
        })
    }

    /// Weak cells whose target fails `is_live`.
    pub(crate) fn identify_dead_weak(&self, is_live: impl Fn(ObjectRef) -> bool) -> Vec<PendingWeak> {
        self.nodes
            .iter()
            .zip(0u32..)
            .filter(|(node, _)| node.state == NodeState::InUse && node.strength == Strength::Weak)
            .filter_map(|(node, index)| {
                let target = node.target?;
                (!is_live(target)).then(|| PendingWeak {
                    handle: GlobalHandle {
                        index,
                        generation: node.generation,
                    },
                    target,
                    has_finalizer: node.finalizer.is_some(),
                })
            })
            .collect()
    }

    /// Clear a dead weak cell and hand back its finalizer.
    ///
    /// # Panics
    ///
    /// Panics if the cell was already cleared; that would be a second
    /// finalization of the same cell.
    pub(crate) fn clear_dead(&mut self, handle: GlobalHandle) -> Option<Finalizer> {
        let node = self.node_mut(handle);
        assert!(
            node.state == NodeState::InUse && node.target.is_some(),
            "weak cell {handle:?} finalized twice"
        );
        node.target = None;
        node.state = NodeState::Cleared;
        node.finalizer.take()
    }

    pub(crate) fn cell_target(&self, index: u32) -> Option<ObjectRef> {
        self.nodes
            .get(index as usize)
            .filter(|n| n.state == NodeState::InUse)
            .and_then(|n| n.target)
    }

    pub(crate) fn set_cell_target(&mut self, index: u32, target: ObjectRef) {
        let node = &mut self.nodes[index as usize];
        debug_assert_eq!(node.state, NodeState::InUse);
        node.target = Some(target);
    }

    pub(crate) fn len(&self) -> usize {
        self.nodes.len() - self.free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::RegionId;
    use std::cell::Cell;
    use std::rc::Rc;

    fn obj(n: u32) -> ObjectRef {
        ObjectRef::new(RegionId::new(0, 0), n)
    }

    #[test]
    fn test_create_and_make_weak() {
        let mut handles = GlobalHandles::new();
        let h = handles.create(obj(1), Strength::Strong, None);
        assert!(!handles.is_weak(h));
        assert_eq!(handles.strong_roots().count(), 1);

        assert!(handles.make_weak(h, None));
        assert!(handles.is_weak(h));
        assert_eq!(handles.strong_roots().count(), 0);
        assert_eq!(handles.weak_cells().count(), 1);

        assert_eq!(handles.clear_weak(h), Some(obj(1)));
        assert!(!handles.is_weak(h));
    }

    #[test]
    fn test_dispose_bumps_generation() {
        let mut handles = GlobalHandles::new();
        let h = handles.create(obj(1), Strength::Strong, None);
        handles.dispose(h);
        let h2 = handles.create(obj(2), Strength::Strong, None);
        assert_eq!(h.index(), h2.index());
        assert_ne!(h, h2);
        assert_eq!(handles.target(h2), Some(obj(2)));
        assert_eq!(handles.len(), 1);
    }

    #[test]
    #[should_panic(expected = "use of disposed global handle")]
    fn test_use_after_dispose_panics() {
        let mut handles = GlobalHandles::new();
        let h = handles.create(obj(1), Strength::Strong, None);
        handles.dispose(h);
        let _ = handles.target(h);
    }

    #[test]
    fn test_clear_dead_takes_finalizer_once() {
        let calls = Rc::new(Cell::new(0));
        let mut handles = GlobalHandles::new();
        let counter = Rc::clone(&calls);
        let h = handles.create(
            obj(4),
            Strength::Weak,
            Some(Finalizer::new(move |_| counter.set(counter.get() + 1))),
        );

        let pending = handles.identify_dead_weak(|_| false);
        assert_eq!(pending.len(), 1);
        assert!(pending[0].has_finalizer);

        let finalizer = handles.clear_dead(h).expect("finalizer registered");
        finalizer.invoke(h, None);
        assert_eq!(calls.get(), 1);
        assert!(handles.is_cleared(h));
        assert_eq!(handles.target(h), None);
        assert!(handles.identify_dead_weak(|_| false).is_empty());
    }

    #[test]
    #[should_panic(expected = "finalized twice")]
    fn test_double_clear_is_fatal() {
        let mut handles = GlobalHandles::new();
        let h = handles.create(obj(4), Strength::Weak, None);
        handles.clear_dead(h);
        handles.clear_dead(h);
    }

    #[test]
    fn test_finalizer_parameter_round_trip() {
        let seen = Rc::new(Cell::new(0));
        let out = Rc::clone(&seen);
        let finalizer = Finalizer::new(move |info| {
            let value = info.parameter.and_then(|p| p.downcast::<i32>().ok());
            out.set(value.map_or(-1, |v| *v));
        })
        .with_parameter(1234_i32);
        finalizer.invoke(
            GlobalHandle {
                index: 0,
                generation: 0,
            },
            None,
        );
        assert_eq!(seen.get(), 1234);
    }
}
