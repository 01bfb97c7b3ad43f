//! # Optimistic BST
//! Concurrent set of `i32` keys built on unbalanced binary search tree.
//!
//! Lookups never take locks: they descend the tree optimistically and use
//! per-node generation stamps to detect that the path they walk was restructured
//! by concurrent removal. Inserts lock single node(future parent of new key),
//! removes lock parent and node being removed(and two more nodes when removed node
//! has two children). Removal is lazy: node marked as deleted first and only then
//! unlinked from tree.
//!
//! # Usage
//! ```
//! use optimistic_bst::OptimisticBst;
//!
//! let tree = OptimisticBst::new();
//! for key in [5, 3, 7, 1, 9, 4, 6] {
//!     assert!(tree.insert(key));
//! }
//! assert!(!tree.insert(5));
//! assert_eq!(tree.size(), 7);
//! assert_eq!(tree.keysum(), 35);
//!
//! assert!(tree.remove(5));
//! assert!(!tree.contains(5));
//! assert!(tree.contains(6));
//! assert!(tree.check_ordering_invariant());
//! ```

mod generation;
mod node;
mod tracing_helpers;

use crate::generation::GenerationClock;
use crate::node::{Direction, Node};
#[allow(unused_imports)]
use crate::tracing_helpers::{debug_log, trace_log};
use crossbeam_epoch::{Guard, Owned, Shared};
use std::cmp::Ordering as KeyOrdering;
use std::fmt::{Debug, Formatter};
use std::ptr;
use std::sync::atomic::{AtomicI64, AtomicIsize, Ordering};

/// Concurrent ordered set of `i32` keys.
///
/// # Visibility of changes
/// All operations are linearizable: insert takes effect when new node becomes reachable
/// from tree root, remove takes effect when node marked as deleted. `contains` which runs
/// after completed `remove` never observes removed key.
///
/// # Reserved key
/// [OptimisticBst::SENTINEL_KEY] (`i32::MIN`) used by internal root node and can't be stored in
/// tree: `insert`, `remove` and `contains` always return `false` for it.
///
/// # Memory reclamation
/// Nodes unlinked from tree freed by [crossbeam_epoch] when no thread can hold reference to
/// them anymore. All public methods pin current thread internally.
///
/// # Balancing
/// Tree is never rebalanced: height depends on insertion order and can be linear in worst
/// case.
///
/// # Thread safety
/// Tree can be safely shared between threads, e.g. it implements [Send] and [Sync].
pub struct OptimisticBst {
    /// Sentinel node which holds no key. All keys stored in its right subtree.
    root: Node,
    clock: GenerationClock,
    count: AtomicIsize,
    keysum: AtomicI64,
}

impl OptimisticBst {
    /// Key reserved for tree root.
    pub const SENTINEL_KEY: i32 = i32::MIN;

    /// Create empty tree.
    pub fn new() -> OptimisticBst {
        OptimisticBst {
            root: Node::new(Self::SENTINEL_KEY),
            clock: GenerationClock::new(),
            count: AtomicIsize::new(0),
            keysum: AtomicI64::new(0),
        }
    }

    /// Insert key if it not already exists in tree.
    /// # Return
    /// Returns true if key inserted, otherwise false if tree already contains node
    /// with same key(including node which is being removed concurrently).
    pub fn insert(&self, key: i32) -> bool {
        if key == Self::SENTINEL_KEY {
            return false;
        }

        let guard = crossbeam_epoch::pin();
        loop {
            match self.try_insert(key, &guard) {
                Ok(()) => break,
                Err(InsertError::DuplicateKey) => return false,
                Err(InsertError::Retry) => {
                    trace_log!(key, "insert validation failed, retry");
                }
            }
        }

        self.count.fetch_add(1, Ordering::SeqCst);
        self.keysum.fetch_add(key as i64, Ordering::SeqCst);
        true
    }

    /// Remove key from tree.
    /// # Return
    /// Returns true if key was present in tree and removed by this call.
    pub fn remove(&self, key: i32) -> bool {
        if key == Self::SENTINEL_KEY {
            return false;
        }

        let guard = crossbeam_epoch::pin();
        loop {
            match self.try_remove(key, &guard) {
                Ok(()) => break,
                Err(RemoveError::KeyNotFound) => return false,
                Err(RemoveError::Retry) => {
                    trace_log!(key, "remove validation failed, retry");
                }
            }
        }

        self.count.fetch_sub(1, Ordering::SeqCst);
        self.keysum.fetch_sub(key as i64, Ordering::SeqCst);
        true
    }

    /// Check that tree contains key.
    pub fn contains(&self, key: i32) -> bool {
        if key == Self::SENTINEL_KEY {
            return false;
        }

        let guard = crossbeam_epoch::pin();
        loop {
            let position = self.find(key, &guard);
            match unsafe { position.node.as_ref() } {
                None => return false,
                Some(node) if !node.is_marked() => return true,
                Some(_) if self.is_settled(&position) => return false,
                Some(_) => {
                    trace_log!(key, "marked node found after tree restructure, retry");
                }
            }
        }
    }

    /// Count of keys in tree.
    ///
    /// Counter updated after insert/remove completes, so concurrent changes may be not
    /// reflected yet.
    pub fn size(&self) -> usize {
        // counter can be temporary negative when remove of key completes
        // before insert of same key updates counter
        self.count.load(Ordering::SeqCst).max(0) as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Sum of all keys in tree. Has same consistency guarantees as [OptimisticBst::size].
    pub fn keysum(&self) -> i64 {
        self.keysum.load(Ordering::SeqCst)
    }

    /// Check that keys of live nodes are ordered: each key in left subtree of node is
    /// less than node key and each key of right subtree is greater.
    ///
    /// Method doesn't synchronize with concurrent changes and can report false
    /// violation if tree modified during check. Should be used only when tree is
    /// not changed by other threads.
    pub fn check_ordering_invariant(&self) -> bool {
        let guard = crossbeam_epoch::pin();
        // stack of (node, exclusive lower bound, exclusive upper bound)
        let mut stack: Vec<(Shared<Node>, Option<i32>, Option<i32>)> = vec![
            (
                self.root.load_child(Direction::Left, &guard),
                None,
                Some(Self::SENTINEL_KEY),
            ),
            (
                self.root.load_child(Direction::Right, &guard),
                Some(Self::SENTINEL_KEY),
                None,
            ),
        ];

        while let Some((node_ptr, lower, upper)) = stack.pop() {
            let node = match unsafe { node_ptr.as_ref() } {
                Some(node) => node,
                None => continue,
            };
            let left = node.load_child(Direction::Left, &guard);
            let right = node.load_child(Direction::Right, &guard);

            if node.is_marked() {
                // removed nodes don't bound their subtrees
                stack.push((left, lower, upper));
                stack.push((right, lower, upper));
                continue;
            }

            let key = node.key();
            if matches!(lower, Some(lower) if key <= lower)
                || matches!(upper, Some(upper) if key >= upper)
            {
                debug_log!(key, ?lower, ?upper, "ordering violation found");
                return false;
            }
            stack.push((left, lower, Some(key)));
            stack.push((right, Some(key), upper));
        }
        true
    }

    fn try_insert<'g>(&'g self, key: i32, guard: &'g Guard) -> Result<(), InsertError> {
        let position = self.find(key, guard);
        if !position.node.is_null() {
            return Err(InsertError::DuplicateKey);
        }

        let parent = position.parent;
        let _parent_lock = parent.lock();
        if !parent.can_adopt(key, guard) {
            return Err(InsertError::Retry);
        }

        parent.store_child(
            Direction::towards(key, parent.key()),
            Owned::new(Node::new(key)),
        );
        Ok(())
    }

    fn try_remove<'g>(&'g self, key: i32, guard: &'g Guard) -> Result<(), RemoveError> {
        let position = self.find(key, guard);
        let node = match unsafe { position.node.as_ref() } {
            Some(node) if !node.is_marked() => node,
            Some(_) if !self.is_settled(&position) => return Err(RemoveError::Retry),
            _ => return Err(RemoveError::KeyNotFound),
        };

        let parent = position.parent;
        let _parent_lock = parent.lock();
        let _node_lock = node.lock();
        // removal from marked parent is not allowed: parent is being unlinked
        // and any change of its children can be lost.
        let direction = match parent.direction_of(position.node, guard) {
            Some(direction) if !parent.is_marked() && !node.is_marked() => direction,
            _ => return Err(RemoveError::Retry),
        };

        node.mark();
        while let Err(SpliceError::Retry) = self.unlink(parent, direction, position.node, guard) {
            debug_log!(key, "successor changed concurrently, retry unlink");
        }

        unsafe { guard.defer_destroy(position.node) };
        Ok(())
    }

    /// Physically remove marked node from tree. Caller should hold locks of
    /// parent and node.
    fn unlink<'g>(
        &'g self,
        parent: &'g Node,
        direction: Direction,
        node_ptr: Shared<'g, Node>,
        guard: &'g Guard,
    ) -> Result<(), SpliceError> {
        let node = unsafe { node_ptr.deref() };
        let left = node.load_child(Direction::Left, guard);
        let right = node.load_child(Direction::Right, guard);
        if left.is_null() || right.is_null() {
            let remaining = if left.is_null() { right } else { left };
            parent.publish_generation(node.generation());
            parent.store_child(direction, remaining);
            return Ok(());
        }

        self.unlink_with_swap(parent, direction, node_ptr, guard)
    }

    /// Replace node with two children by copy of its closest key from `direction`
    /// subtree: successor when node is right child of parent, predecessor otherwise.
    fn unlink_with_swap<'g>(
        &'g self,
        parent: &'g Node,
        direction: Direction,
        node_ptr: Shared<'g, Node>,
        guard: &'g Guard,
    ) -> Result<(), SpliceError> {
        let node = unsafe { node_ptr.deref() };
        let inward = direction.opposite();

        let mut splice_parent: &'g Node = node;
        let mut swap_ptr = node.load_child(direction, guard);
        assert!(
            !swap_ptr.is_null(),
            "Locked node {} lost child during removal",
            node
        );
        loop {
            let next = unsafe { swap_ptr.deref() }.load_child(inward, guard);
            if next.is_null() {
                break;
            }
            splice_parent = unsafe { swap_ptr.deref() };
            swap_ptr = next;
        }
        let swap = unsafe { swap_ptr.deref() };

        // node already locked by caller
        let splice_parent_is_node = ptr::eq(splice_parent, node);
        let _splice_parent_lock = if splice_parent_is_node {
            None
        } else {
            Some(splice_parent.lock())
        };
        let _swap_lock = swap.lock();

        let edge = if splice_parent_is_node {
            direction
        } else {
            inward
        };
        if splice_parent.load_child(edge, guard) != swap_ptr
            || (!splice_parent_is_node && splice_parent.is_marked())
            || swap.is_marked()
            || !swap.load_child(inward, guard).is_null()
        {
            return Err(SpliceError::Retry);
        }

        let swap_child = swap.load_child(direction, guard);
        let replacement = Owned::new(Node::with_children(
            swap.key(),
            node.load_child(Direction::Left, guard),
            node.load_child(Direction::Right, guard),
            node.generation(),
        ));
        if splice_parent_is_node {
            replacement.store_child(direction, swap_child);
        }
        let replacement = replacement.into_shared(guard);

        assert!(
            parent.load_child(direction, guard) == node_ptr,
            "Edge from locked parent {} to locked node {} was changed concurrently",
            parent,
            node
        );
        // publish replacement before unlinking swapped node,
        // so its key always reachable from root
        parent.store_child(direction, replacement);

        // clock moves after replacement is published: search which finds marked
        // swapped node under older generation should be repeated
        let change_generation = self.clock.advance();
        if let Some(child) = unsafe { swap_child.as_ref() } {
            child.publish_generation(change_generation);
        } else if splice_parent_is_node {
            unsafe { replacement.deref() }.publish_generation(change_generation);
        } else {
            splice_parent.publish_generation(change_generation);
        }

        swap.mark();
        if !splice_parent_is_node {
            splice_parent.store_child(inward, swap_child);
        }

        debug_log!(
            removed = node.key(),
            replacement = swap.key(),
            generation = change_generation,
            "node replaced by swap node"
        );
        unsafe { guard.defer_destroy(swap_ptr) };
        Ok(())
    }

    /// Find node with passed key and its parent without locking.
    ///
    /// Search restarts from root if parent of visited node was restructured after
    /// search started.
    fn find<'g>(&'g self, key: i32, guard: &'g Guard) -> Position<'g> {
        loop {
            let snapshot = self.clock.snapshot();
            if let Some(position) = self.find_since(key, snapshot, guard) {
                return position;
            }
            trace_log!(key, snapshot, "stale search path, restart search");
        }
    }

    fn find_since<'g>(&'g self, key: i32, snapshot: u64, guard: &'g Guard) -> Option<Position<'g>> {
        let mut parent: &'g Node = &self.root;
        let mut node = self.root.load_child(Direction::Right, guard);
        if parent.generation() > snapshot {
            return None;
        }

        while let Some(node_ref) = unsafe { node.as_ref() } {
            let direction = match key.cmp(&node_ref.key()) {
                KeyOrdering::Equal => break,
                KeyOrdering::Less => Direction::Left,
                KeyOrdering::Greater => Direction::Right,
            };
            parent = node_ref;
            node = node_ref.load_child(direction, guard);
            if parent.generation() > snapshot {
                return None;
            }
        }

        Some(Position {
            parent,
            node,
            snapshot,
        })
    }

    /// No node was replaced by swap node since search which found passed position started.
    #[inline(always)]
    fn is_settled(&self, position: &Position) -> bool {
        self.clock.snapshot() == position.snapshot
    }
}

impl Default for OptimisticBst {
    fn default() -> Self {
        OptimisticBst::new()
    }
}

impl Debug for OptimisticBst {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OptimisticBst")
            .field("size", &self.size())
            .field("keysum", &self.keysum())
            .field("clock", &self.clock)
            .finish()
    }
}

impl Drop for OptimisticBst {
    fn drop(&mut self) {
        // tree dropped only when no other thread can access it:
        // free all nodes which still reachable from root.
        unsafe {
            let guard = crossbeam_epoch::unprotected();
            let mut stack = vec![
                self.root.load_child(Direction::Left, guard),
                self.root.load_child(Direction::Right, guard),
            ];
            while let Some(node) = stack.pop() {
                if node.is_null() {
                    continue;
                }
                let node_ref = node.deref();
                stack.push(node_ref.load_child(Direction::Left, guard));
                stack.push(node_ref.load_child(Direction::Right, guard));
                drop(node.into_owned());
            }
        }
    }
}

/// Result of tree search.
struct Position<'g> {
    /// Last visited node before found one. Sentinel root if found node is top node of tree.
    parent: &'g Node,
    /// Node with searched key or null if key not found.
    node: Shared<'g, Node>,
    /// Clock generation at which search started.
    snapshot: u64,
}

#[derive(Debug, Copy, Clone)]
enum InsertError {
    DuplicateKey,
    /// Parent was changed after search, search should be repeated.
    Retry,
}

#[derive(Debug, Copy, Clone)]
enum RemoveError {
    KeyNotFound,
    /// Parent or node was changed after search, search should be repeated.
    Retry,
}

#[derive(Debug, Copy, Clone)]
enum SpliceError {
    /// Successor moved or changed, only successor search should be repeated.
    Retry,
}
