use crossbeam_epoch::{Atomic, Guard, Pointer, Shared};
use parking_lot::{Mutex, MutexGuard};
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Binary search tree node.
///
/// Key is immutable for the whole node lifetime: when a node with two children
/// removed from tree, it replaced by new node instead of rewriting key in place.
/// Child pointers and `marked` flag are changed only by thread which holds node lock,
/// but can be read by any thread at any time.
pub struct Node {
    key: i32,
    left: Atomic<Node>,
    right: Atomic<Node>,
    /// Node logically removed from tree. Never reverts to `false`.
    marked: AtomicBool,
    /// Generation of latest structural change observed below this node.
    generation: AtomicU64,
    lock: Mutex<()>,
}

/// Child slot of node.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Direction {
    Left,
    Right,
}

impl Direction {
    /// Slot of node with `node_key` which can hold `key`.
    #[inline(always)]
    pub fn towards(key: i32, node_key: i32) -> Direction {
        if key < node_key {
            Direction::Left
        } else {
            Direction::Right
        }
    }

    #[inline(always)]
    pub fn opposite(self) -> Direction {
        match self {
            Direction::Left => Direction::Right,
            Direction::Right => Direction::Left,
        }
    }
}

impl Node {
    pub fn new(key: i32) -> Node {
        Node {
            key,
            left: Atomic::null(),
            right: Atomic::null(),
            marked: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            lock: Mutex::new(()),
        }
    }

    /// Create node which takes place of existing node in tree:
    /// new node adopts children and generation of replaced node.
    pub fn with_children<'g>(
        key: i32,
        left: Shared<'g, Node>,
        right: Shared<'g, Node>,
        generation: u64,
    ) -> Node {
        Node {
            key,
            left: Atomic::from(left),
            right: Atomic::from(right),
            marked: AtomicBool::new(false),
            generation: AtomicU64::new(generation),
            lock: Mutex::new(()),
        }
    }

    #[inline(always)]
    pub fn key(&self) -> i32 {
        self.key
    }

    #[inline(always)]
    pub fn load_child<'g>(&self, direction: Direction, guard: &'g Guard) -> Shared<'g, Node> {
        match direction {
            Direction::Left => self.left.load(Ordering::Acquire, guard),
            Direction::Right => self.right.load(Ordering::Acquire, guard),
        }
    }

    /// Replace child in passed slot. Caller should hold node lock
    /// (except for nodes not yet reachable from tree root).
    #[inline(always)]
    pub fn store_child<P: Pointer<Node>>(&self, direction: Direction, child: P) {
        match direction {
            Direction::Left => self.left.store(child, Ordering::Release),
            Direction::Right => self.right.store(child, Ordering::Release),
        }
    }

    #[inline(always)]
    pub fn is_marked(&self) -> bool {
        self.marked.load(Ordering::SeqCst)
    }

    /// Logically remove node. Caller should hold node lock.
    #[inline(always)]
    pub fn mark(&self) {
        self.marked.store(true, Ordering::SeqCst);
    }

    #[inline(always)]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Raise node generation to passed value. Generation never goes back.
    #[inline(always)]
    pub fn publish_generation(&self, generation: u64) {
        self.generation.fetch_max(generation, Ordering::SeqCst);
    }

    #[inline(always)]
    pub fn lock(&self) -> MutexGuard<'_, ()> {
        self.lock.lock()
    }

    /// Node is still live and new node with passed key can be attached directly to it.
    pub fn can_adopt(&self, key: i32, guard: &Guard) -> bool {
        !self.is_marked()
            && key != self.key
            && self
                .load_child(Direction::towards(key, self.key), guard)
                .is_null()
    }

    /// Slot which currently points to passed child, if any.
    pub fn direction_of(&self, child: Shared<'_, Node>, guard: &Guard) -> Option<Direction> {
        if self.load_child(Direction::Left, guard) == child {
            Some(Direction::Left)
        } else if self.load_child(Direction::Right, guard) == child {
            Some(Direction::Right)
        } else {
            None
        }
    }
}

// Node doesn't own its children: tree frees reachable nodes on drop and
// unlinked nodes are freed through epoch-based reclamation.

impl Display for Node {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Node(key: {:?}, marked: {:?}, generation: {:?})",
            self.key,
            self.is_marked(),
            self.generation()
        )
    }
}

#[cfg(test)]
mod tests {
    use crate::node::{Direction, Node};
    use crossbeam_epoch::Owned;

    #[test]
    fn direction_towards_key() {
        assert_eq!(Direction::towards(1, 5), Direction::Left);
        assert_eq!(Direction::towards(9, 5), Direction::Right);
        assert_eq!(Direction::towards(i32::MIN + 1, i32::MIN), Direction::Right);
        assert_eq!(Direction::Left.opposite(), Direction::Right);
        assert_eq!(Direction::Right.opposite(), Direction::Left);
    }

    #[test]
    fn adopt_only_into_empty_slot() {
        let guard = crossbeam_epoch::pin();
        let node = Node::new(10);
        assert!(node.can_adopt(5, &guard));
        assert!(node.can_adopt(15, &guard));
        assert!(!node.can_adopt(10, &guard));

        node.store_child(Direction::Left, Owned::new(Node::new(5)));
        assert!(!node.can_adopt(5, &guard));
        assert!(!node.can_adopt(3, &guard));
        assert!(node.can_adopt(15, &guard));

        unsafe { drop(node.load_child(Direction::Left, &guard).into_owned()) };
    }

    #[test]
    fn marked_node_adopts_nothing() {
        let guard = crossbeam_epoch::pin();
        let node = Node::new(10);
        node.mark();
        assert!(node.is_marked());
        assert!(!node.can_adopt(5, &guard));
        assert!(!node.can_adopt(15, &guard));
        node.mark();
        assert!(node.is_marked());
    }

    #[test]
    fn direction_of_child() {
        let guard = crossbeam_epoch::pin();
        let node = Node::new(10);
        let left = Owned::new(Node::new(5)).into_shared(&guard);
        let right = Owned::new(Node::new(15)).into_shared(&guard);
        let stranger = Owned::new(Node::new(15)).into_shared(&guard);
        node.store_child(Direction::Left, left);
        node.store_child(Direction::Right, right);

        assert_eq!(node.direction_of(left, &guard), Some(Direction::Left));
        assert_eq!(node.direction_of(right, &guard), Some(Direction::Right));
        assert_eq!(node.direction_of(stranger, &guard), None);

        unsafe {
            drop(left.into_owned());
            drop(right.into_owned());
            drop(stranger.into_owned());
        }
    }

    #[test]
    fn replacement_adopts_children_and_generation() {
        let guard = crossbeam_epoch::pin();
        let left = Owned::new(Node::new(5)).into_shared(&guard);
        let right = Owned::new(Node::new(15)).into_shared(&guard);
        let node = Node::with_children(12, left, right, 7);

        assert_eq!(node.key(), 12);
        assert_eq!(node.generation(), 7);
        assert!(!node.is_marked());
        assert_eq!(node.load_child(Direction::Left, &guard), left);
        assert_eq!(node.load_child(Direction::Right, &guard), right);

        unsafe {
            drop(left.into_owned());
            drop(right.into_owned());
        }
    }

    #[test]
    fn generation_never_goes_back() {
        let node = Node::new(1);
        node.publish_generation(5);
        assert_eq!(node.generation(), 5);
        node.publish_generation(3);
        assert_eq!(node.generation(), 5);
        node.publish_generation(8);
        assert_eq!(node.generation(), 8);
    }
}
