//! The two variants of a tree node: live nodes and ghost placeholders.
//!
//! Every child slot of a live node is a tagged [`Child`]: either a live
//! subtree owned by this node, or a [`GhostNode`] that remembers nothing
//! but its key range, its subtree size and the archive handle of its
//! serialized form. The `ghosts` counter caches the number of ghosted
//! slots and is re-derived by assertion after structural changes.
//!
//! All mutation happens on a single driver thread; the attach operations
//! replace a slot in one assignment, so a reader that holds the parent
//! observes either the old or the new child, never a mixture.

use itertools::Itertools;

use crate::{archive::ObjectMeta, bounds, entries::EntryMap};

/// A live tree node covering the half-open key range `[lkey, rkey)`.
///
/// Boundary keys never appear as entries. A node with `n` entries has
/// `n + 1` children when it is a branch and none when it is a leaf; the
/// leaf flag is fixed at construction.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Node<K, V> {
    pub(super) lkey: Option<K>,
    pub(super) rkey: Option<K>,
    pub(super) entries: EntryMap<K, V>,
    pub(super) children: Vec<Child<K, V>>,
    /// Total number of entries in this subtree, ghosts included.
    pub(super) size: u64,
    pub(super) leaf: bool,
    /// Number of immediate children currently ghosted.
    pub(super) ghosts: usize,
}

/// One child slot of a branch node.
#[derive(Debug, Clone, PartialEq)]
pub(super) enum Child<K, V> {
    Live(Box<Node<K, V>>),
    Ghost(GhostNode<K>),
}

/// Placeholder for an archived subtree.
///
/// A ghost carries no parent pointer; its own key range serves as the
/// lookup handle. Ranges are unique and stable while a single writer
/// drives the tree, so the parent is re-located by descending from the
/// root. The `meta` handle is owned; the archived subtree itself belongs
/// to the archiver.
#[derive(Debug, Clone, PartialEq)]
pub(super) struct GhostNode<K> {
    pub(super) lkey: Option<K>,
    pub(super) rkey: Option<K>,
    pub(super) size: u64,
    pub(super) meta: ObjectMeta,
}

impl<K, V> Child<K, V> {
    pub(super) fn lkey(&self) -> Option<&K> {
        match self {
            Child::Live(node) => node.lkey.as_ref(),
            Child::Ghost(ghost) => ghost.lkey.as_ref(),
        }
    }

    pub(super) fn rkey(&self) -> Option<&K> {
        match self {
            Child::Live(node) => node.rkey.as_ref(),
            Child::Ghost(ghost) => ghost.rkey.as_ref(),
        }
    }

    /// Subtree size, served from the ghost's cache when not loaded.
    pub(super) fn size(&self) -> u64 {
        match self {
            Child::Live(node) => node.size,
            Child::Ghost(ghost) => ghost.size,
        }
    }

    pub(super) fn is_ghost(&self) -> bool {
        matches!(self, Child::Ghost(_))
    }

    pub(super) fn live(&self) -> Option<&Node<K, V>> {
        match self {
            Child::Live(node) => Some(node),
            Child::Ghost(_) => None,
        }
    }

    pub(super) fn live_mut(&mut self) -> Option<&mut Node<K, V>> {
        match self {
            Child::Live(node) => Some(node),
            Child::Ghost(_) => None,
        }
    }

    pub(super) fn ghost(&self) -> Option<&GhostNode<K>> {
        match self {
            Child::Live(_) => None,
            Child::Ghost(ghost) => Some(ghost),
        }
    }
}

impl<K: Ord + Clone, V> Node<K, V> {
    /// A new, empty, live leaf.
    pub(super) fn new_leaf(lkey: Option<K>, rkey: Option<K>) -> Self {
        Node {
            lkey,
            rkey,
            entries: EntryMap::new(),
            children: Vec::new(),
            size: 0,
            leaf: true,
            ghosts: 0,
        }
    }

    /// Assembles a node from parts, recomputing the derived fields.
    pub(super) fn from_parts(
        lkey: Option<K>,
        rkey: Option<K>,
        entries: EntryMap<K, V>,
        children: Vec<Child<K, V>>,
        leaf: bool,
    ) -> Self {
        let mut node = Node {
            lkey,
            rkey,
            entries,
            children,
            size: 0,
            leaf,
            ghosts: 0,
        };
        node.recompute();
        node
    }

    /// Number of entries in this node alone.
    pub(super) fn node_size(&self) -> usize {
        self.entries.len()
    }

    pub(super) fn child_count(&self) -> usize {
        self.children.len()
    }

    pub(super) fn is_leaf(&self) -> bool {
        self.leaf
    }

    /// Total entries in this subtree, counting archived descendants.
    pub(super) fn total_size(&self) -> u64 {
        self.size
    }

    /// Re-derives `size` and `ghosts` from the child slots.
    pub(super) fn recompute(&mut self) {
        self.size = self.entries.len() as u64
            + self.children.iter().map(Child::size).sum::<u64>();
        self.ghosts = self.children.iter().filter(|c| c.is_ghost()).count();
    }

    /// Index of the child slot immediately to the right of `key`, i.e. the
    /// slot whose range contains `key` when `key` is not an entry here.
    /// Navigation only ever descends with keys inside the node's range.
    pub(super) fn select_child(&self, key: &K) -> usize {
        debug_assert!(bounds::range_contains(
            self.lkey.as_ref(),
            self.rkey.as_ref(),
            key
        ));
        self.entries.rank_right(key)
    }

    /// Successive `(lkey_i, rkey_i)` ranges of the child slots, derived
    /// from the node range and the entry keys.
    pub(super) fn child_ranges(&self) -> impl Iterator<Item = (Option<&K>, Option<&K>)> {
        std::iter::once(self.lkey.as_ref())
            .chain(self.entries.keys().map(Some))
            .chain(std::iter::once(self.rkey.as_ref()))
            .tuple_windows()
    }

    /// Replaces the live child in `idx` with a ghost under `meta`.
    ///
    /// The child must be bare; its subtree has already been serialized
    /// out, so dropping it here completes the ownership hand-over to the
    /// archiver.
    pub(super) fn attach_ghost(&mut self, idx: usize, meta: ObjectMeta) {
        let ghost = {
            let child = self.children[idx]
                .live()
                .expect("attach_ghost on a slot that is already a ghost");
            debug_assert!(child.is_bare(), "attach_ghost on a non-bare child");
            GhostNode {
                lkey: child.lkey.clone(),
                rkey: child.rkey.clone(),
                size: child.size,
                meta,
            }
        };
        self.children[idx] = Child::Ghost(ghost);
        self.ghosts += 1;
        self.assert_ghosts();
    }

    /// Replaces the ghost in `idx` with its pulled live form. Fails with
    /// the node handed back when the slot is not a ghost of matching
    /// range.
    pub(super) fn attach_skeleton(
        &mut self,
        idx: usize,
        node: Node<K, V>,
    ) -> Result<(), Node<K, V>> {
        match &self.children[idx] {
            Child::Ghost(ghost) if ghost.lkey == node.lkey && ghost.rkey == node.rkey => {
                self.children[idx] = Child::Live(Box::new(node));
                self.ghosts -= 1;
                self.assert_ghosts();
                Ok(())
            }
            _ => Err(node),
        }
    }

    /// True iff this subtree holds no ghosts and no bare entries map.
    pub(super) fn is_fully_live(&self) -> bool {
        self.entries.is_live()
            && self.ghosts == 0
            && self
                .children
                .iter()
                .all(|c| c.live().map_or(false, Node::is_fully_live))
    }

    /// True iff the entries map is bare and every child is a ghost (or
    /// this is a leaf).
    pub(super) fn is_bare(&self) -> bool {
        self.entries.is_bare() && (self.leaf || self.ghosts == self.children.len())
    }

    pub(super) fn assert_ghosts(&self) {
        debug_assert_eq!(
            self.ghosts,
            self.children.iter().filter(|c| c.is_ghost()).count(),
            "ghost counter diverged from child slots"
        );
    }
}

/// Structural validation of a single node: leaf flag, fan-out bounds,
/// entry order within the node range, child range contiguity and size
/// consistency.
pub(super) fn verify_node_integrity<K: Ord + Clone, V>(
    node: &Node<K, V>,
    node_min: usize,
    is_root: bool,
) -> Result<(), String> {
    if node.leaf != node.children.is_empty() {
        return Err("leaf flag disagrees with child slots".into());
    }
    if !node.leaf && node.children.len() != node.entries.len() + 1 {
        return Err(format!(
            "branch with {} entries carries {} children",
            node.entries.len(),
            node.children.len()
        ));
    }
    let min = if is_root { 0 } else { node_min };
    if node.entries.len() < min || node.entries.len() > 2 * node_min {
        return Err(format!(
            "fan-out violation: {} entries outside [{}, {}]",
            node.entries.len(),
            min,
            2 * node_min
        ));
    }
    if let (Some(lkey), Some(first)) = (node.lkey.as_ref(), node.entries.first_key()) {
        if first <= lkey {
            return Err("entry at or below the lower bound".into());
        }
    }
    if let (Some(rkey), Some(last)) = (node.rkey.as_ref(), node.entries.last_key()) {
        if last >= rkey {
            return Err("entry at or above the upper bound".into());
        }
    }
    for (slot, (lkey, rkey)) in node.children.iter().zip(node.child_ranges()) {
        if slot.lkey() != lkey || slot.rkey() != rkey {
            return Err("child ranges not contiguous with entry boundaries".into());
        }
    }
    let expected = node.entries.len() as u64
        + node.children.iter().map(Child::size).sum::<u64>();
    if node.size != expected {
        return Err(format!(
            "size {} disagrees with recomputed {}",
            node.size, expected
        ));
    }
    if node.ghosts != node.children.iter().filter(|c| c.is_ghost()).count() {
        return Err("ghost counter disagrees with child slots".into());
    }
    Ok(())
}
