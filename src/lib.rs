//! A skeletal B-tree map.
//!
//! An ordered associative container whose nodes individually reside
//! either in memory ("live") or as lightweight placeholders ("ghosts")
//! backed by an external, possibly high-latency, content-addressed store.
//! The tree materializes nodes on demand through targeted pulls, persists
//! bare subtrees through pushes, and can bulk-inflate itself with a pool
//! of asynchronous fetch tasks supplied by the archiver.
//!
//! The layers, bottom up:
//!
//! * [`entries`] — the ordered entries map local to one node, with a
//!   deflated tag marking it bare.
//! * [`tree`] — the B-tree base (splits, rotations, merges, iteration)
//!   plus the skeletal overlay: targeted and whole-tree
//!   `inflate`/`deflate`, the parallel bulk inflater, and the node/tree
//!   translators that define the persisted shape.
//! * [`archive`] — the archiver contracts ([`Archiver`],
//!   [`BatchArchiver`], [`ScheduledArchiver`]) and the in-memory
//!   reference implementation.
//!
//! ```
//! use skeleton_btree::{SkeletonTree, TreeConfig, MemArchiver, NodeRepr};
//!
//! let archiver: MemArchiver<NodeRepr<u64, String>> = MemArchiver::new();
//! let mut tree = SkeletonTree::with_archiver(TreeConfig::with_node_min(2), archiver);
//! for k in 0..100u64 {
//!     tree.insert(k, k.to_string())?;
//! }
//! tree.deflate()?;           // the tree is now a bare shell over ghosts
//! tree.inflate_scheduled()?; // fetch everything back, in parallel
//! assert_eq!(tree.get(&42)?.map(String::as_str), Some("42"));
//! # Ok::<(), skeleton_btree::Error<u64>>(())
//! ```

mod bounds;

pub mod archive;
pub mod entries;
pub mod tree;

pub use self::{
    archive::{
        ArchiveError, Archiver, BatchArchiver, CompletionQueue, FailureMap, MemArchiver,
        ObjectMeta, Progress, ProgressTracker, PullFailure, PullTask, PushTask, ScheduledArchiver,
        Scheduler,
    },
    entries::EntryMap,
    tree::{
        Error, Iter, NodeRepr, NodeTranslator, SkeletonTree, TaskFailure, TreeConfig, TreeRepr,
        TreeTranslator,
    },
};
