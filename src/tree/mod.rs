//! The skeletal B-tree map and its supporting machinery.

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub(crate) mod errors;
mod imp;

pub use self::{
    errors::{Error, TaskFailure},
    imp::{
        Iter, NodeRepr, NodeTranslator, SkeletonTree, TreeRepr, TreeTranslator,
    },
};

/// Configuration of a skeletal tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeConfig {
    /// Minimum fan-out: every non-root node holds between `node_min` and
    /// `2 * node_min` entries.
    pub node_min: usize,
    /// Capacity of the bounded hand-off queue between the bulk-inflate
    /// driver and the pull scheduler; a full queue backpressures the
    /// driver.
    pub queue_depth: usize,
    /// How long the bulk-inflate driver waits on the completion queue
    /// before re-inspecting the pool and the failure map.
    pub poll_grace: Duration,
}

impl Default for TreeConfig {
    fn default() -> Self {
        TreeConfig {
            node_min: 8,
            queue_depth: 16,
            poll_grace: Duration::from_secs(1),
        }
    }
}

impl TreeConfig {
    /// Configuration with the given minimum fan-out and default queueing.
    pub fn with_node_min(node_min: usize) -> Self {
        assert!(node_min >= 1, "node_min must be at least 1");
        TreeConfig {
            node_min,
            ..TreeConfig::default()
        }
    }
}
