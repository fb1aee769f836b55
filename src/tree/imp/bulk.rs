//! The bulk inflater.
//!
//! A single driver thread owns the tree and walks it in key order while
//! the archiver's scheduler fetches ghost subtrees in parallel. The only
//! shared state is the bounded task channel, the completion queue and the
//! failure map; workers never touch tree nodes.
//!
//! The driver blocks in two places: sending into the full task channel
//! (deliberate backpressure against the scheduler) and the grace poll on
//! the completion queue, which doubles as the periodic re-inspection of
//! the pool when fetches fail silently.

use std::{
    cmp::{Ordering, Reverse},
    collections::{BTreeMap, BinaryHeap},
    fmt::Debug,
    time::Duration,
};

use crossbeam_channel::{bounded, Sender};
use log::{debug, trace, warn};

use crate::{
    archive::{
        ArchiveError, ArchiveObject, CompletionQueue, FailureMap, ObjectMeta, ProgressTracker,
        PullFailure, PullTask, ScheduledArchiver, Scheduler,
    },
    bounds,
    tree::errors::{Error, TaskFailure},
};

use super::{
    node::{Child, Node},
    translate::{NodeRepr, NodeTranslator},
    SkeletonTree,
};

/// A live node awaiting expansion, identified by its key range. The
/// ordering yields an in-order traversal of the pending set.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PendingNode<K> {
    lkey: Option<K>,
    rkey: Option<K>,
}

impl<K: Ord> PartialOrd for PendingNode<K> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<K: Ord> Ord for PendingNode<K> {
    fn cmp(&self, other: &Self) -> Ordering {
        bounds::cmp_lower(self.lkey.as_ref(), other.lkey.as_ref())
            .then_with(|| bounds::cmp_upper(self.rkey.as_ref(), other.rkey.as_ref()))
    }
}

/// Finds the node with exactly the given range, descending along `lkey`.
fn find_node<'t, K: Ord + Clone, V>(
    node: &'t mut Node<K, V>,
    lkey: Option<&K>,
    rkey: Option<&K>,
) -> Option<&'t mut Node<K, V>> {
    if node.lkey.as_ref() == lkey && node.rkey.as_ref() == rkey {
        return Some(node);
    }
    if node.is_leaf() {
        return None;
    }
    let idx = lkey.map_or(0, |key| node.select_child(key));
    if idx >= node.child_count() {
        return None;
    }
    match node.children[idx].live_mut() {
        Some(child) => find_node(child, lkey, rkey),
        None => None,
    }
}

/// Finds the parent of the child slot with exactly the given range.
fn find_parent_of<'t, K: Ord + Clone, V>(
    node: &'t mut Node<K, V>,
    lkey: Option<&K>,
    rkey: Option<&K>,
) -> Option<(&'t mut Node<K, V>, usize)> {
    if node.is_leaf() {
        return None;
    }
    let idx = lkey.map_or(0, |key| node.select_child(key));
    if idx >= node.child_count() {
        return None;
    }
    if node.children[idx].lkey() == lkey && node.children[idx].rkey() == rkey {
        return Some((node, idx));
    }
    match node.children[idx].live_mut() {
        Some(child) => find_parent_of(child, lkey, rkey),
        None => None,
    }
}

struct Driver<'t, K, V> {
    root: &'t mut Node<K, V>,
    queue: BinaryHeap<Reverse<PendingNode<K>>>,
    /// Submitted pulls: ghost range to the meta handle it was submitted
    /// under. Ranges are unique; metas may repeat when identical subtrees
    /// share a content-addressed handle.
    pending: BTreeMap<(Option<K>, Option<K>), ObjectMeta>,
    failures: Vec<TaskFailure<K>>,
    aborting: bool,
}

impl<'t, K, V> Driver<'t, K, V>
where
    K: Ord + Clone + Debug,
{
    fn new(root: &'t mut Node<K, V>) -> Self {
        Driver {
            root,
            queue: BinaryHeap::new(),
            pending: BTreeMap::new(),
            failures: Vec::new(),
            aborting: false,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn run<P: Scheduler>(
        &mut self,
        task_tx: &Sender<PullTask<K, NodeRepr<K, V>>>,
        completed: &CompletionQueue<K, NodeRepr<K, V>>,
        failed: &FailureMap,
        pool: &P,
        translator: NodeTranslator,
        tracker: Option<&ProgressTracker>,
        poll_grace: Duration,
    ) -> Result<(), Error<K>> {
        self.queue.push(Reverse(PendingNode {
            lkey: None,
            rkey: None,
        }));
        loop {
            self.drain_failures(failed);
            while let Some(task) = completed.try_pop() {
                self.attach(task, &translator)?;
            }
            if !self.aborting {
                if let Some(Reverse(next)) = self.queue.pop() {
                    self.expand(next, task_tx, tracker);
                    continue;
                }
            }
            let settled = self.pending.is_empty()
                && completed.is_empty()
                && failed.is_empty()
                && (self.aborting || self.queue.is_empty())
                && task_tx.is_empty()
                && !pool.is_active();
            if settled {
                break;
            }
            if let Some(task) = completed.poll(poll_grace) {
                self.attach(task, &translator)?;
            } else if !pool.is_active()
                && task_tx.is_empty()
                && completed.is_empty()
                && failed.is_empty()
                && !self.pending.is_empty()
            {
                // The pool went quiet without resolving these tasks;
                // report them instead of spinning on the grace poll.
                warn!(
                    "scheduler left {} pull(s) unresolved, aborting",
                    self.pending.len()
                );
                for ((lkey, rkey), _) in std::mem::take(&mut self.pending) {
                    self.failures.push(TaskFailure {
                        lkey,
                        rkey,
                        cause: ArchiveError::Backend(
                            "scheduler terminated without depositing".into(),
                        ),
                    });
                }
                self.aborting = true;
            }
        }
        if self.failures.is_empty() {
            Ok(())
        } else {
            Err(Error::TaskAbort {
                failures: std::mem::take(&mut self.failures),
            })
        }
    }

    /// Converts recorded pull failures: covered work re-enqueues the
    /// affected subtree for a rescan, anything else arms the abort path.
    fn drain_failures(&mut self, failed: &FailureMap) {
        for (meta, failure) in failed.drain() {
            let ranges: Vec<(Option<K>, Option<K>)> = self
                .pending
                .iter()
                .filter(|(_, pending_meta)| **pending_meta == meta)
                .map(|(range, _)| range.clone())
                .collect();
            match failure {
                PullFailure::Covered => {
                    debug!("pull of {:?} covered by concurrent work", meta);
                    for range in ranges {
                        self.pending.remove(&range);
                        let (lkey, rkey) = range;
                        match find_parent_of(self.root, lkey.as_ref(), rkey.as_ref()) {
                            Some((parent, idx)) if parent.children[idx].is_ghost() => {
                                // Benign race: the winner has not attached
                                // yet. Rescanning the parent resubmits the
                                // pull if the slot is still a ghost by then.
                                let pending = PendingNode {
                                    lkey: parent.lkey.clone(),
                                    rkey: parent.rkey.clone(),
                                };
                                self.queue.push(Reverse(pending));
                            }
                            Some(_) => {
                                // The winner already attached; expand the
                                // now-live child.
                                self.queue.push(Reverse(PendingNode { lkey, rkey }));
                            }
                            None => {
                                warn!("covered pull for a range no longer in the tree");
                            }
                        }
                    }
                }
                PullFailure::Abort(cause) => {
                    for range in &ranges {
                        self.pending.remove(range);
                    }
                    let (lkey, rkey) = ranges.into_iter().next().unwrap_or((None, None));
                    self.failures.push(TaskFailure { lkey, rkey, cause });
                    self.aborting = true;
                }
            }
        }
    }

    /// Verifies and attaches one completed pull, then queues the new live
    /// node for expansion.
    fn attach(
        &mut self,
        task: PullTask<K, NodeRepr<K, V>>,
        translator: &NodeTranslator,
    ) -> Result<(), Error<K>> {
        let range = (task.lkey, task.rkey);
        self.pending.remove(&range);
        let repr = task
            .data
            .ok_or_else(|| Error::DataFormat("completed pull carries no object".into()))?;
        if repr.lkey != range.0 || repr.rkey != range.1 {
            return Err(Error::DataFormat(format!(
                "pulled node covers [{:?}, {:?}) but the ghost covered [{:?}, {:?})",
                repr.lkey, repr.rkey, range.0, range.1
            )));
        }
        let node = translator.rev(repr)?;
        match find_parent_of(self.root, range.0.as_ref(), range.1.as_ref()) {
            Some((parent, idx)) => {
                if parent.children[idx].is_ghost() {
                    parent
                        .attach_skeleton(idx, node)
                        .map_err(|_| Error::DataFormat("attach rejected by range check".into()))?;
                    trace!("attached [{:?}, {:?})", range.0, range.1);
                    self.queue.push(Reverse(PendingNode {
                        lkey: range.0,
                        rkey: range.1,
                    }));
                } else {
                    // Duplicate of a covered task; the winner attached first.
                    debug!(
                        "discarding duplicate pull result for [{:?}, {:?})",
                        range.0, range.1
                    );
                }
            }
            None => warn!(
                "no parent found for pulled range [{:?}, {:?})",
                range.0, range.1
            ),
        }
        Ok(())
    }

    /// Inflates a node's local entries and fans out over its children:
    /// partially live subtrees are queued for expansion, ghosts become
    /// pull tasks (blocking on the bounded channel for backpressure).
    fn expand(
        &mut self,
        next: PendingNode<K>,
        task_tx: &Sender<PullTask<K, NodeRepr<K, V>>>,
        tracker: Option<&ProgressTracker>,
    ) {
        let node = match find_node(self.root, next.lkey.as_ref(), next.rkey.as_ref()) {
            Some(node) => node,
            None => {
                warn!(
                    "pending node [{:?}, {:?}) vanished before expansion",
                    next.lkey, next.rkey
                );
                return;
            }
        };
        node.entries.inflate();
        if node.is_leaf() {
            return;
        }
        let mut to_expand = Vec::new();
        let mut to_pull = Vec::new();
        for child in &node.children {
            match child {
                Child::Live(child) => {
                    if !child.is_fully_live() {
                        to_expand.push((child.lkey.clone(), child.rkey.clone()));
                    }
                }
                Child::Ghost(ghost) => {
                    to_pull.push((ghost.meta, ghost.lkey.clone(), ghost.rkey.clone()));
                }
            }
        }
        for (lkey, rkey) in to_expand {
            self.queue.push(Reverse(PendingNode { lkey, rkey }));
        }
        for (meta, lkey, rkey) in to_pull {
            let range = (lkey.clone(), rkey.clone());
            if self.pending.contains_key(&range) {
                continue;
            }
            if let Some(tracker) = tracker {
                tracker.register_pull();
            }
            trace!("submitting pull of {:?} for [{:?}, {:?})", meta, lkey, rkey);
            if task_tx.send(PullTask::new(meta, lkey, rkey)).is_err() {
                self.failures.push(TaskFailure {
                    lkey: range.0,
                    rkey: range.1,
                    cause: ArchiveError::Backend("scheduler terminated".into()),
                });
                self.aborting = true;
                return;
            }
            self.pending.insert(range, meta);
        }
    }
}

impl<K, V, A> SkeletonTree<K, V, A>
where
    K: Ord + Clone + Debug + Send + 'static,
    V: Send + 'static,
    A: ScheduledArchiver<Object = NodeRepr<K, V>>,
    NodeRepr<K, V>: ArchiveObject,
{
    /// Inflates the whole tree through the archiver's pull scheduler.
    ///
    /// Equivalent to [`SkeletonTree::inflate`] up to the order in which
    /// subtrees arrive; on failure every failed pull is reported and the
    /// tree is left consistent and partially inflated. The scheduler is
    /// released on every exit path.
    pub fn inflate_scheduled(&mut self) -> Result<(), Error<K>> {
        let archiver = self
            .archiver
            .as_ref()
            .ok_or(Error::IllegalState("no archiver attached"))?;
        trace!("inflate_scheduled: enter");
        let translator = NodeTranslator::new(self.config.node_min);
        let (task_tx, task_rx) = bounded(self.config.queue_depth);
        let completed = std::sync::Arc::new(CompletionQueue::new());
        let failed = std::sync::Arc::new(FailureMap::new());
        let mut pool =
            archiver.pull_schedule(task_rx, std::sync::Arc::clone(&completed), std::sync::Arc::clone(&failed));

        let mut driver = Driver::new(&mut self.root);
        let result = driver.run(
            &task_tx,
            &completed,
            &failed,
            &pool,
            translator,
            archiver.tracker(),
            self.config.poll_grace,
        );
        pool.close();
        trace!("inflate_scheduled: done");
        result
    }
}
