//! This module provides the archive layer which persists and retrieves
//! serialized tree objects under opaque meta handles.
//!
//! Three capability levels build on each other: [`Archiver`] moves single
//! objects, [`BatchArchiver`] adds batched variants with per-task failure
//! attribution, and [`ScheduledArchiver`] hands out a [`Scheduler`] that
//! drains a task queue with a pool of workers and deposits results into a
//! shared completion queue. The bulk tree inflater is built against the
//! scheduled level; the targeted protocols only need the base level.

use std::{
    cmp::{Ordering, Reverse},
    collections::{BinaryHeap, HashMap},
    sync::{
        atomic::{AtomicUsize, Ordering as AtomicOrdering},
        Arc,
    },
    time::Duration,
};

use crossbeam_channel::Receiver;
use parking_lot::{Condvar, Mutex};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::bounds;

pub(crate) mod errors;
mod mem;

pub use self::{
    errors::ArchiveError,
    mem::{MemArchiver, MemScheduler},
};

/// Marker trait for object payloads the archive layer can serialize and
/// hand across worker threads.
pub trait ArchiveObject: Serialize + DeserializeOwned + Send + 'static {}
impl<T: Serialize + DeserializeOwned + Send + 'static> ArchiveObject for T {}

/// Opaque handle identifying an archived object.
///
/// The bundled archiver derives the handle from the serialized bytes, an
/// XxHash64 digest plus the encoded length, so equal objects share a
/// handle. Other archivers are free to invent handles however they like;
/// the tree only stores and compares them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectMeta {
    digest: u64,
    len: u32,
}

impl ObjectMeta {
    pub fn new(digest: u64, len: u32) -> Self {
        ObjectMeta { digest, len }
    }

    pub fn digest(&self) -> u64 {
        self.digest
    }

    pub fn len(&self) -> u32 {
        self.len
    }
}

/// A pending fetch of one archived object.
///
/// `lkey`/`rkey` carry the key range of the ghost the fetched object will
/// replace; the completion queue orders finished tasks by that range so
/// the driver attaches results in tree order.
#[derive(Debug)]
pub struct PullTask<K, T> {
    /// Handle of the object to fetch.
    pub meta: ObjectMeta,
    /// Lower bound of the ghost this task will replace.
    pub lkey: Option<K>,
    /// Upper bound of the ghost this task will replace.
    pub rkey: Option<K>,
    /// Filled in by the archive on completion.
    pub data: Option<T>,
    /// Per-task failure attached by batched pulls.
    pub failure: Option<ArchiveError>,
}

impl<K, T> PullTask<K, T> {
    pub fn new(meta: ObjectMeta, lkey: Option<K>, rkey: Option<K>) -> Self {
        PullTask {
            meta,
            lkey,
            rkey,
            data: None,
            failure: None,
        }
    }
}

impl<K: Ord, T> PartialEq for PullTask<K, T> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<K: Ord, T> Eq for PullTask<K, T> {}

impl<K: Ord, T> PartialOrd for PullTask<K, T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<K: Ord, T> Ord for PullTask<K, T> {
    fn cmp(&self, other: &Self) -> Ordering {
        bounds::cmp_lower(self.lkey.as_ref(), other.lkey.as_ref())
            .then_with(|| bounds::cmp_upper(self.rkey.as_ref(), other.rkey.as_ref()))
            .then_with(|| self.meta.cmp(&other.meta))
    }
}

/// A pending write of one object into the archive.
#[derive(Debug)]
pub struct PushTask<K, T> {
    /// Handle to store under. A push may use the supplied handle or invent
    /// one, writing it back here.
    pub meta: Option<ObjectMeta>,
    /// Lower bound of the subtree being pushed, for failure context.
    pub lkey: Option<K>,
    /// Upper bound of the subtree being pushed.
    pub rkey: Option<K>,
    /// The object to persist.
    pub data: T,
    /// Per-task failure attached by batched pushes.
    pub failure: Option<ArchiveError>,
}

impl<K, T> PushTask<K, T> {
    pub fn new(data: T, lkey: Option<K>, rkey: Option<K>) -> Self {
        PushTask {
            meta: None,
            lkey,
            rkey,
            data,
            failure: None,
        }
    }
}

/// External component that persists and retrieves serialized objects under
/// opaque meta handles.
pub trait Archiver {
    /// The object type moved through this archiver.
    type Object;

    /// Fetches the object identified by `task.meta` into `task.data`.
    fn pull<K>(&self, task: &mut PullTask<K, Self::Object>) -> Result<(), ArchiveError>;

    /// Persists `task.data`, writing the resulting handle into `task.meta`.
    fn push<K>(&self, task: &mut PushTask<K, Self::Object>) -> Result<(), ArchiveError>;
}

/// Batched pulls and pushes with at-least-once semantics per task.
///
/// A failing task carries its own failure; the batch call itself only
/// fails when the whole batch is unusable.
pub trait BatchArchiver: Archiver {
    /// Pulls every task, attaching per-task failures to the tasks.
    fn pull_batch<K>(&self, tasks: &mut [PullTask<K, Self::Object>]) -> Result<(), ArchiveError> {
        for task in tasks.iter_mut() {
            if let Err(e) = self.pull(task) {
                task.failure = Some(e);
            }
        }
        Ok(())
    }

    /// Pushes every task, attaching per-task failures to the tasks.
    fn push_batch<K>(&self, tasks: &mut [PushTask<K, Self::Object>]) -> Result<(), ArchiveError> {
        for task in tasks.iter_mut() {
            if let Err(e) = self.push(task) {
                task.failure = Some(e);
            }
        }
        Ok(())
    }
}

/// A pull scheduler handed out by a [ScheduledArchiver].
pub trait Scheduler {
    /// True iff the scheduler may still deposit completed or failed work.
    fn is_active(&self) -> bool;

    /// Releases the scheduler's resources. Idempotent.
    fn close(&mut self);
}

/// An archiver that can execute pulls asynchronously through a worker pool.
pub trait ScheduledArchiver: Archiver {
    /// The scheduler type handed out by [ScheduledArchiver::pull_schedule].
    type Pool: Scheduler;

    /// Spawns a pool that drains `tasks` and deposits every finished task
    /// into exactly one of `completed` or `failed`. Work already covered by
    /// a concurrent task is deposited as [PullFailure::Covered].
    fn pull_schedule<K>(
        &self,
        tasks: Receiver<PullTask<K, Self::Object>>,
        completed: Arc<CompletionQueue<K, Self::Object>>,
        failed: Arc<FailureMap>,
    ) -> Self::Pool
    where
        K: Ord + Send + 'static,
        Self::Object: ArchiveObject;

    /// Progress reporting hook; archivers without one return `None`.
    fn tracker(&self) -> Option<&ProgressTracker> {
        None
    }
}

/// Outcome deposited on the failure channel for a pull that produced no
/// object.
///
/// `Covered` is not an error: it notifies the driver that a concurrent
/// task did (or is doing) the same work, and the driver re-inspects the
/// tree instead of aborting.
#[derive(Debug)]
pub enum PullFailure {
    /// The work was covered by a concurrent task.
    Covered,
    /// Terminal failure of this pull.
    Abort(ArchiveError),
}

/// Completed pull tasks, handed from scheduler workers to the driver.
///
/// Tasks are popped in the natural order of the node ranges they carry,
/// which turns out-of-order fetch completions back into an in-order
/// attach sequence.
pub struct CompletionQueue<K, T> {
    heap: Mutex<BinaryHeap<Reverse<PullTask<K, T>>>>,
    nonempty: Condvar,
}

impl<K: Ord, T> Default for CompletionQueue<K, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Ord, T> CompletionQueue<K, T> {
    pub fn new() -> Self {
        CompletionQueue {
            heap: Mutex::new(BinaryHeap::new()),
            nonempty: Condvar::new(),
        }
    }

    /// Deposits a finished task and wakes a waiting driver.
    pub fn push(&self, task: PullTask<K, T>) {
        self.heap.lock().push(Reverse(task));
        self.nonempty.notify_one();
    }

    /// Pops the first finished task, if any, without blocking.
    pub fn try_pop(&self) -> Option<PullTask<K, T>> {
        self.heap.lock().pop().map(|Reverse(task)| task)
    }

    /// Waits up to `grace` for a finished task. The timeout lets the
    /// driver periodically re-inspect the pool and the failure map.
    pub fn poll(&self, grace: Duration) -> Option<PullTask<K, T>> {
        let mut heap = self.heap.lock();
        if heap.is_empty() {
            self.nonempty.wait_for(&mut heap, grace);
        }
        heap.pop().map(|Reverse(task)| task)
    }

    pub fn is_empty(&self) -> bool {
        self.heap.lock().is_empty()
    }
}

/// Failed pull tasks, keyed by their meta handle.
#[derive(Debug, Default)]
pub struct FailureMap {
    map: Mutex<HashMap<ObjectMeta, PullFailure>>,
}

impl FailureMap {
    pub fn new() -> Self {
        FailureMap::default()
    }

    pub fn insert(&self, meta: ObjectMeta, failure: PullFailure) {
        self.map.lock().insert(meta, failure);
    }

    /// Removes and returns all recorded failures.
    pub fn drain(&self) -> Vec<(ObjectMeta, PullFailure)> {
        self.map.lock().drain().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.map.lock().is_empty()
    }
}

/// Pull progress counters exposed by trackable archivers so external
/// observers can report on a bulk inflate.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    registered: AtomicUsize,
    completed: AtomicUsize,
    failed: AtomicUsize,
}

/// A point-in-time snapshot of a [ProgressTracker].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub registered: usize,
    pub completed: usize,
    pub failed: usize,
}

impl Progress {
    /// Number of registered pulls that have not yet resolved.
    pub fn outstanding(&self) -> usize {
        self.registered.saturating_sub(self.completed + self.failed)
    }
}

impl ProgressTracker {
    pub fn new() -> Self {
        ProgressTracker::default()
    }

    /// Called by the driver for every submitted pull.
    pub fn register_pull(&self) {
        self.registered.fetch_add(1, AtomicOrdering::Relaxed);
    }

    /// Called by the archiver when a pull resolves with an object, or when
    /// its work was covered by a concurrent pull.
    pub fn complete_pull(&self) {
        self.completed.fetch_add(1, AtomicOrdering::Relaxed);
    }

    /// Called by the archiver when a pull fails terminally.
    pub fn fail_pull(&self) {
        self.failed.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub fn snapshot(&self) -> Progress {
        Progress {
            registered: self.registered.load(AtomicOrdering::Relaxed),
            completed: self.completed.load(AtomicOrdering::Relaxed),
            failed: self.failed.load(AtomicOrdering::Relaxed),
        }
    }
}
