//! An in-memory, content-addressed archiver with a thread-pool scheduler.
//!
//! This is the reference implementation of all three archiver capability
//! levels. Objects are bincode-encoded and stored under their XxHash64
//! digest, so pushing the same object twice is idempotent and yields the
//! same handle. The scheduler runs plain worker threads that drain the
//! task channel; duplicate pulls that overlap in time are collapsed into
//! one fetch, with the losers reported as covered work.

use std::{
    collections::{HashMap, HashSet},
    hash::Hasher,
    marker::PhantomData,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use log::warn;
use parking_lot::Mutex;
use twox_hash::XxHash64;

use super::{
    errors::ArchiveError, ArchiveObject, Archiver, BatchArchiver, CompletionQueue, FailureMap,
    ObjectMeta, ProgressTracker, PullFailure, PullTask, PushTask, ScheduledArchiver, Scheduler,
};

const DIGEST_SEED: u64 = 0;
const WORKER_RECV_GRACE: Duration = Duration::from_millis(50);

struct Inner {
    store: Mutex<HashMap<ObjectMeta, Arc<[u8]>>>,
    /// Metas currently being fetched by some worker; used to convert
    /// overlapping duplicate pulls into covered-work notifications.
    in_flight: Mutex<HashSet<ObjectMeta>>,
    /// Metas whose fetch is rigged to fail, for fault-injection tests.
    rigged: Mutex<HashSet<ObjectMeta>>,
    /// Simulated per-fetch latency of the backing store.
    latency: Mutex<Option<Duration>>,
    fetches: AtomicUsize,
    stores: AtomicUsize,
    tracker: ProgressTracker,
    workers: usize,
}

/// In-memory content-addressed archiver.
pub struct MemArchiver<T> {
    inner: Arc<Inner>,
    _object: PhantomData<fn() -> T>,
}

impl<T> Clone for MemArchiver<T> {
    fn clone(&self) -> Self {
        MemArchiver {
            inner: Arc::clone(&self.inner),
            _object: PhantomData,
        }
    }
}

impl<T> Default for MemArchiver<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> MemArchiver<T> {
    pub fn new() -> Self {
        Self::with_workers(4)
    }

    /// Returns an archiver whose schedulers run `workers` fetch threads.
    pub fn with_workers(workers: usize) -> Self {
        assert!(workers > 0);
        MemArchiver {
            inner: Arc::new(Inner {
                store: Mutex::new(HashMap::new()),
                in_flight: Mutex::new(HashSet::new()),
                rigged: Mutex::new(HashSet::new()),
                latency: Mutex::new(None),
                fetches: AtomicUsize::new(0),
                stores: AtomicUsize::new(0),
                tracker: ProgressTracker::new(),
                workers,
            }),
            _object: PhantomData,
        }
    }

    /// Number of archived objects.
    pub fn object_count(&self) -> usize {
        self.inner.store.lock().len()
    }

    pub fn contains(&self, meta: &ObjectMeta) -> bool {
        self.inner.store.lock().contains_key(meta)
    }

    /// Handles of all archived objects, in no particular order.
    pub fn metas(&self) -> Vec<ObjectMeta> {
        self.inner.store.lock().keys().copied().collect()
    }

    /// Number of fetches executed against the store, counting both
    /// targeted and scheduled pulls.
    pub fn fetch_count(&self) -> usize {
        self.inner.fetches.load(Ordering::Relaxed)
    }

    /// Number of pushes executed against the store.
    pub fn push_count(&self) -> usize {
        self.inner.stores.load(Ordering::Relaxed)
    }

    /// Makes every fetch of `meta` fail until [`Self::repair_object`].
    pub fn rig_object(&self, meta: ObjectMeta) {
        self.inner.rigged.lock().insert(meta);
    }

    pub fn repair_object(&self, meta: &ObjectMeta) {
        self.inner.rigged.lock().remove(meta);
    }

    /// Adds an artificial delay to every fetch, approximating a
    /// high-latency backing store.
    pub fn simulate_latency(&self, latency: Option<Duration>) {
        *self.inner.latency.lock() = latency;
    }
}

impl<T: ArchiveObject> MemArchiver<T> {
    fn fetch(&self, meta: &ObjectMeta) -> Result<T, ArchiveError> {
        let latency = *self.inner.latency.lock();
        if let Some(latency) = latency {
            thread::sleep(latency);
        }
        self.inner.fetches.fetch_add(1, Ordering::Relaxed);
        if self.inner.rigged.lock().contains(meta) {
            return Err(ArchiveError::Backend(format!(
                "injected fault for {:?}",
                meta
            )));
        }
        let bytes = self
            .inner
            .store
            .lock()
            .get(meta)
            .cloned()
            .ok_or(ArchiveError::UnknownObject(*meta))?;
        if digest_meta(&bytes) != *meta {
            return Err(ArchiveError::DigestMismatch(*meta));
        }
        Ok(bincode::deserialize(&bytes)?)
    }

    fn store(&self, data: &T) -> Result<ObjectMeta, ArchiveError> {
        let bytes = bincode::serialize(data)?;
        self.inner.stores.fetch_add(1, Ordering::Relaxed);
        let meta = digest_meta(&bytes);
        self.inner.store.lock().insert(meta, bytes.into());
        Ok(meta)
    }
}

fn digest_meta(bytes: &[u8]) -> ObjectMeta {
    let mut hasher = XxHash64::with_seed(DIGEST_SEED);
    hasher.write(bytes);
    ObjectMeta::new(hasher.finish(), bytes.len() as u32)
}

impl<T: ArchiveObject> Archiver for MemArchiver<T> {
    type Object = T;

    fn pull<K>(&self, task: &mut PullTask<K, T>) -> Result<(), ArchiveError> {
        task.data = Some(self.fetch(&task.meta)?);
        Ok(())
    }

    fn push<K>(&self, task: &mut PushTask<K, T>) -> Result<(), ArchiveError> {
        // Content addressing makes the handle a function of the data, so a
        // supplied meta is replaced rather than reused when it disagrees.
        let meta = self.store(&task.data)?;
        task.meta = Some(meta);
        Ok(())
    }
}

impl<T: ArchiveObject> BatchArchiver for MemArchiver<T> {}

impl<T: ArchiveObject> ScheduledArchiver for MemArchiver<T> {
    type Pool = MemScheduler;

    fn pull_schedule<K>(
        &self,
        tasks: Receiver<PullTask<K, T>>,
        completed: Arc<CompletionQueue<K, T>>,
        failed: Arc<FailureMap>,
    ) -> MemScheduler
    where
        K: Ord + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let busy = Arc::new(AtomicUsize::new(0));
        let handles = (0..self.inner.workers)
            .map(|_| {
                let this = self.clone();
                let tasks = tasks.clone();
                let completed = Arc::clone(&completed);
                let failed = Arc::clone(&failed);
                let stop = Arc::clone(&stop);
                let busy = Arc::clone(&busy);
                thread::spawn(move || {
                    worker_loop(this, tasks, completed, failed, stop, busy);
                })
            })
            .collect();
        MemScheduler {
            stop,
            busy,
            handles: Some(handles),
        }
    }

    fn tracker(&self) -> Option<&ProgressTracker> {
        Some(&self.inner.tracker)
    }
}

fn worker_loop<K, T>(
    archiver: MemArchiver<T>,
    tasks: Receiver<PullTask<K, T>>,
    completed: Arc<CompletionQueue<K, T>>,
    failed: Arc<FailureMap>,
    stop: Arc<AtomicBool>,
    busy: Arc<AtomicUsize>,
) where
    K: Ord + Send + 'static,
    T: ArchiveObject,
{
    while !stop.load(Ordering::Acquire) {
        let mut task = match tasks.recv_timeout(WORKER_RECV_GRACE) {
            Ok(task) => task,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        busy.fetch_add(1, Ordering::AcqRel);
        let meta = task.meta;

        let duplicate = !archiver.inner.in_flight.lock().insert(meta);
        if duplicate {
            // A concurrent worker is fetching the same object; the work is
            // covered, the driver re-inspects the tree on notification.
            archiver.inner.tracker.complete_pull();
            failed.insert(meta, PullFailure::Covered);
            busy.fetch_sub(1, Ordering::AcqRel);
            continue;
        }

        match archiver.fetch(&meta) {
            Ok(object) => {
                task.data = Some(object);
                archiver.inner.tracker.complete_pull();
                completed.push(task);
            }
            Err(e) => {
                archiver.inner.tracker.fail_pull();
                failed.insert(meta, PullFailure::Abort(e));
            }
        }
        // Removed only after the deposit so overlapping duplicates keep
        // resolving to covered work rather than racing a second fetch.
        archiver.inner.in_flight.lock().remove(&meta);
        busy.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Worker pool handed out by [`MemArchiver::pull_schedule`].
pub struct MemScheduler {
    stop: Arc<AtomicBool>,
    busy: Arc<AtomicUsize>,
    handles: Option<Vec<thread::JoinHandle<()>>>,
}

impl Scheduler for MemScheduler {
    fn is_active(&self) -> bool {
        self.busy.load(Ordering::Acquire) > 0
    }

    fn close(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handles) = self.handles.take() {
            for handle in handles {
                if handle.join().is_err() {
                    warn!("archive worker panicked during close");
                }
            }
        }
    }
}

impl Drop for MemScheduler {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;

    #[test]
    fn push_is_idempotent_and_content_addressed() {
        let archiver: MemArchiver<Vec<u32>> = MemArchiver::new();
        let mut a = PushTask::<u32, _>::new(vec![1, 2, 3], None, None);
        let mut b = PushTask::<u32, _>::new(vec![1, 2, 3], None, None);
        archiver.push(&mut a).unwrap();
        archiver.push(&mut b).unwrap();
        assert_eq!(a.meta, b.meta);
        assert_eq!(archiver.object_count(), 1);
    }

    #[test]
    fn pull_roundtrip() {
        let archiver: MemArchiver<Vec<u32>> = MemArchiver::new();
        let mut push = PushTask::<u32, _>::new(vec![9, 8], None, None);
        archiver.push(&mut push).unwrap();

        let mut pull = PullTask::<u32, _>::new(push.meta.unwrap(), None, None);
        archiver.pull(&mut pull).unwrap();
        assert_eq!(pull.data.unwrap(), vec![9, 8]);
    }

    #[test]
    fn pull_of_unknown_object_fails() {
        let archiver: MemArchiver<Vec<u32>> = MemArchiver::new();
        let mut pull = PullTask::<u32, _>::new(ObjectMeta::new(42, 4), None, None);
        assert!(matches!(
            archiver.pull(&mut pull),
            Err(ArchiveError::UnknownObject(_))
        ));
    }

    #[test]
    fn scheduler_drains_tasks_and_goes_idle() {
        let archiver: MemArchiver<Vec<u32>> = MemArchiver::with_workers(2);
        let mut push = PushTask::<u32, _>::new(vec![7], None, None);
        archiver.push(&mut push).unwrap();
        let meta = push.meta.unwrap();

        let (tx, rx) = bounded(16);
        let completed = Arc::new(CompletionQueue::new());
        let failed = Arc::new(FailureMap::new());
        let mut pool = archiver.pull_schedule(rx, completed.clone(), failed.clone());

        tx.send(PullTask::new(meta, Some(1u32), Some(2u32))).unwrap();
        let task = completed
            .poll(Duration::from_secs(5))
            .expect("task should complete");
        assert_eq!(task.data.unwrap(), vec![7]);
        assert!(failed.is_empty());
        pool.close();
        assert!(!pool.is_active());
        pool.close(); // idempotent
    }

    #[test]
    fn overlapping_duplicate_pulls_collapse_to_covered() {
        let archiver: MemArchiver<Vec<u32>> = MemArchiver::with_workers(2);
        archiver.simulate_latency(Some(Duration::from_millis(200)));
        let mut push = PushTask::<u32, _>::new(vec![5; 8], None, None);
        archiver.push(&mut push).unwrap();
        let meta = push.meta.unwrap();

        let (tx, rx) = bounded(16);
        let completed = Arc::new(CompletionQueue::new());
        let failed = Arc::new(FailureMap::new());
        let mut pool = archiver.pull_schedule(rx, completed.clone(), failed.clone());

        tx.send(PullTask::new(meta, Some(1u32), Some(2u32))).unwrap();
        tx.send(PullTask::new(meta, Some(1u32), Some(2u32))).unwrap();

        let winner = completed.poll(Duration::from_secs(5)).expect("one winner");
        assert_eq!(winner.meta, meta);
        // One real fetch, the duplicate was covered.
        assert_eq!(archiver.fetch_count(), 1);
        let failures = failed.drain();
        assert_eq!(failures.len(), 1);
        assert!(matches!(failures[0].1, PullFailure::Covered));
        pool.close();
    }
}
