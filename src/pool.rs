//! Bounded worker pool with cooperative yielding.
//!
//! Compile tasks form a DAG: one compile may stall on the shared future of
//! another. A fixed pool would deadlock the moment every worker is stalled
//! on work that only the pool itself can run. The yield protocol prevents
//! that: a worker about to block marks itself frozen, and if the non-frozen
//! count falls below the configured pool size a replacement worker is
//! spawned before the wait begins. Replacement workers exit voluntarily
//! once they observe the non-frozen count above target. Under any acyclic
//! dependency graph the pool therefore always has at least the configured
//! number of unfrozen threads making progress.
//!
//! [`SharedFuture::wait`] routes through the yield protocol automatically
//! when called from a pool worker, and falls back to a plain blocking wait
//! anywhere else.

use crate::error::{AssetError, Result};
use std::{
    cell::RefCell,
    collections::VecDeque,
    sync::{Arc, Condvar, Mutex, Weak},
    time::{Duration, Instant},
};

type Task = Box<dyn FnOnce() + Send>;

struct PoolState {
    tasks: VecDeque<Task>,
    shutting_down: bool,
    non_frozen_workers: usize,
    total_workers: usize,
    active_tasks: usize,
}

struct PoolShared {
    state: Mutex<PoolState>,
    work_available: Condvar,
    idle: Condvar,
    target_workers: usize,
    join_handles: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

thread_local! {
    static CURRENT_POOL: RefCell<Option<Weak<PoolShared>>> = const { RefCell::new(None) };
}

/// FIFO pool of `workers` threads; see the module docs for the yield
/// protocol.
pub struct ThreadPool {
    shared: Arc<PoolShared>,
}

impl ThreadPool {
    pub fn new(workers: usize) -> Self {
        assert!(workers != 0);
        let shared = Arc::new(PoolShared {
            state: Mutex::new(PoolState {
                tasks: VecDeque::new(),
                shutting_down: false,
                non_frozen_workers: 0,
                total_workers: 0,
                active_tasks: 0,
            }),
            work_available: Condvar::new(),
            idle: Condvar::new(),
            target_workers: workers,
            join_handles: Mutex::new(Vec::new()),
        });
        for _ in 0..workers {
            PoolShared::spawn_worker(&shared);
        }
        Self { shared }
    }

    pub fn worker_count(&self) -> usize {
        self.shared.target_workers
    }

    pub fn enqueue(&self, task: impl FnOnce() + Send + 'static) {
        let mut state = self.shared.state.lock().unwrap();
        if state.shutting_down {
            return;
        }
        state.tasks.push_back(Box::new(task));
        drop(state);
        self.shared.work_available.notify_one();
    }

    /// Blocks until no task is queued or running, or `timeout` elapses.
    /// Returns whether the pool drained.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock().unwrap();
        loop {
            if state.tasks.is_empty() && state.active_tasks == 0 {
                return true;
            }
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return false;
            };
            let (next, result) = self.shared.idle.wait_timeout(state, remaining).unwrap();
            state = next;
            if result.timed_out() && !(state.tasks.is_empty() && state.active_tasks == 0) {
                return false;
            }
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.shutting_down = true;
        }
        self.shared.work_available.notify_all();
        let handles = std::mem::take(&mut *self.shared.join_handles.lock().unwrap());
        for handle in handles {
            let _ = handle.join();
        }
    }
}

impl PoolShared {
    fn spawn_worker(shared: &Arc<PoolShared>) {
        {
            let mut state = shared.state.lock().unwrap();
            state.total_workers += 1;
            state.non_frozen_workers += 1;
        }
        let worker_shared = shared.clone();
        let handle = std::thread::Builder::new()
            .name("asset-compile-worker".into())
            .spawn(move || worker_loop(worker_shared))
            .expect("failed to spawn pool worker");
        shared.join_handles.lock().unwrap().push(handle);
    }
}

fn worker_loop(shared: Arc<PoolShared>) {
    CURRENT_POOL.with(|slot| *slot.borrow_mut() = Some(Arc::downgrade(&shared)));

    loop {
        let task = {
            let mut state = shared.state.lock().unwrap();
            loop {
                if state.shutting_down {
                    state.total_workers -= 1;
                    state.non_frozen_workers -= 1;
                    CURRENT_POOL.with(|slot| *slot.borrow_mut() = None);
                    return;
                }
                // surplus replacement worker; the frozen worker it covered
                // for has woken up
                if state.non_frozen_workers > shared.target_workers {
                    state.total_workers -= 1;
                    state.non_frozen_workers -= 1;
                    CURRENT_POOL.with(|slot| *slot.borrow_mut() = None);
                    return;
                }
                if let Some(task) = state.tasks.pop_front() {
                    state.active_tasks += 1;
                    break task;
                }
                state = shared.work_available.wait(state).unwrap();
            }
        };

        task();

        let mut state = shared.state.lock().unwrap();
        state.active_tasks -= 1;
        if state.tasks.is_empty() && state.active_tasks == 0 {
            shared.idle.notify_all();
        }
    }
}

/// Runs `wait` (a blocking operation) from any thread. On a pool worker the
/// yield protocol keeps the pool making progress for the duration.
pub fn yield_to_pool<R>(wait: impl FnOnce() -> R) -> R {
    let pool = CURRENT_POOL.with(|slot| slot.borrow().clone()).and_then(|weak| weak.upgrade());
    let Some(pool) = pool else {
        // not on a pool worker; a plain blocking wait is safe
        return wait();
    };

    {
        let mut state = pool.state.lock().unwrap();
        state.non_frozen_workers -= 1;
        let needs_replacement =
            state.non_frozen_workers < pool.target_workers && !state.shutting_down;
        drop(state);
        if needs_replacement {
            trace!("spawning replacement worker for frozen pool thread");
            PoolShared::spawn_worker(&pool);
        }
    }

    let result = wait();

    let mut state = pool.state.lock().unwrap();
    state.non_frozen_workers += 1;
    drop(state);
    // wake a waiting worker so a surplus replacement notices and retires
    pool.work_available.notify_one();

    result
}

enum FutureState<T> {
    Pending,
    Resolved(Result<T, Arc<AssetError>>),
}

struct FutureShared<T> {
    state: Mutex<FutureState<T>>,
    ready: Condvar,
}

/// Write side of a [`SharedFuture`]. Dropping an unresolved promise
/// resolves the future with an error, so waiters never stall forever.
pub struct Promise<T> {
    shared: Arc<FutureShared<T>>,
    resolved: bool,
}

impl<T> Promise<T> {
    pub fn new() -> (Promise<T>, SharedFuture<T>) {
        let shared = Arc::new(FutureShared {
            state: Mutex::new(FutureState::Pending),
            ready: Condvar::new(),
        });
        (Promise { shared: shared.clone(), resolved: false }, SharedFuture { shared })
    }

    pub fn set_value(mut self, value: T) {
        self.resolve(Ok(value));
    }

    pub fn set_error(mut self, error: AssetError) {
        self.resolve(Err(Arc::new(error)));
    }

    fn resolve(&mut self, outcome: Result<T, Arc<AssetError>>) {
        {
            let mut state = self.shared.state.lock().unwrap();
            debug_assert!(matches!(*state, FutureState::Pending));
            *state = FutureState::Resolved(outcome);
        }
        self.resolved = true;
        self.shared.ready.notify_all();
    }
}

impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        if !self.resolved {
            self.resolve(Err(Arc::new(AssetError::msg(
                "compile task abandoned before producing a result",
            ))));
        }
    }
}

/// Clonable handle to a result every requestor of one fingerprint shares.
/// Errors are refcounted so each waiter observes the same failure.
pub struct SharedFuture<T> {
    shared: Arc<FutureShared<T>>,
}

impl<T> Clone for SharedFuture<T> {
    fn clone(&self) -> Self {
        Self { shared: self.shared.clone() }
    }
}

/// Non-owning observer of a [`SharedFuture`]. Lets a cache hand out the
/// in-flight future without keeping its result alive after the last real
/// referent drops.
pub struct WeakSharedFuture<T> {
    shared: Weak<FutureShared<T>>,
}

impl<T> WeakSharedFuture<T> {
    pub fn new() -> Self {
        Self { shared: Weak::new() }
    }

    pub fn upgrade(&self) -> Option<SharedFuture<T>> {
        self.shared.upgrade().map(|shared| SharedFuture { shared })
    }
}

impl<T> Default for WeakSharedFuture<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SharedFuture<T> {
    pub fn downgrade(&self) -> WeakSharedFuture<T> {
        WeakSharedFuture { shared: Arc::downgrade(&self.shared) }
    }
}

impl<T: Clone> SharedFuture<T> {
    pub fn is_ready(&self) -> bool {
        matches!(*self.shared.state.lock().unwrap(), FutureState::Resolved(_))
    }

    pub fn try_get(&self) -> Option<Result<T, Arc<AssetError>>> {
        match &*self.shared.state.lock().unwrap() {
            FutureState::Pending => None,
            FutureState::Resolved(outcome) => Some(outcome.clone()),
        }
    }

    /// Blocks until resolved. From a pool worker this yields to the pool
    /// rather than stalling it.
    pub fn wait(&self) -> Result<T, Arc<AssetError>> {
        if let Some(outcome) = self.try_get() {
            return outcome;
        }
        yield_to_pool(|| {
            let mut state = self.shared.state.lock().unwrap();
            loop {
                if let FutureState::Resolved(outcome) = &*state {
                    return outcome.clone();
                }
                state = self.shared.ready.wait(state).unwrap();
            }
        })
    }

    /// Bounded wait; `None` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<T, Arc<AssetError>>> {
        let deadline = Instant::now() + timeout;
        if let Some(outcome) = self.try_get() {
            return Some(outcome);
        }
        yield_to_pool(|| {
            let mut state = self.shared.state.lock().unwrap();
            loop {
                if let FutureState::Resolved(outcome) = &*state {
                    return Some(outcome.clone());
                }
                let remaining = deadline.checked_duration_since(Instant::now())?;
                let (next, _) = self.shared.ready.wait_timeout(state, remaining).unwrap();
                state = next;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn runs_enqueued_tasks() {
        let pool = ThreadPool::new(2);
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..16 {
            let count = count.clone();
            pool.enqueue(move || {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert!(pool.wait_idle(Duration::from_secs(5)));
        assert_eq!(count.load(Ordering::SeqCst), 16);
    }

    #[test]
    fn single_worker_survives_dependent_tasks() {
        // task A waits on task B's future; with one worker this deadlocks
        // unless the yield protocol spawns a replacement
        let pool = ThreadPool::new(1);
        let (promise, future) = Promise::<u32>::new();
        let (done_promise, done_future) = Promise::<u32>::new();

        pool.enqueue(move || {
            let value = future.wait().unwrap();
            done_promise.set_value(value + 1);
        });
        pool.enqueue(move || {
            promise.set_value(41);
        });

        let outcome = done_future.wait_timeout(Duration::from_secs(5));
        assert_eq!(outcome.unwrap().unwrap(), 42);
    }

    #[test]
    fn dropped_promise_resolves_with_error() {
        let (promise, future) = Promise::<u32>::new();
        drop(promise);
        assert!(future.wait().is_err());
    }

    #[test]
    fn futures_share_one_result() {
        let (promise, future) = Promise::<String>::new();
        let clones: Vec<_> = (0..8).map(|_| future.clone()).collect();
        promise.set_value("shared".to_string());
        for clone in clones {
            assert_eq!(clone.wait().unwrap(), "shared");
        }
    }

    #[test]
    fn wait_timeout_expires() {
        let (_promise, future) = Promise::<u32>::new();
        assert!(future.wait_timeout(Duration::from_millis(20)).is_none());
    }
}
