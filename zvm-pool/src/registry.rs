use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use thiserror::Error;

/// A named pool's admission policy, parsed from one entry of the `zerovm_threadpools` config
/// value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolPolicy {
    /// Plain FIFO admission: up to `size` jobs run concurrently, `queue` more wait their turn.
    Wait {
        /// Maximum number of jobs running at once.
        size: usize,
        /// Maximum number of jobs waiting for a slot.
        queue: usize,
    },
    /// Per-job-id fair queueing: each job id is guaranteed up to `queue` of its own waiting slots
    /// before jobs compete for whatever of the `size` running slots remain unclaimed.
    Priority {
        /// Maximum number of jobs running at once.
        size: usize,
        /// Maximum number of waiting slots reserved per job id.
        queue: usize,
    },
}

/// Failure raised by the registry or by an individual pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The configuration didn't name a `default` pool.
    #[error("thread pool configuration is missing a 'default' pool")]
    MissingDefaultPool,
    /// `spawn`/`can_admit` named a pool that isn't configured.
    #[error("unknown thread pool {0:?}")]
    UnknownPool(String),
}

struct PoolState {
    policy: PoolPolicy,
    running: usize,
    waiting_by_job: HashMap<String, usize>,
}

impl PoolState {
    fn would_admit(&self, job_id: &str) -> bool {
        match self.policy {
            PoolPolicy::Wait { size, queue } => self.running < size + queue,
            PoolPolicy::Priority { size, queue } => {
                let own_waiting = *self.waiting_by_job.get(job_id).unwrap_or(&0);
                own_waiting < queue || self.running < size
            }
        }
    }
}

struct Pool {
    state: Mutex<PoolState>,
    slot_freed: Condvar,
}

impl Pool {
    fn new(policy: PoolPolicy) -> Pool {
        Pool {
            state: Mutex::new(PoolState {
                policy,
                running: 0,
                waiting_by_job: HashMap::new(),
            }),
            slot_freed: Condvar::new(),
        }
    }

    fn can_admit(&self, job_id: &str) -> bool {
        self.state.lock().unwrap().would_admit(job_id)
    }

    /// Block the calling thread (a freshly spawned worker thread, never the request thread) until
    /// a slot is free, then claim it.
    fn acquire(&self, job_id: &str) {
        let mut state = self.state.lock().unwrap();
        *state.waiting_by_job.entry(job_id.to_string()).or_insert(0) += 1;
        while !state.would_admit(job_id) {
            state = self.slot_freed.wait(state).unwrap();
        }
        state.running += 1;
        if let Some(count) = state.waiting_by_job.get_mut(job_id) {
            *count -= 1;
            if *count == 0 {
                state.waiting_by_job.remove(job_id);
            }
        }
    }

    fn release(&self) {
        let mut state = self.state.lock().unwrap();
        state.running -= 1;
        self.slot_freed.notify_all();
    }
}

/// A set of named worker pools a job can be dispatched onto by name (the `X-Zerovm-Pool` header,
/// or `default` when absent).
pub struct ThreadPoolRegistry {
    pools: HashMap<String, Arc<Pool>>,
}

impl ThreadPoolRegistry {
    /// Build a registry from its parsed `zerovm_threadpools` policies. Fails if no `default` pool
    /// is present, matching the reference configuration's startup-time validation.
    pub fn new(policies: HashMap<String, PoolPolicy>) -> Result<ThreadPoolRegistry, PoolError> {
        if !policies.contains_key("default") {
            return Err(PoolError::MissingDefaultPool);
        }
        let pools = policies
            .into_iter()
            .map(|(name, policy)| (name, Arc::new(Pool::new(policy))))
            .collect();
        Ok(ThreadPoolRegistry { pools })
    }

    fn pool(&self, name: &str) -> Result<&Arc<Pool>, PoolError> {
        self.pools
            .get(name)
            .ok_or_else(|| PoolError::UnknownPool(name.to_string()))
    }

    /// Non-blocking: true iff `spawn` for this `(pool, job_id)` would not have to wait for a slot
    /// to free up. Racy by nature (another caller may claim the slot first), used to reject a
    /// request early (503) rather than let it queue.
    pub fn can_admit(&self, pool: &str, job_id: &str) -> Result<bool, PoolError> {
        Ok(self.pool(pool)?.can_admit(job_id))
    }

    /// Run `task` on the named pool under `job_id`'s admission accounting. Returns immediately
    /// with a `JoinHandle`; the spawned thread itself blocks (if needed) until a slot frees up, so
    /// the calling thread is never blocked on pool capacity.
    pub fn spawn<F>(&self, pool: &str, job_id: &str, task: F) -> Result<JoinHandle<()>, PoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        let pool = self.pool(pool)?.clone();
        let job_id = job_id.to_string();
        Ok(thread::Builder::new()
            .name(format!("zvm-pool-{job_id}"))
            .spawn(move || {
                pool.acquire(&job_id);
                scopeguard::defer!(pool.release());
                task();
            })
            .expect("failed to spawn pool worker thread"))
    }

    /// Run `task` immediately on its own thread, bypassing admission entirely. Reserved for the
    /// validator path, which must run even when the named pool is saturated.
    pub fn force_spawn<F>(&self, task: F) -> JoinHandle<()>
    where
        F: FnOnce() + Send + 'static,
    {
        thread::Builder::new()
            .name("zvm-pool-forced".to_string())
            .spawn(task)
            .expect("failed to spawn forced worker thread")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn registry(policy: PoolPolicy) -> ThreadPoolRegistry {
        let mut policies = HashMap::new();
        policies.insert("default".to_string(), policy);
        ThreadPoolRegistry::new(policies).unwrap()
    }

    #[test]
    fn rejects_configs_without_a_default_pool() {
        let err = ThreadPoolRegistry::new(HashMap::new()).unwrap_err();
        assert!(matches!(err, PoolError::MissingDefaultPool));
    }

    #[test]
    fn spawn_on_unknown_pool_is_an_error() {
        let registry = registry(PoolPolicy::Wait { size: 1, queue: 0 });
        let err = registry.spawn("nope", "job", || {}).unwrap_err();
        assert!(matches!(err, PoolError::UnknownPool(name) if name == "nope"));
    }

    #[test]
    fn wait_pool_bounds_concurrency_to_size_plus_queue() {
        let registry = registry(PoolPolicy::Wait { size: 1, queue: 0 });
        let concurrent = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let concurrent = concurrent.clone();
            let max_seen = max_seen.clone();
            handles.push(
                registry
                    .spawn("default", "job", move || {
                        let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(20));
                        concurrent.fetch_sub(1, Ordering::SeqCst);
                    })
                    .unwrap(),
            );
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn can_admit_reflects_current_saturation() {
        let registry = registry(PoolPolicy::Wait { size: 1, queue: 0 });
        assert!(registry.can_admit("default", "job").unwrap());
        let handle = registry
            .spawn("default", "job", || thread::sleep(Duration::from_millis(50)))
            .unwrap();
        thread::sleep(Duration::from_millis(10));
        assert!(!registry.can_admit("default", "job").unwrap());
        handle.join().unwrap();
        assert!(registry.can_admit("default", "job").unwrap());
    }

    #[test]
    fn force_spawn_ignores_saturation() {
        let registry = registry(PoolPolicy::Wait { size: 1, queue: 0 });
        let _busy = registry
            .spawn("default", "job", || thread::sleep(Duration::from_millis(50)))
            .unwrap();
        thread::sleep(Duration::from_millis(10));
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        registry.force_spawn(move || { ran2.store(1, Ordering::SeqCst); }).join().unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
