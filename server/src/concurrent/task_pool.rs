// party_sync/server/src/concurrent/task_pool.rs
//
// The only place that decides which thread runs backend I/O or notification
// handling. Business logic hands work over here instead of spawning threads.
use crate::core::config::TaskPoolConfig;
use crate::core::error::{PartyError, PartyResult};
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub struct TaskPoolSystem {
    /// Backend reads/writes/publishes and remote scans.
    pub io_pool: Arc<ThreadPool>,
    /// Decoding and applying received notifications.
    pub message_pool: Arc<ThreadPool>,
}

impl TaskPoolSystem {
    pub fn new(config: &TaskPoolConfig) -> PartyResult<Self> {
        let io_pool = Self::create_pool("party-io", config.io_threads)?;
        let message_pool = Self::create_pool("party-msg", config.message_threads)?;

        Ok(Self {
            io_pool: Arc::new(io_pool),
            message_pool: Arc::new(message_pool),
        })
    }

    fn create_pool(name_str: &str, num_threads: usize) -> PartyResult<ThreadPool> {
        let threads = if num_threads == 0 {
            warn!("Task pool '{}' configured with 0 threads. Creating a minimal pool.", name_str);
            1
        } else {
            num_threads
        };

        let name_for_thread_name = name_str.to_string();
        ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(move |i| format!("{}-{}", name_for_thread_name, i))
            .build()
            .map_err(|e| PartyError::ThreadingError(format!("Failed to build {} pool: {}", name_str, e)))
    }

    /// Runs a fallible backend job off the caller's thread. Failures are
    /// logged under `label`; nothing is propagated.
    pub fn submit_io<F>(&self, label: &'static str, job: F)
    where
        F: FnOnce() -> PartyResult<()> + Send + 'static,
    {
        self.io_pool.spawn(move || {
            if let Err(e) = job() {
                warn!("Background task '{}' failed: {}", label, e);
            }
        });
    }

    /// Same as `submit_io`, after `delay`. The delay occupies an I/O worker,
    /// so keep it short.
    pub fn submit_io_later<F>(&self, label: &'static str, delay: Duration, job: F)
    where
        F: FnOnce() -> PartyResult<()> + Send + 'static,
    {
        self.io_pool.spawn(move || {
            std::thread::sleep(delay);
            debug!("Running delayed task '{}' after {:?}", label, delay);
            if let Err(e) = job() {
                warn!("Delayed task '{}' failed: {}", label, e);
            }
        });
    }

    pub fn submit_message<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.message_pool.spawn(job);
    }
}
