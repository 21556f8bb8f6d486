use crate::processor::{Handle, TaskProcessor};
use anyhow::{Result, anyhow};
use std::convert::TryFrom;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

/// Global queue interval default value.
const GLOBAL_QUEUE_INTERVAL: u32 = 31;

/// Maximum number of stealing attempts.
const MAX_STEAL_RETRIES: usize = 3;

/// One timer thread is plenty for deadline wakeups.
const TIMER_THREADS: usize = 1;

#[derive(Clone)]
pub(crate) struct ThreadNameFn(pub(crate) Arc<dyn Fn() -> String + Send + Sync + 'static>);

fn default_thread_name_fn() -> ThreadNameFn {
    let worker_count = Arc::new(AtomicUsize::new(0));

    ThreadNameFn(Arc::new(move || {
        let id = worker_count.fetch_add(1, Ordering::Relaxed);
        format!("coro-worker-{id}")
    }))
}

impl fmt::Debug for ThreadNameFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ThreadNameFn").field(&"<function>").finish()
    }
}

/// What the processor does with not-yet-started normal tasks while it is
/// overloaded.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverloadAction {
    /// Cancel them with [`CancellationReason::Overload`], they never run.
    ///
    /// [`CancellationReason::Overload`]: crate::task::CancellationReason::Overload
    #[default]
    Cancel,

    /// Only count and log the overload.
    Ignore,
}

#[derive(Debug)]
pub struct Builder {
    /// The number of worker threads. Defaults to 1 per core.
    worker_threads: Option<usize>,

    /// Name fn used for worker threads.
    thread_name: ThreadNameFn,

    /// Stack size used for worker threads.
    thread_stack_size: Option<usize>,

    /// How many ticks before pulling a task from the global injector queue.
    global_queue_interval: u32,

    /// How many times an idle worker loops over the global injector queue and
    /// the other workers' queues before parking.
    max_steal_retries: usize,

    /// Queue length above which new normal tasks are shed.
    max_queue_length: Option<usize>,

    /// Queue latency above which the processor considers itself overloaded.
    max_queue_wait_time: Option<Duration>,

    overload_action: OverloadAction,

    /// Number of reactor threads serving timers.
    timer_threads: usize,
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    pub fn new() -> Self {
        Self {
            worker_threads: None,
            thread_name: default_thread_name_fn(),
            thread_stack_size: None,
            global_queue_interval: GLOBAL_QUEUE_INTERVAL,
            max_steal_retries: MAX_STEAL_RETRIES,
            max_queue_length: None,
            max_queue_wait_time: None,
            overload_action: OverloadAction::default(),
            timer_threads: TIMER_THREADS,
        }
    }

    /// The number of worker threads.
    ///
    /// Defaults to 1 worker per CPU core.
    #[track_caller]
    pub fn worker_threads(mut self, val: usize) -> Self {
        assert!(val > 0, "worker_threads must be greater than 0");
        self.worker_threads = Some(val);
        self
    }

    /// Sets the name of every worker thread.
    ///
    /// The default name is "coro-worker-{N}", where N is monotonically
    /// increasing. Names are truncated beyond 15 bytes according to pthread
    /// limitations.
    pub fn thread_name(mut self, val: impl Into<String>) -> Self {
        let val = val.into();
        self.thread_name = ThreadNameFn(Arc::new(move || val.clone()));
        self
    }

    /// Sets a function used to generate the name of worker threads.
    pub fn thread_name_fn<F>(mut self, f: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        self.thread_name = ThreadNameFn(Arc::new(f));
        self
    }

    /// Sets the stack size (in bytes) for worker threads.
    ///
    /// The actual stack size may be greater than this value if the platform
    /// specifies minimal stack size.
    #[track_caller]
    pub fn thread_stack_size(mut self, val: usize) -> Self {
        assert!(
            val.is_power_of_two(),
            "thread_stack_size must be a power of two"
        );
        self.thread_stack_size = Some(val);
        self
    }

    /// Sets the number of scheduler ticks after which a worker polls the
    /// global task queue before its local one.
    ///
    /// A tick roughly corresponds to one task step. Smaller values favor
    /// getting started on new work, larger values favor tasks that were
    /// woken on this worker and likely have hot caches.
    #[track_caller]
    pub fn global_queue_interval(mut self, val: u32) -> Self {
        assert!(val > 0, "global_queue_interval must be greater than 0");
        self.global_queue_interval = val;
        self
    }

    #[track_caller]
    pub fn max_steal_retries(mut self, val: usize) -> Self {
        assert!(val > 0, "max_steal_retries must be greater than 0");
        self.max_steal_retries = val;
        self
    }

    /// Queue length above which not-yet-started normal tasks are shed.
    #[track_caller]
    pub fn max_queue_length(mut self, val: usize) -> Self {
        assert!(val > 0, "max_queue_length must be greater than 0");
        self.max_queue_length = Some(val);
        self
    }

    /// A task that waited longer than this in the queue puts the processor
    /// in overload until a task is dequeued in time again.
    #[track_caller]
    pub fn max_queue_wait_time(mut self, val: Duration) -> Self {
        assert!(!val.is_zero(), "max_queue_wait_time must be greater than 0");
        self.max_queue_wait_time = Some(val);
        self
    }

    pub fn overload_action(mut self, action: OverloadAction) -> Self {
        self.overload_action = action;
        self
    }

    #[track_caller]
    pub fn timer_threads(mut self, val: usize) -> Self {
        assert!(val > 0, "timer_threads must be greater than 0");
        self.timer_threads = val;
        self
    }

    /// Creates the configured `TaskProcessor` and starts its threads.
    pub fn try_build(self) -> Result<TaskProcessor> {
        let cfg = ProcessorConfig::try_from(self)?;
        let handle = Handle::new(cfg)?;
        TaskProcessor::start(handle)
    }
}

/// Validated builder settings, shared by the workers.
#[derive(Debug, Clone)]
pub(crate) struct ProcessorConfig {
    pub(crate) worker_threads: usize,
    pub(crate) thread_name: ThreadNameFn,
    pub(crate) thread_stack_size: Option<usize>,
    pub(crate) global_queue_interval: u32,
    pub(crate) max_steal_retries: usize,
    pub(crate) max_queue_length: Option<usize>,
    pub(crate) max_queue_wait_time: Option<Duration>,
    pub(crate) overload_action: OverloadAction,
    pub(crate) timer_threads: usize,
}

impl ProcessorConfig {
    fn validate(&self) -> Result<()> {
        if self.worker_threads == 0 {
            return Err(anyhow!("a task processor needs at least one worker thread"));
        }

        // Tagged container indices are 32 bits wide.
        if self.worker_threads >= u32::MAX as usize {
            return Err(anyhow!(
                "too many worker threads requested: {}",
                self.worker_threads
            ));
        }

        Ok(())
    }
}

impl TryFrom<Builder> for ProcessorConfig {
    type Error = anyhow::Error;

    fn try_from(builder: Builder) -> Result<Self, Self::Error> {
        let worker_threads = match builder.worker_threads {
            Some(n) => n,
            None => thread::available_parallelism()?.get(),
        };

        let cfg = ProcessorConfig {
            worker_threads,
            thread_name: builder.thread_name,
            thread_stack_size: builder.thread_stack_size,
            global_queue_interval: builder.global_queue_interval,
            max_steal_retries: builder.max_steal_retries,
            max_queue_length: builder.max_queue_length,
            max_queue_wait_time: builder.max_queue_wait_time,
            overload_action: builder.overload_action,
            timer_threads: builder.timer_threads,
        };

        cfg.validate()?;

        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;

    assert_impl_all!(ProcessorConfig: Send, Sync, Clone);
    assert_impl_all!(Builder: Send, Sync);

    #[test]
    fn test_defaults() -> Result<()> {
        let cfg = ProcessorConfig::try_from(Builder::new().worker_threads(2))?;

        assert_eq!(cfg.worker_threads, 2);
        assert_eq!(cfg.global_queue_interval, GLOBAL_QUEUE_INTERVAL);
        assert_eq!(cfg.max_steal_retries, MAX_STEAL_RETRIES);
        assert_eq!(cfg.max_queue_length, None);
        assert_eq!(cfg.overload_action, OverloadAction::Cancel);
        assert_eq!((cfg.thread_name.0)(), "coro-worker-0");
        assert_eq!((cfg.thread_name.0)(), "coro-worker-1");
        Ok(())
    }

    #[test]
    #[should_panic(expected = "worker_threads must be greater than 0")]
    fn test_zero_workers_rejected() {
        let _ = Builder::new().worker_threads(0);
    }
}
