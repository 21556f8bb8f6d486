use crate::context::{self, LocalQueue, WorkerContext};
use crate::processor::ticker::{Ticker, TickerData, TickerEvents};
use crate::processor::{Handle, Inner, ProcessorConfig};
use crate::task::TaskContext;
use crossbeam_deque::{Injector, Stealer, Worker as CbWorker};
use crossbeam_utils::sync::WaitGroup;
use std::iter;
use std::mem;
use std::sync::Arc;

#[derive(Debug)]
pub(crate) struct Worker {
    index: usize,
    processor: Handle,

    /// Determines how we run the event loop.
    cfg: EventLoopConfig,

    /// Event loop ticker.
    ticker: Ticker,

    /// Whether we should try to find our next task in the global queue.
    pop_global_queue: bool,

    /// Handle to all of the other worker's local queues. If there are N
    /// workers we will have N-1 queues to steal from.
    stealers: Vec<Stealer<Arc<TaskContext>>>,
}

impl Worker {
    pub(super) fn new(index: usize, processor: Handle, mut stealers: Vec<Stealer<Arc<TaskContext>>>) -> Self {
        // Shuffle the stealers so that each worker's search order when trying to
        // steal work is different and hopefully unique to reduce contention.
        fastrand::shuffle(&mut stealers);

        Self {
            index,
            cfg: EventLoopConfig::from(&processor.cfg),
            processor,
            ticker: Ticker::new(),
            pop_global_queue: false,
            stealers,
        }
    }

    /// Thread entry point. `started` is released once the worker can be
    /// unparked.
    pub(super) fn run(mut self, local: LocalQueue, started: WaitGroup) {
        self.processor.shared.register_worker(self.index);
        let _worker = context::enter_worker(WorkerContext {
            processor: self.processor.clone(),
            index: self.index,
            local,
        });
        drop(started);

        tracing::debug!(worker = self.index, "worker started");
        context::with_worker(|ctx| self.event_loop(ctx));
        tracing::debug!(worker = self.index, "worker stopped");
    }

    fn find_task(&mut self, local: &LocalQueue) -> Option<Arc<TaskContext>> {
        let global = &self.processor.injector;

        // Enforce scheduler fairness by force-checking the global queue with
        // frequency `global_queue_interval`.
        if mem::take(&mut self.pop_global_queue)
            && let Some(task) = global.steal_batch_and_pop(local).success()
        {
            return Some(task);
        }

        // 1. Tasks woken on this worker, oldest first.
        local.pop().or_else(|| {
            // 2. No local work, repeatedly try the global injector and the
            //    other workers' queues.
            iter::repeat_with(|| {
                global.steal_batch_and_pop(local).or_else(||
                    // Collecting stops at the first Success(T), we are not
                    // draining every stealer each time.
                    self.stealers.iter().map(|s| s.steal_batch_and_pop(local)).collect())
            })
            .take(self.cfg.max_steal_retries)
            .find(|s| !s.is_retry())
            .and_then(|s| s.success())
        })
    }

    fn run_task(&self, task: Arc<TaskContext>) {
        self.processor.on_dequeued(&task);
        task.run();
    }

    fn event_loop(&mut self, ctx: &WorkerContext) {
        loop {
            if let Some(task) = self.find_task(&ctx.local) {
                self.run_task(task);
            } else {
                // Park the thread and wait for new tasks on the injector and an
                // unpark signal from a scheduling thread.
                let injector = &self.processor.injector;
                let stealers = &self.stealers;
                self.processor
                    .shared
                    .park(self.index, || has_pending_work(injector, &ctx.local, stealers));
            }

            let events = self.ticker.tick(&*self.processor, &mut self.cfg);
            if events.contains(TickerEvents::SHUTDOWN) {
                break;
            } else if events.contains(TickerEvents::POP_GLOBAL_QUEUE) {
                self.pop_global_queue = true;
            }
        }

        self.drain(ctx);
    }

    /// Runs whatever is still queued. Shutdown cancellation wakes every
    /// suspended task, so this is where they observe it.
    fn drain(&mut self, ctx: &WorkerContext) {
        let mut drained = 0usize;
        while let Some(task) = self.find_task(&ctx.local) {
            self.run_task(task);
            drained += 1;
        }
        tracing::trace!(worker = self.index, drained, "worker drained its queues");
    }
}

/// Whether a worker about to park could still find a task somewhere.
fn has_pending_work<T>(injector: &Injector<T>, local: &CbWorker<T>, stealers: &[Stealer<T>]) -> bool {
    !injector.is_empty() || !local.is_empty() || stealers.iter().any(|s| !s.is_empty())
}

#[derive(Debug, Clone)]
struct EventLoopConfig {
    global_queue_interval: u32,

    max_steal_retries: usize,
}

impl EventLoopConfig {
    #[inline(always)]
    fn should_pop_global_queue(&self, tick: u32) -> bool {
        tick.is_multiple_of(self.global_queue_interval)
    }
}

impl From<&ProcessorConfig> for EventLoopConfig {
    fn from(cfg: &ProcessorConfig) -> EventLoopConfig {
        EventLoopConfig {
            global_queue_interval: cfg.global_queue_interval,
            max_steal_retries: cfg.max_steal_retries,
        }
    }
}

impl TickerData for EventLoopConfig {
    type Context = Inner;

    #[inline(always)]
    fn update_and_check(&mut self, processor: &Inner, tick: u32) -> TickerEvents {
        // Fast-path to enforce shutdown
        if processor.shared.is_shutdown() {
            return TickerEvents::SHUTDOWN;
        }

        if self.should_pop_global_queue(tick) {
            TickerEvents::POP_GLOBAL_QUEUE
        } else {
            TickerEvents::empty()
        }
    }
}
