use crate::processor::Handle;
use crate::processor::worker::Worker;
use crate::utils::thread::spawn_named;
use anyhow::{Result, anyhow};
use crossbeam_deque::Worker as CbWorker;
use crossbeam_utils::sync::WaitGroup;
use parking_lot::Mutex;
use std::sync::atomic::Ordering;
use std::thread;

/// The processor's worker threads.
#[derive(Debug)]
pub(super) struct ThreadPool {
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl ThreadPool {
    /// Spawns every worker and returns once all of them are registered and
    /// can be unparked.
    pub(super) fn spawn(processor: &Handle) -> Result<Self> {
        let num_workers = processor.cfg.worker_threads;

        // FIFO local queues and their stealers
        let mut local_queues = Vec::with_capacity(num_workers);
        let mut stealers = Vec::with_capacity(num_workers);

        for _ in 0..num_workers {
            let w = CbWorker::new_fifo();
            stealers.push(w.stealer());
            local_queues.push(w);
        }

        let started = WaitGroup::new();
        let mut handles = Vec::with_capacity(num_workers);

        for (index, local_queue) in local_queues.into_iter().enumerate() {
            // Give each worker a list of all *other* workers' stealers
            let other_stealers = stealers
                .iter()
                .enumerate()
                .filter(|(j, _)| *j != index)
                .map(|(_, s)| s.clone())
                .collect::<Vec<_>>();

            let worker = Worker::new(index, processor.clone(), other_stealers);
            let started = started.clone();

            let spawned = spawn_named(
                &processor.cfg.thread_name,
                processor.cfg.thread_stack_size,
                move || worker.run(local_queue, started),
            );

            match spawned {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    // Release the workers that did start.
                    processor.shared.shutdown.store(true, Ordering::Release);
                    processor.shared.unpark_all();
                    let pool = ThreadPool {
                        handles: Mutex::new(handles),
                    };
                    if let Err(join_err) = pool.join_all() {
                        tracing::error!(error = ?join_err, "worker failed while aborting startup");
                    }
                    return Err(err);
                }
            }
        }

        // Spawning threads is async, wait for all threads to be started...
        started.wait();

        Ok(Self {
            handles: Mutex::new(handles),
        })
    }

    pub(super) fn join_all(&self) -> Result<()> {
        let mut handles = self.handles.lock();

        let errors = handles
            .drain(..)
            .filter_map(|handle| {
                let name = handle.thread().name().map(str::to_owned);
                handle.join().err().map(|_| name)
            })
            .inspect(|name| tracing::error!(thread = ?name, "worker thread panicked"))
            .count();

        if errors == 0 {
            Ok(())
        } else {
            Err(anyhow!("{errors} worker thread(s) panicked"))
        }
    }

    #[cfg(test)]
    pub(super) fn thread_names(&self) -> Vec<String> {
        self.handles
            .lock()
            .iter()
            .filter_map(|h| h.thread().name().map(str::to_owned))
            .collect()
    }
}
