use super::*;
use crate::WaitError;
use crate::error::TaskError;
use crate::sync::SingleUseEvent;
use crate::test_utils::{init_processor, spin_until};
use crate::time::sleep_for;
use crate::utils::scope_guard::ScopeGuard;
use crate::utils::thread::get_current_thread_name;
use rstest::rstest;
use static_assertions::assert_impl_all;
use std::sync::atomic::AtomicU64;
use std::time::Duration;

assert_impl_all!(TaskProcessor: Send, Sync);
assert_impl_all!(Handle: Send, Sync);

const SETTLE: Duration = Duration::from_millis(10);
const PATIENCE: Duration = Duration::from_secs(5);

/// Keeps one worker busy, off the scheduler, until `release` is set.
fn occupy_worker(processor: &TaskProcessor) -> (Task<()>, Arc<AtomicBool>) {
    let release = Arc::new(AtomicBool::new(false));
    let started = Arc::new(AtomicBool::new(false));

    let task = {
        let release = Arc::clone(&release);
        let started = Arc::clone(&started);
        processor.spawn_critical(async move {
            started.store(true, Ordering::SeqCst);
            while !release.load(Ordering::SeqCst) {
                std::thread::yield_now();
            }
        })
    };
    assert!(spin_until(|| started.load(Ordering::SeqCst), PATIENCE));
    (task, release)
}

#[test]
fn test_block_on_runs_nested_spawns() -> Result<()> {
    let processor = init_processor(2)?;

    let sum = processor.block_on(async {
        let tasks = (1..=10u64)
            .map(|i| crate::spawn(async move { i * i }))
            .collect::<Vec<_>>();

        let mut sum = 0;
        for task in tasks {
            sum += task.get().await?;
        }
        Ok::<_, TaskError>(sum)
    })?;

    assert_eq!(sum, 385);
    Ok(())
}

#[test]
#[should_panic(expected = "kaboom")]
fn test_block_on_resumes_panic() {
    let processor = init_processor(1).expect("processor");
    processor.block_on(async {
        if current_task::try_id().is_some() {
            panic!("kaboom");
        }
    });
}

#[test]
#[should_panic(expected = "spawn called outside of a task processor")]
fn test_spawn_outside_processor_panics() {
    let _ = crate::spawn(async {});
}

#[test]
fn test_workers_run_in_parallel() -> Result<()> {
    const WORKERS: usize = 4;
    let processor = init_processor(WORKERS)?;
    let arrived = Arc::new(AtomicUsize::new(0));

    // Every task blocks its thread until all of them arrived, which only
    // happens if each one got its own worker.
    let tasks = (0..WORKERS)
        .map(|_| {
            let arrived = Arc::clone(&arrived);
            processor.spawn(async move {
                arrived.fetch_add(1, Ordering::SeqCst);
                spin_until(|| arrived.load(Ordering::SeqCst) == WORKERS, PATIENCE)
            })
        })
        .collect::<Vec<_>>();

    let all_met = processor.block_on(async move {
        let mut all_met = true;
        for task in tasks {
            all_met &= task.get().await?;
        }
        Ok::<_, TaskError>(all_met)
    })?;
    assert!(all_met);
    Ok(())
}

#[rstest]
#[case::cancel(OverloadAction::Cancel)]
#[case::ignore(OverloadAction::Ignore)]
fn test_queue_length_overload(#[case] action: OverloadAction) -> Result<()> {
    let processor = TaskProcessor::builder()
        .worker_threads(1)
        .max_queue_length(2)
        .overload_action(action)
        .try_build()?;
    let (blocker, release) = occupy_worker(&processor);

    let normal = (0..4).map(|i| processor.spawn(async move { i })).collect::<Vec<_>>();
    let critical = processor.spawn_critical(async { 4 });
    let over_limit = normal[2..].iter().map(Task::id).collect::<Vec<_>>();

    release.store(true, Ordering::SeqCst);
    let results = processor.block_on(async move {
        let mut results = Vec::new();
        for task in normal.into_iter().chain([critical]) {
            results.push(task.get().await.ok());
        }
        results
    });
    drop(blocker);

    let shed = action == OverloadAction::Cancel;
    let expected = if shed {
        vec![Some(0), Some(1), None, None, Some(4)]
    } else {
        vec![Some(0), Some(1), Some(2), Some(3), Some(4)]
    };
    assert_eq!(results, expected);

    let overloads = processor.handle().tracker.get_calls(&Method::Overload);
    let expected_calls = over_limit
        .into_iter()
        .map(|id| Call::Overload { id, cancelled: shed })
        .collect::<Vec<_>>();
    assert_eq!(overloads, expected_calls);
    assert_eq!(processor.stats().cancelled_overload, if shed { 2 } else { 0 });
    Ok(())
}

#[test]
fn test_queue_wait_time_overload() -> Result<()> {
    let processor = TaskProcessor::builder()
        .worker_threads(1)
        .max_queue_wait_time(Duration::from_millis(5))
        .try_build()?;
    let (blocker, release) = occupy_worker(&processor);

    // Sits in the queue well past the limit.
    let late = processor.spawn(async {});
    std::thread::sleep(SETTLE * 5);
    release.store(true, Ordering::SeqCst);
    assert!(spin_until(|| late.is_finished(), PATIENCE));
    assert_eq!(late.state(), State::Completed);

    // Nothing was dequeued in time since, the processor is still overloaded.
    let shed = processor.spawn(async {});
    assert!(spin_until(|| shed.is_finished(), PATIENCE));
    assert!(matches!(
        shed.take_result(),
        Err(TaskError::Cancelled { reason: CancellationReason::Overload, .. })
    ));

    let critical = processor.spawn_critical(async { 1 });
    assert!(spin_until(|| critical.is_finished(), PATIENCE));
    assert_eq!(critical.take_result()?, 1);

    drop(blocker);
    Ok(())
}

#[test]
fn test_shutdown_cancels_and_drops_tasks() -> Result<()> {
    let processor = init_processor(2)?;
    let dropped = Arc::new(AtomicBool::new(false));

    let sleeper = processor.spawn(async { sleep_for(Duration::from_secs(60)).await });
    let stuck = {
        let dropped = Arc::clone(&dropped);
        processor.spawn(async move {
            let _guard = ScopeGuard::new(move || dropped.store(true, Ordering::SeqCst));
            SingleUseEvent::new().wait_non_cancellable().await;
        })
    };
    std::thread::sleep(SETTLE);

    processor.shutdown()?;

    // The cancellable wait noticed and returned normally.
    assert_eq!(sleeper.state(), State::Completed);
    assert_eq!(
        sleeper.take_result()?,
        Err(WaitError::Cancelled(CancellationReason::Shutdown))
    );

    // The other one could not, its body was dropped.
    assert_eq!(stuck.state(), State::Cancelled);
    assert!(dropped.load(Ordering::SeqCst));
    assert!(matches!(
        stuck.take_result(),
        Err(TaskError::Cancelled { reason: CancellationReason::Shutdown, .. })
    ));
    Ok(())
}

#[test]
fn test_shutdown_is_idempotent() -> Result<()> {
    let processor = init_processor(1)?;
    processor.shutdown_inner()?;
    processor.shutdown_inner()?;
    processor.shutdown()
}

#[test]
fn test_stats() -> Result<()> {
    let processor = init_processor(1)?;

    processor.block_on(async {
        for _ in 0..3 {
            crate::spawn(async {}).get().await?;
        }

        // We hold the only worker, the task cannot start before the cancel.
        let task = crate::spawn(async {});
        task.request_cancel();
        assert!(task.get().await.is_err());
        Ok::<_, TaskError>(())
    })?;

    // The block_on task itself counts as well.
    assert!(spin_until(|| processor.stats().finished == 5, PATIENCE));
    let stats = processor.stats();
    assert_eq!(stats.created, 5);
    assert_eq!(stats.cancelled, 1);
    assert_eq!(stats.cancelled_overload, 0);
    assert_eq!(stats.alive(), 0);
    assert_eq!(processor.handle().tracker.num_calls(&Method::Spawn), 5);
    Ok(())
}

#[test]
fn test_spawn_tracker_records_importance() -> Result<()> {
    let processor = init_processor(1)?;
    let normal = processor.spawn(async {});
    let critical = processor.spawn_critical(async {});
    let expected = vec![
        Call::Spawn { id: normal.id(), importance: Importance::Normal },
        Call::Spawn { id: critical.id(), importance: Importance::Critical },
    ];
    drop((normal, critical));

    assert_eq!(processor.handle().tracker.get_calls(&Method::Spawn), expected);
    Ok(())
}

#[test]
fn test_default_worker_thread_names() -> Result<()> {
    let processor = init_processor(3)?;

    let mut names = processor.pool.thread_names();
    names.sort();
    assert_eq!(names, ["coro-worker-0", "coro-worker-1", "coro-worker-2"]);

    let name = processor.block_on(async { get_current_thread_name() })?;
    assert!(name.starts_with("coro-worker-"));
    Ok(())
}

#[test]
fn test_custom_worker_thread_names() -> Result<()> {
    let next = Arc::new(AtomicU64::new(100));
    let processor = TaskProcessor::builder()
        .worker_threads(2)
        .thread_name_fn(move || format!("svc-{}", next.fetch_add(1, Ordering::Relaxed)))
        .try_build()?;

    let mut names = processor.pool.thread_names();
    names.sort();
    assert_eq!(names, ["svc-100", "svc-101"]);
    assert_eq!(processor.worker_threads(), 2);
    Ok(())
}

#[test]
fn test_tasks_know_their_worker() -> Result<()> {
    let processor = init_processor(3)?;

    assert_eq!(context::current_worker_index(), None);
    let index = processor.block_on(async { context::current_worker_index() });
    assert!(index.is_some_and(|i| i < 3));
    Ok(())
}
