use super::*;
use crate as coroengine;
use crate::sync::{SingleConsumerEvent, SingleUseEvent};
use crate::test_utils::init_processor;
use crate::time::{sleep_for, yield_now};
use crate::{Deadline, TaskError, WaitError};
use anyhow::Result;
use futures::FutureExt;
use futures::future::poll_fn;
use parking_lot::Mutex;
use rstest::rstest;
use static_assertions::assert_impl_all;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::Poll;
use std::time::Duration;

assert_impl_all!(Task<u64>: Send, Sync);
assert_impl_all!(TaskWaker: Send, Sync, Clone);

const SETTLE: Duration = Duration::from_millis(10);

#[coroengine::test]
async fn test_get_returns_value() -> Result<()> {
    let task = coroengine::spawn(async { 40 + 2 });
    assert_eq!(task.importance(), Importance::Normal);

    task.wait().await?;
    assert_eq!(task.state(), State::Completed);
    assert_eq!(task.cancellation_reason(), None);
    assert_eq!(task.get().await?, 42);
    Ok(())
}

#[coroengine::test]
async fn test_panic_surfaces_as_panicked() -> Result<()> {
    let task = coroengine::spawn(async {
        if current_task::try_id().is_some() {
            panic!("boom");
        }
    });

    let err = task.get().await.expect_err("body panicked");
    assert!(err.is_panic());
    assert_eq!(err.into_panic().downcast_ref::<&str>(), Some(&"boom"));
    Ok(())
}

#[rstest]
#[case::normal_never_starts(Importance::Normal, false)]
#[case::critical_always_starts(Importance::Critical, true)]
#[coroengine::test]
async fn test_cancel_before_start(#[case] importance: Importance, #[case] runs: bool) -> Result<()> {
    let ran = Arc::new(AtomicBool::new(false));

    // Single worker, busy with us: the task stays queued until we suspend.
    let task = {
        let ran = Arc::clone(&ran);
        coroengine::spawn_builder()
            .importance(importance)
            .spawn(async move {
                ran.store(true, Ordering::SeqCst);
                current_task::is_cancel_requested()
            })
    };
    task.request_cancel();
    task.wait().await?;

    assert_eq!(ran.load(Ordering::SeqCst), runs);
    assert_eq!(task.cancellation_reason(), Some(CancellationReason::UserRequest));
    match task.get().await {
        Ok(observed_cancel) => {
            assert!(runs);
            assert!(observed_cancel);
        }
        Err(err) => {
            assert!(!runs);
            assert!(matches!(
                err,
                TaskError::Cancelled { reason: CancellationReason::UserRequest, .. }
            ));
        }
    }
    Ok(())
}

#[coroengine::test(worker_threads = 2)]
async fn test_detached_task_keeps_running() -> Result<()> {
    let done = Arc::new(SingleUseEvent::new());

    {
        let done = Arc::clone(&done);
        coroengine::spawn(async move {
            if sleep_for(SETTLE).await.is_ok() {
                done.send();
            }
        })
        .detach();
    }

    done.wait_until(Deadline::from_duration(Duration::from_secs(5))).await?;
    Ok(())
}

#[coroengine::test(worker_threads = 2)]
async fn test_dropped_handle_cancels_task() -> Result<()> {
    let outcome = Arc::new(Mutex::new(None));
    let finished = Arc::new(SingleUseEvent::new());

    let task = {
        let outcome = Arc::clone(&outcome);
        let finished = Arc::clone(&finished);
        coroengine::spawn(async move {
            let res = sleep_for(Duration::from_secs(60)).await;
            *outcome.lock() = Some(res);
            finished.send();
        })
    };
    sleep_for(SETTLE).await?;

    // Inside a task the drop only requests cancellation.
    drop(task);
    finished.wait().await?;
    assert_eq!(
        *outcome.lock(),
        Some(Err(WaitError::Cancelled(CancellationReason::Abandoned)))
    );
    Ok(())
}

#[test]
fn test_drop_outside_task_blocks_until_finished() -> Result<()> {
    let processor = init_processor(2)?;
    let reason = Arc::new(Mutex::new(None));

    let task = {
        let reason = Arc::clone(&reason);
        processor.spawn(async move {
            let _ = sleep_for(Duration::from_secs(60)).await;
            std::thread::sleep(Duration::from_millis(5));
            *reason.lock() = current_task::cancellation_reason();
        })
    };
    std::thread::sleep(SETTLE);

    drop(task);
    assert_eq!(*reason.lock(), Some(CancellationReason::Abandoned));
    Ok(())
}

#[coroengine::test(worker_threads = 2)]
async fn test_wait_for_times_out_without_touching_task() -> Result<()> {
    let task = coroengine::spawn(async { sleep_for(Duration::from_secs(60)).await });

    assert_eq!(task.wait_for(Duration::from_millis(5)).await, Err(WaitError::Timeout));
    assert!(!task.is_finished());
    assert_eq!(task.cancellation_reason(), None);

    task.cancel_and_wait().await;
    assert_eq!(task.state(), State::Completed);
    assert_eq!(
        task.get().await?,
        Err(WaitError::Cancelled(CancellationReason::UserRequest))
    );
    Ok(())
}

#[coroengine::test(worker_threads = 2)]
async fn test_get_interrupted_by_caller_cancellation() -> Result<()> {
    let outer = coroengine::spawn(async {
        let inner = coroengine::spawn(async { sleep_for(Duration::from_secs(60)).await });
        inner.get().await.map(|_| ())
    });
    sleep_for(SETTLE).await?;
    outer.request_cancel();

    let err = outer.get().await?.expect_err("outer was cancelled while waiting");
    assert!(err.is_wait_interrupted());
    assert!(matches!(
        err,
        TaskError::WaitInterrupted { reason: CancellationReason::UserRequest, .. }
    ));
    Ok(())
}

#[coroengine::test(worker_threads = 2)]
async fn test_cancellation_blocker_defers_cancel() -> Result<()> {
    let started = Arc::new(SingleUseEvent::new());

    let task = {
        let started = Arc::clone(&started);
        coroengine::spawn(async move {
            let blocker = CancellationBlocker::new();
            started.send();

            let slept = sleep_for(SETTLE * 2).await;
            let requested = current_task::is_cancel_requested();
            let should_cancel = current_task::should_cancel();
            drop(blocker);

            (slept, requested, should_cancel, current_task::cancellation_point())
        })
    };

    started.wait().await?;
    task.request_cancel();

    let (slept, requested, should_cancel, point) = task.get().await?;
    assert_eq!(slept, Ok(()));
    assert!(requested);
    assert!(!should_cancel);
    assert_eq!(point, Err(WaitError::Cancelled(CancellationReason::UserRequest)));
    Ok(())
}

#[coroengine::test(worker_threads = 2)]
async fn test_deadline_cancels_running_task() -> Result<()> {
    let task = coroengine::spawn_builder()
        .deadline_after(Duration::from_millis(5))
        .spawn(async { sleep_for(Duration::from_secs(60)).await });

    task.wait().await?;
    assert_eq!(task.cancellation_reason(), Some(CancellationReason::Deadline));
    assert_eq!(
        task.get().await?,
        Err(WaitError::Cancelled(CancellationReason::Deadline))
    );
    Ok(())
}

#[coroengine::test]
async fn test_passed_deadline_skips_normal_task() -> Result<()> {
    let task = coroengine::spawn_builder()
        .deadline(Deadline::passed())
        .spawn(async { 1 });

    let err = task.get().await.expect_err("never started");
    assert!(err.is_cancelled());
    assert!(matches!(
        err,
        TaskError::Cancelled { reason: CancellationReason::Deadline, .. }
    ));
    Ok(())
}

#[coroengine::test(worker_threads = 2)]
async fn test_task_waker_resumes_suspended_task() -> Result<()> {
    let slot = Arc::new(Mutex::new(None));

    let task = {
        let slot = Arc::clone(&slot);
        coroengine::spawn(async move {
            *slot.lock() = Some(current_task::waker());

            // Only an explicit wakeup brings us back.
            let mut parked = false;
            poll_fn(|_| {
                if std::mem::replace(&mut parked, true) {
                    Poll::Ready(())
                } else {
                    Poll::Pending
                }
            })
            .await;
            current_task::id()
        })
    };

    let waker = loop {
        if let Some(waker) = slot.lock().take() {
            break waker;
        }
        yield_now().await;
    };
    assert_eq!(waker.task_id(), Some(task.id()));

    sleep_for(SETTLE).await?;
    assert!(!task.is_finished());

    waker.wake();
    let id = task.id();
    assert_eq!(task.get().await?, id);

    // Waking a finished task is a no-op.
    waker.wake();
    Ok(())
}

#[coroengine::test(worker_threads = 2)]
async fn test_waiting_on_self_panics() -> Result<()> {
    let slot: Arc<Mutex<Option<Task<()>>>> = Arc::new(Mutex::new(None));
    let event = Arc::new(SingleConsumerEvent::new());
    let panicked = Arc::new(AtomicBool::new(false));

    let task = {
        let slot = Arc::clone(&slot);
        let event = Arc::clone(&event);
        let panicked = Arc::clone(&panicked);
        coroengine::spawn(async move {
            let me = loop {
                if let Some(me) = slot.lock().take() {
                    break me;
                }
                yield_now().await;
            };
            let outcome = AssertUnwindSafe(me.wait()).catch_unwind().await;
            panicked.store(outcome.is_err(), Ordering::SeqCst);
            me.detach();
            event.send();
        })
    };
    *slot.lock() = Some(task);

    event.wait().await?;
    assert!(panicked.load(Ordering::SeqCst));
    Ok(())
}

#[coroengine::test]
async fn test_current_task_queries() -> Result<()> {
    // The test body itself runs as a critical task.
    let me = current_task::id();
    assert_eq!(current_task::try_id(), Some(me));
    assert_eq!(current_task::importance(), Importance::Critical);
    assert!(!current_task::is_cancel_requested());
    assert_eq!(current_task::cancellation_reason(), None);
    current_task::cancellation_point()?;

    let other = coroengine::spawn(async { current_task::id() });
    let other_id = other.id();
    assert_ne!(other_id, me);
    assert_eq!(other.get().await?, other_id);
    Ok(())
}

#[test]
fn test_current_task_outside_task() {
    assert_eq!(current_task::try_id(), None);
}

#[test]
#[should_panic(expected = "not called from a task")]
fn test_current_task_id_outside_task_panics() {
    let _ = current_task::id();
}
