use crate::deadline::Deadline;
use crate::sync::waiter::Interrupts;
use futures::task::{ArcWake, AtomicWaker, waker};
use parking_lot::Mutex;
use std::future::Future;
use std::mem;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll, Waker};
use std::time::Duration;

/// Something a task can wait on together with others in [`wait_any`].
///
/// Implemented for [`Task`](crate::task::Task) and for the
/// [`EventAwaitable`](super::EventAwaitable) views of both event flavors.
pub trait Awaitable: Send {
    /// `Ready` once the awaitable completed. Otherwise registers `cx`'s waker
    /// to be woken on completion.
    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<()>;

    /// Drops a registration left behind by `poll_ready`.
    fn unregister(&mut self) {}
}

impl<A: Awaitable + ?Sized> Awaitable for &mut A {
    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        (**self).poll_ready(cx)
    }

    fn unregister(&mut self) {
        (**self).unregister()
    }
}

/// Waits until any of `items` is ready and returns its index.
///
/// Returns `None` if the current task is cancelled first. An item that is
/// already ready is reported on the first poll, without suspending; when
/// several are ready the lowest index wins.
///
/// Every item gets its own waker, so a wakeup only re-polls the item that
/// fired.
pub fn wait_any<'a, 'b>(items: &'a mut [&'b mut dyn Awaitable]) -> WaitAny<'a, 'b> {
    wait_any_until(items, Deadline::unreachable())
}

/// Like [`wait_any`], also returning `None` once `deadline` passes.
pub fn wait_any_until<'a, 'b>(
    items: &'a mut [&'b mut dyn Awaitable],
    deadline: Deadline,
) -> WaitAny<'a, 'b> {
    WaitAny {
        woken: Arc::new(WokenSet::new(items.len())),
        items,
        interrupts: Interrupts::new(deadline),
        wakers: Vec::new(),
        registered: false,
    }
}

pub fn wait_any_for<'a, 'b>(items: &'a mut [&'b mut dyn Awaitable], timeout: Duration) -> WaitAny<'a, 'b> {
    wait_any_until(items, Deadline::from_duration(timeout))
}

/// Indices of the items woken since the last poll.
struct WokenSet {
    indices: Mutex<Vec<usize>>,
    /// Set while an index sits in `indices`, keeps it listed once.
    queued: Box<[AtomicBool]>,
    parent: AtomicWaker,
}

impl WokenSet {
    fn new(len: usize) -> Self {
        WokenSet {
            indices: Mutex::new(Vec::new()),
            queued: (0..len).map(|_| AtomicBool::new(false)).collect(),
            parent: AtomicWaker::new(),
        }
    }

    fn push(&self, index: usize) {
        if !self.queued[index].swap(true, Ordering::AcqRel) {
            self.indices.lock().push(index);
        }
        self.parent.wake();
    }

    /// Woken indices in ascending order. They are re-armed before the caller
    /// polls them, so a wakeup racing with that poll is not lost.
    fn take(&self) -> Vec<usize> {
        let mut indices = mem::take(&mut *self.indices.lock());
        for &index in &indices {
            self.queued[index].store(false, Ordering::Release);
        }
        indices.sort_unstable();
        indices.dedup();
        indices
    }
}

struct ItemWaker {
    index: usize,
    woken: Arc<WokenSet>,
}

impl ArcWake for ItemWaker {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.woken.push(arc_self.index);
    }
}

#[must_use = "futures do nothing unless polled"]
pub struct WaitAny<'a, 'b> {
    items: &'a mut [&'b mut dyn Awaitable],
    interrupts: Interrupts,
    woken: Arc<WokenSet>,

    /// One per item, built on the first poll.
    wakers: Vec<Waker>,
    registered: bool,
}

impl WaitAny<'_, '_> {
    fn teardown(&mut self) {
        if mem::take(&mut self.registered) {
            for item in self.items.iter_mut() {
                item.unregister();
            }
        }
    }

    /// Items to poll now: all of them the first time, then only those woken.
    fn candidates(&mut self) -> Vec<usize> {
        if self.registered {
            return self.woken.take();
        }

        self.registered = true;
        self.wakers = (0..self.items.len())
            .map(|index| {
                waker(Arc::new(ItemWaker {
                    index,
                    woken: Arc::clone(&self.woken),
                }))
            })
            .collect();
        (0..self.items.len()).collect()
    }
}

impl Future for WaitAny<'_, '_> {
    type Output = Option<usize>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        this.woken.parent.register(cx.waker());

        let ready = this.candidates().into_iter().find(|&index| {
            let mut item_cx = Context::from_waker(&this.wakers[index]);
            this.items[index].poll_ready(&mut item_cx).is_ready()
        });

        if ready.is_some() || this.interrupts.poll(cx).is_some() {
            this.teardown();
            return Poll::Ready(ready);
        }

        Poll::Pending
    }
}

impl Drop for WaitAny<'_, '_> {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::counting_waker;
    use std::pin::pin;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct ItemState {
        polls: AtomicUsize,
        ready: AtomicBool,
        waker: Mutex<Option<Waker>>,
    }

    impl ItemState {
        fn complete(&self) {
            self.ready.store(true, Ordering::SeqCst);
            if let Some(waker) = self.waker.lock().take() {
                waker.wake();
            }
        }

        fn polls(&self) -> usize {
            self.polls.load(Ordering::SeqCst)
        }
    }

    /// Completes when its shared state says so, counting every poll.
    struct Manual(Arc<ItemState>);

    impl Awaitable for Manual {
        fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<()> {
            self.0.polls.fetch_add(1, Ordering::SeqCst);
            *self.0.waker.lock() = Some(cx.waker().clone());
            if self.0.ready.load(Ordering::SeqCst) {
                Poll::Ready(())
            } else {
                Poll::Pending
            }
        }
    }

    fn manual_items(n: usize) -> (Vec<Arc<ItemState>>, Vec<Manual>) {
        let states = (0..n).map(|_| Arc::new(ItemState::default())).collect::<Vec<_>>();
        let items = states.iter().map(|s| Manual(Arc::clone(s))).collect();
        (states, items)
    }

    #[test]
    fn test_wakeup_repolls_only_the_woken_item() {
        let (states, mut items) = manual_items(8);
        let mut refs = items.iter_mut().map(|i| i as &mut dyn Awaitable).collect::<Vec<_>>();
        let (parent_wakes, parent) = counting_waker();
        let mut cx = Context::from_waker(&parent);

        let mut wait = pin!(wait_any(&mut refs));
        assert!(wait.as_mut().poll(&mut cx).is_pending());
        assert!(states.iter().all(|s| s.polls() == 1));

        // A spurious wakeup of the caller polls nothing.
        assert!(wait.as_mut().poll(&mut cx).is_pending());
        assert!(states.iter().all(|s| s.polls() == 1));

        states[5].complete();
        assert_eq!(parent_wakes.count(), 1);
        assert_eq!(wait.as_mut().poll(&mut cx), Poll::Ready(Some(5)));

        let polls = states.iter().map(|s| s.polls()).collect::<Vec<_>>();
        assert_eq!(polls, [1, 1, 1, 1, 1, 2, 1, 1]);
    }

    #[test]
    fn test_woken_items_resolve_lowest_first() {
        let (states, mut items) = manual_items(3);
        let mut refs = items.iter_mut().map(|i| i as &mut dyn Awaitable).collect::<Vec<_>>();
        let (_, parent) = counting_waker();
        let mut cx = Context::from_waker(&parent);

        let mut wait = pin!(wait_any(&mut refs));
        assert!(wait.as_mut().poll(&mut cx).is_pending());

        states[2].complete();
        states[1].complete();
        assert_eq!(wait.as_mut().poll(&mut cx), Poll::Ready(Some(1)));
        assert_eq!(states[0].polls(), 1);
    }

    #[test]
    fn test_woken_set_lists_each_index_once() {
        let woken = WokenSet::new(4);
        woken.push(3);
        woken.push(1);
        woken.push(3);
        assert_eq!(woken.take(), [1, 3]);
        assert!(woken.take().is_empty());

        // Re-armed after `take`.
        woken.push(3);
        assert_eq!(woken.take(), [3]);
    }
}
