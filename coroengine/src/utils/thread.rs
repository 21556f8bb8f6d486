use crate::processor::ThreadNameFn;
use anyhow::{Result, anyhow};
use std::sync::Arc;
use std::task::{Wake, Waker};
use std::thread::{self, Thread};

#[cfg(test)]
const MAX_PTHREAD_NAME_LEN: usize = 16;

/// Reads back the pthread name of the calling thread.
#[cfg(all(test, target_os = "linux"))]
pub(crate) fn get_current_thread_name() -> Result<String> {
    let mut c_name: [libc::c_char; MAX_PTHREAD_NAME_LEN] = [0; MAX_PTHREAD_NAME_LEN];

    let ret = unsafe {
        libc::pthread_getname_np(libc::pthread_self(), c_name.as_mut_ptr(), MAX_PTHREAD_NAME_LEN)
    };
    if ret != 0 {
        return Err(anyhow!("pthread_getname_np failed with error code: {ret}"));
    }

    let c_str = unsafe { std::ffi::CStr::from_ptr(c_name.as_ptr()) };
    c_str
        .to_str()
        .map(str::to_owned)
        .map_err(|e| anyhow!("thread name is not valid UTF-8: {e}"))
}

#[cfg(all(test, not(target_os = "linux")))]
pub(crate) fn get_current_thread_name() -> Result<String> {
    thread::current()
        .name()
        .map(str::to_owned)
        .ok_or_else(|| anyhow!("current thread is unnamed"))
}

/// Spawns a named runtime thread with the configured stack size.
pub(crate) fn spawn_named<F>(
    name_fn: &ThreadNameFn,
    stack_size: Option<usize>,
    f: F,
) -> Result<thread::JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    let name = (name_fn.0)();
    // std forwards the name to `pthread_setname_np`, truncated to 15 bytes.
    let mut builder = thread::Builder::new().name(name.clone());
    if let Some(stack_size) = stack_size {
        builder = builder.stack_size(stack_size);
    }

    builder
        .spawn(f)
        .map_err(|e| anyhow!("failed to spawn thread {name:?}: {e}"))
}

/// Waker that unparks an OS thread. Used wherever a plain thread blocks on
/// something that signals through a `Waker`.
#[derive(Debug)]
pub(crate) struct ThreadUnparker(Thread);

impl ThreadUnparker {
    pub(crate) fn current() -> Waker {
        Waker::from(Arc::new(ThreadUnparker(thread::current())))
    }
}

impl Wake for ThreadUnparker {
    fn wake(self: Arc<Self>) {
        self.0.unpark();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.0.unpark();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_named_thread_truncated() -> Result<()> {
        let name_fn = ThreadNameFn(Arc::new(|| "coro-a-very-long-thread-name".to_owned()));
        let handle = spawn_named(&name_fn, None, || {
            let name = get_current_thread_name().unwrap();
            assert!("coro-a-very-long-thread-name".starts_with(&name));
            assert!(name.len() < MAX_PTHREAD_NAME_LEN);
        })?;

        handle.join().map_err(|_| anyhow!("thread panicked"))
    }

    #[test]
    fn test_unparker_wakes_parked_thread() {
        let flag = Arc::new(AtomicBool::new(false));
        let waker = ThreadUnparker::current();

        let setter = {
            let flag = Arc::clone(&flag);
            thread::spawn(move || {
                flag.store(true, Ordering::Release);
                waker.wake();
            })
        };

        while !flag.load(Ordering::Acquire) {
            thread::park();
        }
        setter.join().unwrap();
    }
}
