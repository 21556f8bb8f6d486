/// Runs a closure when dropped, unless disarmed first.
///
/// Fires on every exit path of the enclosing scope, unwinding included.
///
/// ```ignore
/// let mut released = false;
/// {
///     let _guard = ScopeGuard::new(|| released = true);
/// }
/// assert!(released);
/// ```
pub(crate) struct ScopeGuard<F: FnOnce()> {
    // `Option` so the closure runs at most once.
    closure: Option<F>,
}

impl<F: FnOnce()> ScopeGuard<F> {
    pub(crate) fn new(closure: F) -> Self {
        ScopeGuard {
            closure: Some(closure),
        }
    }

    pub(crate) fn disarm(&mut self) {
        self.closure.take();
    }
}

impl<F: FnOnce()> Drop for ScopeGuard<F> {
    fn drop(&mut self) {
        if let Some(closure) = self.closure.take() {
            closure();
        }
    }
}
