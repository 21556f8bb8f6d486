use std::time::{Duration, Instant};

/// A point in time after which a wait gives up.
///
/// An unreachable deadline never fires; it is the default for every wait that
/// does not take one explicitly.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    pub const fn unreachable() -> Self {
        Deadline(None)
    }

    pub fn from_instant(at: Instant) -> Self {
        Deadline(Some(at))
    }

    /// A deadline `timeout` from now; unreachable if that overflows `Instant`.
    pub fn from_duration(timeout: Duration) -> Self {
        Deadline(Instant::now().checked_add(timeout))
    }

    /// A deadline that has already passed.
    pub fn passed() -> Self {
        Deadline(Some(Instant::now()))
    }

    pub fn is_reachable(&self) -> bool {
        self.0.is_some()
    }

    pub fn is_reached(&self) -> bool {
        self.0.is_some_and(|at| Instant::now() >= at)
    }

    /// Time remaining, `None` when unreachable, zero once reached.
    pub fn time_left(&self) -> Option<Duration> {
        self.0.map(|at| at.saturating_duration_since(Instant::now()))
    }

    pub fn instant(&self) -> Option<Instant> {
        self.0
    }
}

impl From<Instant> for Deadline {
    fn from(at: Instant) -> Self {
        Deadline::from_instant(at)
    }
}
