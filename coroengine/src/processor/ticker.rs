use bitflags::bitflags;

#[derive(Debug)]
pub(crate) struct Ticker {
    tick: u32,
}

impl Ticker {
    pub(crate) fn new() -> Self {
        Self { tick: 0 }
    }

    pub(crate) fn tick<T: TickerData>(&mut self, ctx: &T::Context, data: &mut T) -> TickerEvents {
        self.tick = self.tick.wrapping_add(1);
        data.update_and_check(ctx, self.tick)
    }
}

/// Turns a tick into the events the worker must handle, keeping the policy
/// apart from the event loop itself.
pub(crate) trait TickerData {
    type Context;

    fn update_and_check(&mut self, ctx: &Self::Context, tick: u32) -> TickerEvents;
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub(crate) struct TickerEvents: u16 {
        /// Next task comes from the global queue, for fairness to new work.
        const POP_GLOBAL_QUEUE = 1;

        /// The processor is shutting down.
        const SHUTDOWN = 1 << 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EveryThird;

    impl TickerData for EveryThird {
        type Context = bool;

        fn update_and_check(&mut self, shutdown: &bool, tick: u32) -> TickerEvents {
            if *shutdown {
                return TickerEvents::SHUTDOWN;
            }
            if tick.is_multiple_of(3) {
                TickerEvents::POP_GLOBAL_QUEUE
            } else {
                TickerEvents::empty()
            }
        }
    }

    #[test]
    fn test_ticker_drives_policy() {
        let mut ticker = Ticker::new();
        let mut data = EveryThird;

        let events = (0..6)
            .map(|_| ticker.tick(&false, &mut data))
            .filter(|e| e.contains(TickerEvents::POP_GLOBAL_QUEUE))
            .count();
        assert_eq!(events, 2);
        assert_eq!(ticker.tick(&true, &mut data), TickerEvents::SHUTDOWN);
    }
}
