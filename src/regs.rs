// Licensed under the Apache-2.0 license

//! Register access seam between the controllers and the surrounding driver.
//!
//! The surrounding driver owns PCI mapping and interrupt routing; the
//! controllers only ever see this trait. Board declaration tables supply the
//! concrete addresses handed to each controller's config struct.

/// Memory-mapped register window exposed by the surrounding driver.
///
/// All accesses are synchronous; the fences order them against each other
/// on platforms where the bus may reorder posted writes.
pub trait RegisterInterface {
    fn read(&mut self, addr: u32) -> u32;

    fn write(&mut self, addr: u32, value: u32);

    /// Full ordering fence between preceding and following accesses.
    fn reorder_barrier(&mut self);

    /// Lighter fence ordering back-to-back accesses to the same register.
    fn reorder_b2b_barrier(&mut self);
}

impl<T: RegisterInterface + ?Sized> RegisterInterface for &mut T {
    fn read(&mut self, addr: u32) -> u32 {
        (**self).read(addr)
    }

    fn write(&mut self, addr: u32, value: u32) {
        (**self).write(addr, value);
    }

    fn reorder_barrier(&mut self) {
        (**self).reorder_barrier();
    }

    fn reorder_b2b_barrier(&mut self) {
        (**self).reorder_b2b_barrier();
    }
}

#[cfg(test)]
pub(crate) mod mock {
    //! Scriptable register fake shared by the controller tests.

    use super::RegisterInterface;
    use std::collections::{HashMap, HashSet, VecDeque};

    /// One recorded access, in program order.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Access {
        Read(u32),
        Write(u32, u32),
        Barrier,
        B2bBarrier,
    }

    /// Records every access and replays scripted read values.
    ///
    /// Reads pop a per-address queue first; with the queue empty they fall
    /// back to the last written value (unless mirroring is disabled for the
    /// address) and finally to zero.
    #[derive(Default)]
    pub struct MockRegs {
        pub log: Vec<Access>,
        queues: HashMap<u32, VecDeque<u32>>,
        latches: HashMap<u32, u32>,
        no_mirror: HashSet<u32>,
    }

    impl MockRegs {
        pub fn new() -> Self {
            Self::default()
        }

        /// Scripts the next read of `addr` to return `value`.
        pub fn push_read(&mut self, addr: u32, value: u32) {
            self.queues.entry(addr).or_default().push_back(value);
        }

        pub fn push_reads(&mut self, addr: u32, values: &[u32]) {
            for &value in values {
                self.push_read(addr, value);
            }
        }

        /// Fixes the fallback value read from `addr`.
        pub fn set_latch(&mut self, addr: u32, value: u32) {
            self.latches.insert(addr, value);
        }

        /// Stops writes to `addr` from updating the read-back latch.
        pub fn skip_mirror(&mut self, addr: u32) {
            self.no_mirror.insert(addr);
        }

        /// All values written to `addr`, in order.
        pub fn writes_to(&self, addr: u32) -> Vec<u32> {
            self.log
                .iter()
                .filter_map(|access| match access {
                    Access::Write(a, v) if *a == addr => Some(*v),
                    _ => None,
                })
                .collect()
        }

        /// Register reads and writes only, fences dropped.
        pub fn data_accesses(&self) -> Vec<Access> {
            self.log
                .iter()
                .copied()
                .filter(|access| matches!(access, Access::Read(_) | Access::Write(..)))
                .collect()
        }

        pub fn clear_log(&mut self) {
            self.log.clear();
        }
    }

    impl RegisterInterface for MockRegs {
        fn read(&mut self, addr: u32) -> u32 {
            let value = self
                .queues
                .get_mut(&addr)
                .and_then(|queue| queue.pop_front())
                .or_else(|| self.latches.get(&addr).copied())
                .unwrap_or(0);
            self.log.push(Access::Read(addr));
            value
        }

        fn write(&mut self, addr: u32, value: u32) {
            if !self.no_mirror.contains(&addr) {
                self.latches.insert(addr, value);
            }
            self.log.push(Access::Write(addr, value));
        }

        fn reorder_barrier(&mut self) {
            self.log.push(Access::Barrier);
        }

        fn reorder_b2b_barrier(&mut self) {
            self.log.push(Access::B2bBarrier);
        }
    }

    /// Zero-cost delay for host tests.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct TestDelay;

    impl embedded_hal::delay::DelayNs for TestDelay {
        fn delay_ns(&mut self, _ns: u32) {}
    }
}
