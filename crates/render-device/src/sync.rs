//! CPU/GPU synchronization through a single monotonically increasing fence.

use std::{cell::Cell, rc::Rc, time::Duration};

use log::{error, trace};

use crate::{backend::Backend, Error, Result};

/// A point on the fence timeline. Work tagged with a value is complete once
/// the fence's completed value reaches it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FenceValue(pub u64);

pub struct FrameSynchronizer {
    backend: Rc<dyn Backend>,
    /// The last value signaled on the queue.
    last_signaled: Cell<u64>,
    /// The highest completed value observed so far.
    completed: Cell<u64>,
    timeout: Option<Duration>,
}

impl FrameSynchronizer {
    /// Creates the fence at zero. Waits give up after `timeout`, if one is
    /// set, and report the device as lost.
    pub fn new(backend: Rc<dyn Backend>, timeout: Option<Duration>) -> Result<Self> {
        backend.create_fence(0)?;

        Ok(Self {
            backend,
            last_signaled: Cell::new(0),
            completed: Cell::new(0),
            timeout,
        })
    }

    /// The value the next call to [`Self::signal`] will use. Work recorded
    /// now and submitted before that signal completes at this value.
    #[must_use]
    pub fn next_value(&self) -> FenceValue {
        FenceValue(self.last_signaled.get() + 1)
    }

    #[must_use]
    pub fn last_signaled(&self) -> FenceValue {
        FenceValue(self.last_signaled.get())
    }

    /// Enqueues a signal behind everything submitted so far.
    pub fn signal(&self) -> Result<FenceValue> {
        let value = self.last_signaled.get() + 1;
        self.backend.signal(value)?;
        self.last_signaled.set(value);
        trace!("signaled fence {}", value);
        Ok(FenceValue(value))
    }

    /// Refreshes the cached completed value. Never moves backwards.
    pub fn poll(&self) -> FenceValue {
        self.completed
            .set(self.completed.get().max(self.backend.completed_value()));
        FenceValue(self.completed.get())
    }

    #[must_use]
    pub fn completed(&self) -> FenceValue {
        FenceValue(self.completed.get())
    }

    pub fn is_complete(&self, value: FenceValue) -> bool {
        if value.0 > self.completed.get() {
            self.poll();
        }

        value.0 <= self.completed.get()
    }

    /// Blocks until the GPU reaches `value`.
    pub fn wait_until(&self, value: FenceValue) -> Result<()> {
        if self.is_complete(value) {
            return Ok(());
        }

        if !self.backend.wait_for_value(value.0, self.timeout)? {
            let completed = self.poll();
            error!(
                "timed out after {:?} waiting for fence {} (completed {})",
                self.timeout, value.0, completed.0
            );
            return Err(Error::DeviceLost {
                waited_for: value.0,
                completed: completed.0,
            });
        }

        self.poll();
        self.completed.set(self.completed.get().max(value.0));
        Ok(())
    }

    /// Signals and waits for everything submitted so far. This is the only
    /// point at which the command allocator and staging memory may be
    /// reused.
    pub fn signal_and_wait(&self) -> Result<FenceValue> {
        let value = self.signal()?;
        self.wait_until(value)?;
        Ok(value)
    }

    /// Waits for the queue to go idle.
    pub fn flush(&self) -> Result<()> {
        self.signal_and_wait().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{
        headless::{HeadlessBackend, HeadlessConfig, HeadlessProbe},
        AdapterId, FeatureLevel,
    };

    fn synchronizer(
        latency: Duration,
        timeout: Option<Duration>,
    ) -> (FrameSynchronizer, HeadlessProbe) {
        let backend = HeadlessBackend::new(HeadlessConfig {
            latency,
            ..HeadlessConfig::default()
        });
        backend
            .create_device(AdapterId(0), FeatureLevel::Level12_0)
            .unwrap();
        backend.create_command_objects().unwrap();
        let probe = backend.probe();
        let sync = FrameSynchronizer::new(Rc::new(backend), timeout).unwrap();
        (sync, probe)
    }

    #[test]
    fn completed_value_is_non_decreasing() {
        let (sync, probe) =
            synchronizer(Duration::from_micros(200), Some(Duration::from_secs(5)));

        let mut previous = sync.completed();
        for _ in 0..20 {
            let requested = sync.signal_and_wait().unwrap();
            let completed = sync.completed();
            assert!(completed >= requested);
            assert!(completed >= previous);
            assert!(probe.completed_value() >= requested.0);
            previous = completed;
        }

        assert_eq!(sync.last_signaled(), FenceValue(20));
        assert_eq!(sync.next_value(), FenceValue(21));
    }

    #[test]
    fn signals_complete_in_order() {
        let (sync, _probe) = synchronizer(Duration::ZERO, Some(Duration::from_secs(5)));

        let values = (0..5).map(|_| sync.signal().unwrap()).collect::<Vec<_>>();
        sync.wait_until(values[4]).unwrap();
        assert!(values.iter().all(|v| sync.is_complete(*v)));
        assert!(!sync.is_complete(sync.next_value()));
    }

    #[test]
    fn hang_is_reported_as_device_loss() {
        let (sync, probe) = synchronizer(Duration::ZERO, Some(Duration::from_millis(20)));
        sync.flush().unwrap();

        probe.set_hung(true);
        let error = sync.signal_and_wait().unwrap_err();
        assert!(matches!(
            error,
            Error::DeviceLost {
                waited_for: 2,
                completed: 1
            }
        ));
        assert!(!error.is_recoverable());
    }
}
