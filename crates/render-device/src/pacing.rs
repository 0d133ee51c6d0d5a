//! Fixed-rate frame pacing.
//!
//! At each frame boundary the pacer looks at how long it has been since the
//! previous boundary. Frames that finished well ahead of the target interval
//! are held back with short sleeps until the interval has elapsed; frames that
//! are close to or over the target are let through immediately. Sleeping in
//! small steps instead of one long sleep keeps oversleep to a minimum.

use std::{
    cell::Cell,
    rc::Rc,
    time::{Duration, Instant},
};

/// A monotonic time source.
pub trait Clock {
    /// Time since an arbitrary, fixed origin.
    fn now(&self) -> Duration;

    fn sleep(&self, duration: Duration);
}

pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// A clock that only moves when told to. Sleeping advances it by exactly the
/// requested amount. Clones share the same time.
#[derive(Clone, Debug, Default)]
pub struct ManualClock {
    now: Rc<Cell<Duration>>,
}

impl ManualClock {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, duration: Duration) {
        self.now.set(self.now.get() + duration);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        self.now.get()
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PacingConfig {
    /// The frame interval to hold to.
    pub target: Duration,
    /// Frames shorter than this are held back until `target` has elapsed.
    /// Slightly shorter than `target`, so that frames that are only a little
    /// early are not delayed.
    pub threshold: Duration,
    /// The length of each sleep while holding a frame back.
    pub step: Duration,
}

impl PacingConfig {
    /// 60 frames per second, holding back any frame shorter than 1/65 s.
    pub const SIXTY_HZ: Self = Self {
        target: Duration::from_micros(16_666),
        threshold: Duration::from_micros(15_384),
        step: Duration::from_micros(1),
    };
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self::SIXTY_HZ
    }
}

pub struct FramePacer {
    config: PacingConfig,
    clock: Box<dyn Clock>,
    reference: Duration,
}

impl FramePacer {
    pub fn new(config: PacingConfig, clock: Box<dyn Clock>) -> Self {
        let reference = clock.now();
        Self {
            config,
            clock,
            reference,
        }
    }

    #[must_use]
    pub fn config(&self) -> PacingConfig {
        self.config
    }

    /// Marks a frame boundary, waiting first if the frame finished too early.
    /// Returns the length of the frame that just ended.
    pub fn pace(&mut self) -> Duration {
        let elapsed = self.clock.now().saturating_sub(self.reference);

        if elapsed < self.config.threshold {
            while self.clock.now().saturating_sub(self.reference) < self.config.target {
                self.clock.sleep(self.config.step);
            }
        }

        let now = self.clock.now();
        let interval = now.saturating_sub(self.reference);
        self.reference = now;
        interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pacer() -> (FramePacer, ManualClock) {
        let clock = ManualClock::new();
        let pacer = FramePacer::new(PacingConfig::default(), Box::new(clock.clone()));
        (pacer, clock)
    }

    #[test]
    fn idle_frames_converge_to_sixty_hz() {
        let (mut pacer, _clock) = pacer();

        let total = (0..600).map(|_| pacer.pace()).sum::<Duration>();
        let average = total.as_secs_f64() / 600.0;
        let target = 1.0 / 60.0;

        assert!(
            (average - target).abs() / target < 0.05,
            "average frame time {average}"
        );
    }

    #[test]
    fn near_target_frames_are_not_delayed() {
        let (mut pacer, clock) = pacer();

        clock.advance(Duration::from_micros(16_000));
        assert_eq!(pacer.pace(), Duration::from_micros(16_000));
    }

    #[test]
    fn short_frames_are_held_to_the_target() {
        let (mut pacer, clock) = pacer();

        clock.advance(Duration::from_millis(4));
        assert_eq!(pacer.pace(), PacingConfig::SIXTY_HZ.target);
    }

    #[test]
    fn long_frames_pass_through() {
        let (mut pacer, clock) = pacer();

        clock.advance(Duration::from_millis(40));
        assert_eq!(pacer.pace(), Duration::from_millis(40));
        clock.advance(Duration::from_millis(1));
        assert_eq!(pacer.pace(), PacingConfig::SIXTY_HZ.target);
    }
}
