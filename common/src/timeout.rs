use std::{thread, time::{Duration, Instant}};

pub struct Timeout {
    instant: Instant,
    duration: Duration,
}

impl Timeout {
    #[inline]
    pub fn new(duration: Duration) -> Self {
        Self {
            instant: Instant::now(),
            duration,
        }
    }

    #[inline]
    pub fn from_micros(micros: u64) -> Self {
        Self::new(Duration::from_micros(micros))
    }

    #[inline]
    pub fn from_millis(millis: u64) -> Self {
        Self::new(Duration::from_millis(millis))
    }

    #[inline]
    pub fn from_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    #[inline]
    pub fn expired(&self) -> bool {
        self.instant.elapsed() >= self.duration
    }

    #[inline]
    pub fn remaining(&self) -> Duration {
        self.duration.saturating_sub(self.instant.elapsed())
    }

    /// Yield once, or fail if the deadline has passed.
    #[inline]
    pub fn run(&self) -> Result<(), ()> {
        if !self.expired() {
            // Sleeps in Redox are only evaluated on PIT ticks (a few ms), which is not
            // short enough for a reasonably responsive timeout. However, the clock is
            // highly accurate. So, we yield instead of sleep to reduce latency.
            thread::yield_now();
            Ok(())
        } else {
            Err(())
        }
    }

    /// Busy-wait variant of [`Timeout::run`], for waits of a few microseconds.
    #[inline]
    pub fn spin(&self) -> Result<(), ()> {
        if !self.expired() {
            std::hint::spin_loop();
            Ok(())
        } else {
            Err(())
        }
    }

    /// Block until the whole duration has elapsed. Never returns early, even if a sleep is cut
    /// short.
    pub fn wait(self) {
        loop {
            let remaining = self.remaining();
            if remaining.is_zero() {
                break;
            }
            thread::sleep(remaining);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn wait_is_never_short() {
        let start = Instant::now();
        Timeout::from_millis(3).wait();
        assert!(start.elapsed() >= Duration::from_millis(3));
    }

    #[test]
    fn run_fails_after_deadline() {
        let timeout = Timeout::from_micros(0);
        assert!(timeout.expired());
        assert_eq!(timeout.run(), Err(()));
        assert_eq!(timeout.spin(), Err(()));
        assert!(Timeout::from_secs(5).run().is_ok());
    }
}
