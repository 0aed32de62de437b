use std::time::Duration;

use rand::Rng;

/// How long the engine waits before reopening a lost connection.
///
/// `failures` counts the consecutive closes since the last successful open.
/// The delay grows by `factor` per failure up to `ceiling`, then `jitter`
/// shaves off a random share of it. The defaults (`factor == 1.0`,
/// `jitter == 0.0`) wait exactly `initial` every time.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct ReconnectPolicy {
    pub(crate) initial: Duration,
    pub(crate) ceiling: Duration,
    pub(crate) factor: f64,
    pub(crate) jitter: f64,
}

impl ReconnectPolicy {
    pub(crate) fn check(&self) -> Result<(), String> {
        if self.initial.is_zero() {
            return Err("reconnect_initial_delay must be > 0".to_string());
        }
        if self.ceiling < self.initial {
            return Err("reconnect_max_delay must be >= reconnect_initial_delay".to_string());
        }
        if !self.factor.is_finite() || self.factor < 1.0 {
            return Err("reconnect_backoff_factor must be a finite value >= 1.0".to_string());
        }
        if !self.jitter.is_finite() || !(0.0..=1.0).contains(&self.jitter) {
            return Err("reconnect_jitter must be within 0.0..=1.0".to_string());
        }
        Ok(())
    }

    pub(crate) fn delay(&self, failures: u32) -> Duration {
        let grown = self.initial.as_secs_f64() * self.factor.powi(failures.min(64) as i32);
        let capped = grown.min(self.ceiling.as_secs_f64());
        if self.jitter == 0.0 {
            return Duration::from_secs_f64(capped);
        }

        let shave: f64 = rand::rng().random_range(0.0..=self.jitter);
        Duration::from_secs_f64(capped * (1.0 - shave))
    }
}
