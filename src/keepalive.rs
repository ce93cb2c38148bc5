//! Periodic keepalive probes that hold firewall/NAT state open.

use std::time::Duration;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};

/// Fires every `interval` once enabled; a disabled scheduler never fires.
pub struct Keepalive {
    timer: Option<Interval>,
}

impl Keepalive {
    /// First tick lands one full interval after creation.
    pub fn new(interval: Duration) -> Self {
        let mut timer = time::interval_at(Instant::now() + interval, interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { timer: Some(timer) }
    }

    pub fn disabled() -> Self {
        Self { timer: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.timer.is_some()
    }

    /// Wait for the next fire. Cancel safe.
    pub async fn tick(&mut self) {
        match self.timer.as_mut() {
            Some(timer) => {
                timer.tick().await;
            }
            None => std::future::pending::<()>().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_fires_once_per_interval() {
        let period = Duration::from_secs(1);
        let mut keepalive = Keepalive::new(period);
        let start = Instant::now();

        for k in 1..=5u32 {
            keepalive.tick().await;
            assert_eq!(start.elapsed(), period * k);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_exact_count_in_window() {
        let period = Duration::from_millis(250);
        let mut keepalive = Keepalive::new(period);
        let window = period * 4 + Duration::from_millis(10);

        let mut fired = 0;
        let deadline = time::sleep(window);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => break,
                _ = keepalive.tick() => fired += 1,
            }
        }
        assert_eq!(fired, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_never_fires() {
        let mut keepalive = Keepalive::disabled();
        assert!(!keepalive.is_enabled());
        let fired = time::timeout(Duration::from_secs(3600), keepalive.tick()).await;
        assert!(fired.is_err());
    }
}
