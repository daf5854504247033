use ferry_config::{ForwardSection, IdlePolicy};
use std::time::Duration;

/// What a polling loop does after a poll that found nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleBackoff {
    /// Busy-poll with a spin hint. Lowest latency, burns the core.
    Spin,
    Yield,
    Sleep(Duration),
    /// Sleep `min`, doubling up to `max` while idle; back to `min` on traffic.
    Exponential { min: Duration, max: Duration },
}

impl Default for IdleBackoff {
    fn default() -> Self {
        IdleBackoff::Sleep(Duration::from_micros(5))
    }
}

impl From<&ForwardSection> for IdleBackoff {
    fn from(cfg: &ForwardSection) -> Self {
        let sleep = Duration::from_micros(cfg.idle_sleep_us);
        match cfg.idle {
            IdlePolicy::Spin => IdleBackoff::Spin,
            IdlePolicy::Yield => IdleBackoff::Yield,
            IdlePolicy::Sleep => IdleBackoff::Sleep(sleep),
            IdlePolicy::Exponential => IdleBackoff::Exponential {
                min: sleep,
                max: Duration::from_micros(cfg.max_idle_sleep_us).max(sleep),
            },
        }
    }
}

/// Running state of an [`IdleBackoff`].
#[derive(Debug)]
pub struct Backoff {
    policy: IdleBackoff,
    current: Duration,
}

impl Backoff {
    pub fn new(policy: IdleBackoff) -> Self {
        let current = match policy {
            IdleBackoff::Exponential { min, .. } => min,
            _ => Duration::ZERO,
        };
        Self { policy, current }
    }

    pub fn policy(&self) -> IdleBackoff {
        self.policy
    }

    /// The sleep the next idle poll will take, advancing the exponential
    /// state. `None` for spin and yield.
    pub fn next_sleep(&mut self) -> Option<Duration> {
        match self.policy {
            IdleBackoff::Spin | IdleBackoff::Yield => None,
            IdleBackoff::Sleep(d) => Some(d),
            IdleBackoff::Exponential { max, .. } => {
                let d = self.current;
                self.current = (self.current * 2).min(max);
                Some(d)
            }
        }
    }

    /// Called after an empty poll.
    pub fn idle(&mut self) {
        match self.policy {
            IdleBackoff::Spin => std::hint::spin_loop(),
            IdleBackoff::Yield => std::thread::yield_now(),
            _ => {
                if let Some(d) = self.next_sleep() {
                    std::thread::sleep(d);
                }
            }
        }
    }

    /// Called after a poll that moved items.
    pub fn reset(&mut self) {
        if let IdleBackoff::Exponential { min, .. } = self.policy {
            self.current = min;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_doubles_up_to_max_and_resets() {
        let us = Duration::from_micros;
        let mut b = Backoff::new(IdleBackoff::Exponential { min: us(1), max: us(6) });
        let seq: Vec<_> = (0..5).map(|_| b.next_sleep().unwrap()).collect();
        assert_eq!(seq, vec![us(1), us(2), us(4), us(6), us(6)]);
        b.reset();
        assert_eq!(b.next_sleep(), Some(us(1)));
    }

    #[test]
    fn fixed_policies() {
        assert_eq!(Backoff::new(IdleBackoff::Spin).next_sleep(), None);
        assert_eq!(Backoff::new(IdleBackoff::Yield).next_sleep(), None);
        let mut sleep = Backoff::new(IdleBackoff::default());
        assert_eq!(sleep.next_sleep(), Some(Duration::from_micros(5)));
        assert_eq!(sleep.next_sleep(), Some(Duration::from_micros(5)));
    }

    #[test]
    fn built_from_forward_section() {
        let mut cfg = ForwardSection::default();
        assert_eq!(IdleBackoff::from(&cfg), IdleBackoff::Sleep(Duration::from_micros(5)));

        cfg.idle = IdlePolicy::Exponential;
        cfg.idle_sleep_us = 10;
        cfg.max_idle_sleep_us = 80;
        assert_eq!(
            IdleBackoff::from(&cfg),
            IdleBackoff::Exponential {
                min: Duration::from_micros(10),
                max: Duration::from_micros(80),
            }
        );
    }
}
