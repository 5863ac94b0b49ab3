//! Capped exponential reconnect backoff.

use std::time::Duration;

use rand::Rng;

/// Doubles from `base` up to `ceiling`; the attempt after the ceiling starts
/// over at `base`.
#[derive(Clone, Debug)]
pub struct Backoff {
    base: Duration,
    ceiling: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(base: Duration, ceiling: Duration) -> Self {
        let base = base.min(ceiling);
        Self {
            base,
            ceiling,
            current: base,
        }
    }

    /// `recon_default`/`recon_max` in milliseconds. With `randomize` the
    /// base is drawn once from `[recon_default, recon_max]` so minions
    /// restarted together do not reconnect in lockstep.
    pub fn from_recon<R: Rng + ?Sized>(
        recon_default: u64,
        recon_max: u64,
        randomize: bool,
        rng: &mut R,
    ) -> Self {
        let base = if randomize && recon_max > recon_default {
            rng.random_range(recon_default..=recon_max)
        } else {
            recon_default
        };
        Self::new(
            Duration::from_millis(base),
            Duration::from_millis(recon_max.max(recon_default)),
        )
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    /// Delay for this attempt; advances the sequence.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = if delay >= self.ceiling {
            self.base
        } else {
            (delay * 2).min(self.ceiling)
        };
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.base;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn doubles_to_ceiling_then_resets() {
        let mut backoff = Backoff::new(ms(1000), ms(10000));
        let seq: Vec<Duration> = (0..7).map(|_| backoff.next_delay()).collect();
        assert_eq!(
            seq,
            vec![ms(1000), ms(2000), ms(4000), ms(8000), ms(10000), ms(1000), ms(2000)]
        );
    }

    #[test]
    fn non_decreasing_until_ceiling() {
        let mut backoff = Backoff::new(ms(300), ms(5000));
        let mut prev = backoff.next_delay();
        loop {
            let next = backoff.next_delay();
            if prev == ms(5000) {
                assert_eq!(next, ms(300));
                break;
            }
            assert_eq!(next, (prev * 2).min(ms(5000)));
            prev = next;
        }
    }

    #[test]
    fn reset_returns_to_base() {
        let mut backoff = Backoff::new(ms(100), ms(1000));
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), ms(100));
    }

    #[test]
    fn randomized_base_is_fixed_once() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut backoff = Backoff::from_recon(1000, 10000, true, &mut rng);
        let base = backoff.base();
        assert!(base >= ms(1000) && base <= ms(10000));
        assert_eq!(backoff.next_delay(), base);
        backoff.reset();
        assert_eq!(backoff.next_delay(), base);

        let plain = Backoff::from_recon(1000, 10000, false, &mut rng);
        assert_eq!(plain.base(), ms(1000));
    }
}
