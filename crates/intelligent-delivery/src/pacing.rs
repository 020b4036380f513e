//! Send pacing: spreads the sends of one dispatch tick apart by a random gap.

use std::time::Duration;

use campaign_core::config::CampaignConfig;
use rand::Rng;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendPacer {
    min_gap: Duration,
    max_gap: Duration,
}

impl SendPacer {
    pub fn new(min_gap: Duration, max_gap: Duration) -> Self {
        if min_gap <= max_gap {
            Self { min_gap, max_gap }
        } else {
            Self {
                min_gap: max_gap,
                max_gap: min_gap,
            }
        }
    }

    pub fn from_config(config: &CampaignConfig) -> Self {
        Self::new(
            Duration::from_secs(config.spacing_min_secs),
            Duration::from_secs(config.spacing_max_secs),
        )
    }

    /// A pacer with no spacing at all.
    pub fn none() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO)
    }

    pub fn next_gap<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        if self.min_gap == self.max_gap {
            return self.min_gap;
        }
        let millis = rng.gen_range(self.min_gap.as_millis()..=self.max_gap.as_millis());
        Duration::from_millis(u64::try_from(millis).unwrap_or(u64::MAX))
    }

    /// Start delays for `count` sends: the first goes at once, each later one
    /// a random gap after its predecessor.
    pub fn start_offsets<R: Rng + ?Sized>(&self, count: usize, rng: &mut R) -> Vec<Duration> {
        let mut offsets = Vec::with_capacity(count);
        let mut at = Duration::ZERO;
        for i in 0..count {
            if i > 0 {
                at += self.next_gap(rng);
            }
            offsets.push(at);
        }
        offsets
    }
}
