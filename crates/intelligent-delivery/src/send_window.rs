//! Send-window scheduling. Snaps due times onto permitted hours of the day
//! with random minute jitter so sends never go out in lockstep.

use campaign_core::config::CampaignConfig;
use campaign_core::error::CampaignResult;
use campaign_core::schedule::SendTimePlanner;
use chrono::{DateTime, Duration, FixedOffset, Offset, Timelike, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Days searched before giving up on finding a slot. Any valid window set
/// yields a slot within two calendar days.
const SEARCH_DAYS: usize = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendWindow {
    /// Sorted, de-duplicated local hours strictly before the cutoff.
    hours: Vec<u32>,
    max_jitter_minutes: u32,
    utc_offset_minutes: i32,
}

impl SendWindow {
    pub fn from_config(config: &CampaignConfig) -> CampaignResult<Self> {
        config.validate()?;
        let mut hours: Vec<u32> = config
            .send_window_hours
            .iter()
            .copied()
            .filter(|h| *h < config.cutoff_hour)
            .collect();
        hours.sort_unstable();
        hours.dedup();
        Ok(Self {
            hours,
            max_jitter_minutes: config.max_jitter_minutes,
            utc_offset_minutes: config.utc_offset_minutes,
        })
    }

    pub fn hours(&self) -> &[u32] {
        &self.hours
    }

    fn offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.utc_offset_minutes * 60).unwrap_or_else(|| Utc.fix())
    }

    /// Whether `at` falls inside one of the window hours (local time).
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        let local = at.with_timezone(&self.offset());
        self.hours.contains(&local.hour())
    }

    /// First jittered slot at or after `earliest`.
    ///
    /// Walks the window hours of `earliest`'s local day; when none remains it
    /// rolls to the first window of the next day.
    pub fn next_slot<R: Rng + ?Sized>(&self, earliest: DateTime<Utc>, rng: &mut R) -> DateTime<Utc> {
        let offset = self.offset();
        let mut date = earliest.with_timezone(&offset).date_naive();

        for _ in 0..SEARCH_DAYS {
            for &hour in &self.hours {
                let Some(slot) = date
                    .and_hms_opt(hour, 0, 0)
                    .and_then(|naive| naive.and_local_timezone(offset).single())
                    .map(|local| local.with_timezone(&Utc))
                else {
                    continue;
                };

                let min_minute = if earliest <= slot {
                    0
                } else {
                    let secs = (earliest - slot).num_seconds();
                    // Round up so the slot never lands before `earliest`.
                    u32::try_from((secs + 59) / 60).unwrap_or(u32::MAX)
                };
                if min_minute > self.max_jitter_minutes {
                    continue;
                }

                let minute = rng.gen_range(min_minute..=self.max_jitter_minutes);
                return slot + Duration::minutes(i64::from(minute));
            }
            match date.succ_opt() {
                Some(next) => date = next,
                None => break,
            }
        }

        earliest
    }
}

impl SendTimePlanner for SendWindow {
    fn plan(&self, earliest: DateTime<Utc>) -> DateTime<Utc> {
        self.next_slot(earliest, &mut rand::thread_rng())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn window() -> SendWindow {
        SendWindow::from_config(&CampaignConfig::default()).unwrap()
    }

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[test]
    fn test_before_first_window_lands_in_first_window() {
        let mut rng = StdRng::seed_from_u64(7);
        let slot = window().next_slot(at(2026, 3, 2, 6, 30), &mut rng);
        assert_eq!(slot.date_naive(), at(2026, 3, 2, 0, 0).date_naive());
        assert_eq!(slot.hour(), 9);
    }

    #[test]
    fn test_inside_window_never_goes_backwards() {
        let mut rng = StdRng::seed_from_u64(11);
        let earliest = at(2026, 3, 2, 10, 45);
        for _ in 0..200 {
            let slot = window().next_slot(earliest, &mut rng);
            assert!(slot >= earliest);
            assert!(window().contains(slot));
            assert!(slot.hour() == 10 || slot.hour() == 11);
        }
    }

    #[test]
    fn test_gap_hours_skip_to_next_window() {
        let mut rng = StdRng::seed_from_u64(3);
        let slot = window().next_slot(at(2026, 3, 2, 12, 10), &mut rng);
        assert_eq!(slot.hour(), 14);
    }

    #[test]
    fn test_after_cutoff_rolls_to_next_day() {
        let mut rng = StdRng::seed_from_u64(5);
        let slot = window().next_slot(at(2026, 3, 2, 17, 5), &mut rng);
        assert_eq!(slot.date_naive(), at(2026, 3, 3, 0, 0).date_naive());
        assert_eq!(slot.hour(), 9);
    }

    #[test]
    fn test_cutoff_excludes_late_windows() {
        let config = CampaignConfig {
            send_window_hours: vec![9, 16, 18],
            cutoff_hour: 17,
            ..CampaignConfig::default()
        };
        let window = SendWindow::from_config(&config).unwrap();
        assert_eq!(window.hours(), &[9, 16]);
        let mut rng = StdRng::seed_from_u64(1);
        let slot = window.next_slot(at(2026, 3, 2, 16, 59), &mut rng);
        assert_eq!(slot.hour(), 9);
        assert_eq!(slot.date_naive(), at(2026, 3, 3, 0, 0).date_naive());
    }

    #[test]
    fn test_slots_always_in_window_and_not_early() {
        let mut rng = StdRng::seed_from_u64(42);
        let base = at(2026, 1, 1, 0, 0);
        for i in 0..2_000i64 {
            let earliest = base + Duration::minutes(i * 37);
            let slot = window().next_slot(earliest, &mut rng);
            assert!(slot >= earliest, "slot {slot} before {earliest}");
            assert!(window().contains(slot), "slot {slot} outside window");
            assert!(slot - earliest < Duration::days(2));
        }
    }

    #[test]
    fn test_utc_offset_is_respected() {
        let config = CampaignConfig {
            utc_offset_minutes: 120,
            ..CampaignConfig::default()
        };
        let window = SendWindow::from_config(&config).unwrap();
        let mut rng = StdRng::seed_from_u64(9);
        // 05:00 UTC is 07:00 local; first local window is 09:00 = 07:00 UTC.
        let slot = window.next_slot(at(2026, 3, 2, 5, 0), &mut rng);
        assert_eq!(slot.hour(), 7);
        assert!(window.contains(slot));
    }

    #[test]
    fn test_zero_jitter_is_on_the_hour() {
        let config = CampaignConfig {
            max_jitter_minutes: 0,
            ..CampaignConfig::default()
        };
        let window = SendWindow::from_config(&config).unwrap();
        let mut rng = StdRng::seed_from_u64(2);
        let slot = window.next_slot(at(2026, 3, 2, 9, 0), &mut rng);
        assert_eq!(slot, at(2026, 3, 2, 9, 0));
        let slot = window.next_slot(at(2026, 3, 2, 9, 1), &mut rng);
        assert_eq!(slot, at(2026, 3, 2, 10, 0));
    }
}
