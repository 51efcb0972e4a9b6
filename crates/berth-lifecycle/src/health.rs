use std::collections::HashMap;

use crate::{BotId, status::HealthStatus};

/// Per-bot consecutive probe failure counters.
///
/// A bot only flips to `Unhealthy` after `threshold` failures in a row; any
/// success resets its streak and restores `Healthy` immediately.
#[derive(Debug)]
pub struct FailureStreaks {
    threshold: u32,
    streaks: HashMap<BotId, u32>,
}

impl FailureStreaks {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            streaks: HashMap::new(),
        }
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn streak(&self, bot: &BotId) -> u32 {
        self.streaks.get(bot).copied().unwrap_or(0)
    }

    /// Records one probe result and returns the new health when it differs
    /// from `current`.
    pub fn record(&mut self, bot: BotId, ok: bool, current: HealthStatus) -> Option<HealthStatus> {
        if ok {
            self.streaks.remove(&bot);
            return (current != HealthStatus::Healthy).then_some(HealthStatus::Healthy);
        }

        let streak = self.streaks.entry(bot).or_insert(0);
        *streak = streak.saturating_add(1);
        if *streak >= self.threshold && current != HealthStatus::Unhealthy {
            return Some(HealthStatus::Unhealthy);
        }
        None
    }

    /// Drops counters for bots that are no longer probed.
    pub fn retain(&mut self, mut keep: impl FnMut(&BotId) -> bool) {
        self.streaks.retain(|id, _| keep(id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flips_only_on_nth_consecutive_failure() {
        let bot = BotId::new();
        let mut s = FailureStreaks::new(3);
        let mut health = HealthStatus::Healthy;

        for _ in 0..2 {
            assert_eq!(s.record(bot, false, health), None);
        }
        let flipped = s.record(bot, false, health);
        assert_eq!(flipped, Some(HealthStatus::Unhealthy));
        health = flipped.unwrap();

        // Further failures do not re-report.
        assert_eq!(s.record(bot, false, health), None);
        assert_eq!(s.streak(&bot), 4);
    }

    #[test]
    fn success_resets_and_restores() {
        let bot = BotId::new();
        let mut s = FailureStreaks::new(2);
        s.record(bot, false, HealthStatus::Healthy);
        assert_eq!(s.record(bot, true, HealthStatus::Healthy), None);
        assert_eq!(s.streak(&bot), 0);

        // The streak starts over after a success.
        assert_eq!(s.record(bot, false, HealthStatus::Healthy), None);

        assert_eq!(
            s.record(bot, true, HealthStatus::Unhealthy),
            Some(HealthStatus::Healthy)
        );
    }

    #[test]
    fn zero_threshold_is_clamped() {
        let mut s = FailureStreaks::new(0);
        assert_eq!(s.threshold(), 1);
        assert_eq!(
            s.record(BotId::new(), false, HealthStatus::Healthy),
            Some(HealthStatus::Unhealthy)
        );
    }

    #[test]
    fn retain_prunes_counters() {
        let (a, b) = (BotId::new(), BotId::new());
        let mut s = FailureStreaks::new(5);
        s.record(a, false, HealthStatus::Healthy);
        s.record(b, false, HealthStatus::Healthy);
        s.retain(|id| *id == a);
        assert_eq!(s.streak(&a), 1);
        assert_eq!(s.streak(&b), 0);
    }
}
