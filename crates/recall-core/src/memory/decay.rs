//! ============================================================================
//! Decay Model - Profile freshness and retention ratios
//! ============================================================================
//! decay     = exp(-λ · Δdays), Δdays measured since the last profile update
//! retention = min(recent / max(total, 1), 1), rounded to 3 decimals
//! ============================================================================

use crate::types::UserProfile;

/// Default decay constant, per day
pub const DECAY_LAMBDA: f64 = 0.1;

const SECONDS_PER_DAY: f64 = 86_400.0;

/// Pure freshness computations over profiles and entries
#[derive(Debug, Clone, Copy)]
pub struct DecayModel {
    pub lambda: f64,
}

impl Default for DecayModel {
    fn default() -> Self {
        Self { lambda: DECAY_LAMBDA }
    }
}

impl DecayModel {
    pub fn new(lambda: f64) -> Self {
        Self { lambda }
    }

    /// exp(-λ · days elapsed from `since` to `now`).
    /// A `since` in the future yields a value above 1.
    pub fn decay_between(&self, since: i64, now: i64) -> f64 {
        let days = (now - since) as f64 / SECONDS_PER_DAY;
        (-self.lambda * days).exp()
    }

    pub fn decay(&self, profile: &UserProfile, now: i64) -> f64 {
        self.decay_between(profile.last_update, now)
    }

    pub fn retention(&self, recent: u64, total: u64) -> f64 {
        retention(recent, total)
    }
}

/// Share of a user's interactions that fall inside the recent window
pub fn retention(recent: u64, total: u64) -> f64 {
    let ratio = (recent as f64 / total.max(1) as f64).min(1.0);
    (ratio * 1000.0).round() / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY: i64 = 86_400;

    #[test]
    fn test_decay_at_zero_is_one() {
        let model = DecayModel::default();
        let profile = UserProfile::empty("u1", 1_000);
        assert_eq!(model.decay(&profile, 1_000), 1.0);
    }

    #[test]
    fn test_decay_is_monotonic() {
        let model = DecayModel::default();
        let mut last = f64::INFINITY;
        for days in 0..30 {
            let value = model.decay_between(0, days * DAY);
            assert!(value < last);
            assert!(value > 0.0);
            last = value;
        }
    }

    #[test]
    fn test_decay_known_value() {
        let model = DecayModel::default();
        let ten_days = model.decay_between(0, 10 * DAY);
        assert!((ten_days - (-1.0f64).exp()).abs() < 1e-12);
    }

    #[test]
    fn test_future_update_exceeds_one() {
        assert!(DecayModel::default().decay_between(DAY, 0) > 1.0);
    }

    #[test]
    fn test_retention() {
        assert_eq!(retention(0, 0), 0.0);
        assert_eq!(retention(5, 0), 1.0);
        assert_eq!(retention(1, 3), 0.333);
        assert_eq!(retention(2, 3), 0.667);
        assert_eq!(retention(4, 4), 1.0);
        assert_eq!(retention(9, 4), 1.0);
    }
}
