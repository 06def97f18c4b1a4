// Copyright (C) 2025  Tom Waddington
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published
// by the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Playback configuration

use rand::Rng;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ValidationError;
use crate::gating::GatingConfig;

/// What happens when the input actuator fails on an ungated action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchPolicy {
    Continue,
    Abort,
}

impl FromStr for DispatchPolicy {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "continue" => Ok(DispatchPolicy::Continue),
            "abort" => Ok(DispatchPolicy::Abort),
            other => Err(ValidationError::Unknown {
                kind: "dispatch policy",
                name: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PlaybackConfig {
    // Playback rate; 2.0 halves every delay
    pub speed: f64,
    // Jitter as a fraction (0.0 to 1.0) of each delay
    pub jitter: f64,
    pub dispatch_policy: DispatchPolicy,
    // How often RepeatLast may rewind for the same gated action
    pub max_fallback_repeats: u32,
    // How deeply decision branches may nest
    pub max_splice_depth: usize,
    pub event_capacity: usize,
    pub gating: GatingConfig,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            speed: 1.0,
            jitter: 0.0,
            dispatch_policy: DispatchPolicy::Continue,
            max_fallback_repeats: 3,
            max_splice_depth: 4,
            event_capacity: 256,
            gating: GatingConfig::default(),
        }
    }
}

impl PlaybackConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !self.speed.is_finite() || self.speed <= 0.0 {
            return Err(ValidationError::OutOfRange {
                field: "speed",
                min: f64::MIN_POSITIVE,
                max: f64::MAX,
                value: self.speed,
            });
        }
        if !self.jitter.is_finite() || !(0.0..=1.0).contains(&self.jitter) {
            return Err(ValidationError::OutOfRange {
                field: "jitter",
                min: 0.0,
                max: 1.0,
                value: self.jitter,
            });
        }
        if self.event_capacity == 0 {
            return Err(ValidationError::Empty {
                field: "event capacity",
            });
        }
        self.gating.validate()
    }

    /// Effective wait before an action recorded with `delay_ms`.
    pub fn scaled_delay(&self, delay_ms: u64) -> Duration {
        let base_ms = (delay_ms as f64 / self.speed) as u64;
        let jitter_ms = (base_ms as f64 * self.jitter) as u64;

        if jitter_ms > 0 {
            let mut rng = rand::rng();
            let variation = rng.random_range(0..=jitter_ms.saturating_mul(2));
            let delay = base_ms.saturating_add(variation).saturating_sub(jitter_ms);
            Duration::from_millis(delay)
        } else {
            Duration::from_millis(base_ms)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_speed_scales_delay() {
        let config = PlaybackConfig {
            speed: 2.0,
            ..Default::default()
        };
        assert_eq!(config.scaled_delay(300), Duration::from_millis(150));
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let config = PlaybackConfig {
            jitter: 0.1,
            ..Default::default()
        };
        for _ in 0..100 {
            let d = config.scaled_delay(1000).as_millis();
            assert!((900..=1100).contains(&d), "delay {} out of bounds", d);
        }
    }

    #[test]
    fn test_huge_delay_with_full_jitter_saturates() {
        let config = PlaybackConfig {
            speed: 0.5,
            jitter: 1.0,
            ..Default::default()
        };
        let d = config.scaled_delay(i64::MAX as u64);
        assert!(d <= Duration::from_millis(u64::MAX));
    }

    #[test]
    fn test_validation() {
        assert!(PlaybackConfig::default().validate().is_ok());
        let bad_speed = PlaybackConfig {
            speed: 0.0,
            ..Default::default()
        };
        assert!(bad_speed.validate().is_err());
        let bad_jitter = PlaybackConfig {
            jitter: 1.5,
            ..Default::default()
        };
        assert!(bad_jitter.validate().is_err());
    }
}
