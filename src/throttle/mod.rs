//! Bandwidth, latency and loss simulation applied to flow delivery timing.
//!
//! This is a cooperative simulation for local traffic. Bytes on the real
//! connection are not touched; only the moment a flow's status change is
//! published is delayed, and simulated loss is a modeled outcome.

use crate::error::{ConfigError, Result};
use arc_swap::ArcSwap;
use dashmap::DashMap;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tokio::time::Duration;

pub mod bucket;

pub use bucket::TokenBucket;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ThrottleProfile {
    /// Zero means unlimited
    pub download_bytes_per_second: u64,
    /// Zero means unlimited
    pub upload_bytes_per_second: u64,
    pub latency_ms: u64,
    /// 0-100
    pub packet_loss_percent: f64,
}

impl ThrottleProfile {
    pub fn is_disabled(&self) -> bool {
        self.download_bytes_per_second == 0
            && self.upload_bytes_per_second == 0
            && self.latency_ms == 0
            && self.packet_loss_percent <= 0.0
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=100.0).contains(&self.packet_loss_percent) {
            return Err(ConfigError::Validation(format!(
                "packetLossPercent must be within 0-100, got {}",
                self.packet_loss_percent
            ))
            .into());
        }
        Ok(())
    }

    /// Most restrictive value per field: lowest bandwidth, highest latency and loss.
    pub fn merge(&self, other: &ThrottleProfile) -> ThrottleProfile {
        ThrottleProfile {
            download_bytes_per_second: min_rate(
                self.download_bytes_per_second,
                other.download_bytes_per_second,
            ),
            upload_bytes_per_second: min_rate(
                self.upload_bytes_per_second,
                other.upload_bytes_per_second,
            ),
            latency_ms: self.latency_ms.max(other.latency_ms),
            packet_loss_percent: self.packet_loss_percent.max(other.packet_loss_percent),
        }
    }

    pub fn latency(&self) -> Duration {
        Duration::from_millis(self.latency_ms)
    }

    pub fn rate(&self, direction: Direction) -> u64 {
        match direction {
            Direction::Upload => self.upload_bytes_per_second,
            Direction::Download => self.download_bytes_per_second,
        }
    }
}

fn min_rate(a: u64, b: u64) -> u64 {
    match (a, b) {
        (0, x) | (x, 0) => x,
        (a, b) => a.min(b),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Upload,
    Download,
}

/// Session-wide pacing state.
///
/// Buckets are shared per direction and rate: every flow throttled to the same
/// rate draws from the same bucket. Changing the global profile resets them.
pub struct ThrottleSimulator {
    profile: ArcSwap<ThrottleProfile>,
    buckets: DashMap<(Direction, u64), Mutex<TokenBucket>>,
    rng: Mutex<StdRng>,
}

impl Default for ThrottleSimulator {
    fn default() -> Self {
        Self::new()
    }
}

impl ThrottleSimulator {
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    /// Deterministic loss rolls, for reproducible runs.
    pub fn with_seed(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        Self {
            profile: ArcSwap::from_pointee(ThrottleProfile::default()),
            buckets: DashMap::new(),
            rng: Mutex::new(rng),
        }
    }

    pub fn set_profile(&self, profile: ThrottleProfile) -> Result<()> {
        profile.validate()?;
        tracing::info!(
            download = profile.download_bytes_per_second,
            upload = profile.upload_bytes_per_second,
            latency_ms = profile.latency_ms,
            loss = profile.packet_loss_percent,
            "Throttle profile updated"
        );
        self.profile.store(Arc::new(profile));
        self.buckets.clear();
        Ok(())
    }

    pub fn profile(&self) -> ThrottleProfile {
        self.profile.load().as_ref().clone()
    }

    /// Global profile combined with throttles matched by rules.
    pub fn effective(&self, rule_profile: Option<&ThrottleProfile>) -> ThrottleProfile {
        let global = self.profile.load();
        match rule_profile {
            Some(p) => global.merge(p),
            None => global.as_ref().clone(),
        }
    }

    /// How long delivery of `bytes` in `direction` must be held back, latency included.
    pub fn delay_for(&self, direction: Direction, bytes: u64, profile: &ThrottleProfile) -> Duration {
        let rate = profile.rate(direction);
        let pacing = if rate == 0 {
            Duration::ZERO
        } else {
            let bucket = self
                .buckets
                .entry((direction, rate))
                .or_insert_with(|| Mutex::new(TokenBucket::new(rate)));
            let mut bucket = bucket.lock().unwrap_or_else(|e| e.into_inner());
            bucket.reserve(bytes)
        };
        pacing + profile.latency()
    }

    /// Rolls simulated packet loss for one flow.
    pub fn roll_loss(&self, profile: &ThrottleProfile) -> bool {
        let percent = profile.packet_loss_percent;
        if percent <= 0.0 {
            return false;
        }
        if percent >= 100.0 {
            return true;
        }
        self.rng
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .gen_bool(percent / 100.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_picks_most_restrictive() {
        let a = ThrottleProfile {
            download_bytes_per_second: 1000,
            upload_bytes_per_second: 0,
            latency_ms: 50,
            packet_loss_percent: 1.0,
        };
        let b = ThrottleProfile {
            download_bytes_per_second: 500,
            upload_bytes_per_second: 2000,
            latency_ms: 10,
            packet_loss_percent: 5.0,
        };

        let merged = a.merge(&b);
        assert_eq!(merged.download_bytes_per_second, 500);
        assert_eq!(merged.upload_bytes_per_second, 2000);
        assert_eq!(merged.latency_ms, 50);
        assert_eq!(merged.packet_loss_percent, 5.0);
    }

    #[test]
    fn test_all_zero_is_disabled() {
        assert!(ThrottleProfile::default().is_disabled());
        let simulator = ThrottleSimulator::new();
        let profile = ThrottleProfile::default();
        assert_eq!(
            simulator.delay_for(Direction::Download, 1_000_000, &profile),
            Duration::ZERO
        );
        assert!(!simulator.roll_loss(&profile));
    }

    #[test]
    fn test_rejects_out_of_range_loss() {
        let simulator = ThrottleSimulator::new();
        let result = simulator.set_profile(ThrottleProfile {
            packet_loss_percent: 120.0,
            ..Default::default()
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_full_loss_is_deterministic() {
        let simulator = ThrottleSimulator::new();
        let profile = ThrottleProfile {
            packet_loss_percent: 100.0,
            ..Default::default()
        };
        assert!((0..50).all(|_| simulator.roll_loss(&profile)));
    }

    #[test]
    fn test_seeded_loss_is_reproducible() {
        let profile = ThrottleProfile {
            packet_loss_percent: 30.0,
            ..Default::default()
        };
        let a = ThrottleSimulator::with_seed(7);
        let b = ThrottleSimulator::with_seed(7);
        let rolls_a: Vec<bool> = (0..20).map(|_| a.roll_loss(&profile)).collect();
        let rolls_b: Vec<bool> = (0..20).map(|_| b.roll_loss(&profile)).collect();
        assert_eq!(rolls_a, rolls_b);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shared_bucket_paces_consecutive_flows() {
        let simulator = ThrottleSimulator::new();
        let profile = ThrottleProfile {
            download_bytes_per_second: 1000,
            latency_ms: 20,
            ..Default::default()
        };

        let first = simulator.delay_for(Direction::Download, 1000, &profile);
        let second = simulator.delay_for(Direction::Download, 1000, &profile);

        assert_eq!(first, Duration::from_millis(20));
        assert_eq!(second, Duration::from_millis(1020));
    }
}
