use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::{Result, TrackError};

pub const DEFAULT_COLLECT_URL: &str = "/api/analytics/collect/";
pub const DEFAULT_CONSENT_COOKIE: &str = "cookie_consent_marketing";

pub const ENV_COLLECT_URL: &str = "LLTRACK_COLLECT_URL";
pub const ENV_BATCH_SIZE: &str = "LLTRACK_BATCH_SIZE";
pub const ENV_FLUSH_DELAY_MS: &str = "LLTRACK_FLUSH_DELAY_MS";

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TrackerConfig {
    /// Collect endpoint. Relative paths are resolved against the page origin.
    pub collect_url: String,
    pub batch_size: usize,
    pub flush_delay_ms: u64,
    pub queue_capacity: usize,
    pub view_threshold: f64,
    pub scroll_milestones: Vec<u8>,
    pub heatmap_sample_rate: f64,
    pub default_consent_cookie: String,
    /// Step on which complementary add-ons are shown.
    pub impression_step: u32,
    pub request_timeout_ms: u64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            collect_url: DEFAULT_COLLECT_URL.to_string(),
            batch_size: 15,
            flush_delay_ms: 2_000,
            queue_capacity: 100,
            view_threshold: 0.35,
            scroll_milestones: vec![25, 50, 75, 90, 100],
            heatmap_sample_rate: 0.2,
            default_consent_cookie: DEFAULT_CONSENT_COOKIE.to_string(),
            impression_step: 2,
            request_timeout_ms: 5_000,
        }
    }
}

impl TrackerConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let cfg: TrackerConfig = serde_json::from_str(&raw)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Apply `LLTRACK_*` environment overrides on top of `self`.
    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Ok(url) = std::env::var(ENV_COLLECT_URL) {
            self.collect_url = url;
        }
        if let Ok(raw) = std::env::var(ENV_BATCH_SIZE) {
            self.batch_size = raw.trim().parse().map_err(|_| TrackError::InvalidConfig {
                reason: format!("{ENV_BATCH_SIZE}={raw} is not a positive integer"),
            })?;
        }
        if let Ok(raw) = std::env::var(ENV_FLUSH_DELAY_MS) {
            self.flush_delay_ms = raw.trim().parse().map_err(|_| TrackError::InvalidConfig {
                reason: format!("{ENV_FLUSH_DELAY_MS}={raw} is not a duration in ms"),
            })?;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |reason: &str| {
            Err(TrackError::InvalidConfig {
                reason: reason.to_string(),
            })
        };
        if self.collect_url.trim().is_empty() {
            return fail("collect_url must not be empty");
        }
        if self.batch_size == 0 {
            return fail("batch_size must be > 0");
        }
        if self.queue_capacity < self.batch_size {
            return fail("queue_capacity must be >= batch_size");
        }
        if !(0.0..=1.0).contains(&self.view_threshold) {
            return fail("view_threshold must be within [0, 1]");
        }
        if !(0.0..=1.0).contains(&self.heatmap_sample_rate) {
            return fail("heatmap_sample_rate must be within [0, 1]");
        }
        if self.scroll_milestones.iter().any(|m| *m > 100) {
            return fail("scroll milestones must be within [0, 100]");
        }
        Ok(())
    }

    pub fn flush_delay(&self) -> Duration {
        Duration::from_millis(self.flush_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Milestones sorted ascending without duplicates.
    pub fn milestones(&self) -> Vec<u8> {
        let mut marks = self.scroll_milestones.clone();
        marks.sort_unstable();
        marks.dedup();
        marks
    }
}
