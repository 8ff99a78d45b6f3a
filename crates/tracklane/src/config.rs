/*
 *  Copyright 2025-2026 Colliery Software
 *
 *  Licensed under the Apache License, Version 2.0 (the "License");
 *  you may not use this file except in compliance with the License.
 *  You may obtain a copy of the License at
 *
 *      http://www.apache.org/licenses/LICENSE-2.0
 *
 *  Unless required by applicable law or agreed to in writing, software
 *  distributed under the License is distributed on an "AS IS" BASIS,
 *  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *  See the License for the specific language governing permissions and
 *  limitations under the License.
 */

//! Configuration for the tracking client and service.
//!
//! Use [`TrackingConfig::builder()`] in code, or load a TOML file with
//! [`TrackingConfig::from_toml_file`]. Every key in the file is optional and
//! falls back to the defaults below.
//!
//! ```toml
//! database_url = "/var/lib/courier/tracking.db"
//! batch_size = 3
//! min_flush_interval_ms = 5000
//!
//! [thresholds]
//! conflict_rate = 0.01
//! error_rate = 0.05
//! response_time_ms = 5000
//! ```

use crate::error::ConfigError;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Configuration for the tracking core.
///
/// # Construction
///
/// ```rust,ignore
/// let config = TrackingConfig::builder()
///     .batch_size(5)
///     .min_flush_interval(Duration::from_secs(2))
///     .build()?;
/// ```
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct TrackingConfig {
    database_url: String,
    lock_ttl: Duration,
    arrival_threshold_m: f64,
    history_capacity: usize,
    dedup_distance_m: f64,
    dedup_window: Duration,
    debounce: Duration,
    batch_size: usize,
    min_flush_interval: Duration,
    drain_interval: Duration,
    backoff_base: Duration,
    backoff_cap: Duration,
    request_timeout: Duration,
    conflict_rate_threshold: f64,
    error_rate_threshold: f64,
    response_time_threshold: Duration,
    health_check_interval: Duration,
    alert_history_limit: usize,
}

impl TrackingConfig {
    /// Creates a new configuration builder with default values.
    pub fn builder() -> TrackingConfigBuilder {
        TrackingConfigBuilder::default()
    }

    /// Loads a configuration from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(text)?;
        file.apply(Self::builder()).build()
    }

    /// Loads a configuration from a TOML file on disk.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadError {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// SQLite path (or `:memory:`) for the durable client store.
    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    /// Age at which an unreleased entity lock may be reclaimed.
    pub fn lock_ttl(&self) -> Duration {
        self.lock_ttl
    }

    /// Maximum distance in meters for an arrival transition.
    pub fn arrival_threshold_m(&self) -> f64 {
        self.arrival_threshold_m
    }

    /// Capacity of a record's location history.
    pub fn history_capacity(&self) -> usize {
        self.history_capacity
    }

    /// Distance below which two samples may be duplicates.
    pub fn dedup_distance_m(&self) -> f64 {
        self.dedup_distance_m
    }

    /// Time window within which two samples may be duplicates.
    pub fn dedup_window(&self) -> Duration {
        self.dedup_window
    }

    /// Inactivity period after which buffered samples are flushed.
    pub fn debounce(&self) -> Duration {
        self.debounce
    }

    /// Maximum operations processed per batch.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Minimum time between the starts of two batches.
    pub fn min_flush_interval(&self) -> Duration {
        self.min_flush_interval
    }

    /// How often the client's background loop drains the queue.
    pub fn drain_interval(&self) -> Duration {
        self.drain_interval
    }

    /// Base delay for exponential backoff.
    pub fn backoff_base(&self) -> Duration {
        self.backoff_base
    }

    /// Upper bound for any computed retry delay, before jitter.
    pub fn backoff_cap(&self) -> Duration {
        self.backoff_cap
    }

    /// Per-request transport timeout.
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Conflict-error rate at or above which the system is unhealthy.
    pub fn conflict_rate_threshold(&self) -> f64 {
        self.conflict_rate_threshold
    }

    /// Overall error rate at or above which the system is unhealthy.
    pub fn error_rate_threshold(&self) -> f64 {
        self.error_rate_threshold
    }

    /// Average response time at or above which the system is unhealthy.
    pub fn response_time_threshold(&self) -> Duration {
        self.response_time_threshold
    }

    /// How often the client evaluates health in the background.
    pub fn health_check_interval(&self) -> Duration {
        self.health_check_interval
    }

    /// Number of alerts retained for the monitoring snapshot.
    pub fn alert_history_limit(&self) -> usize {
        self.alert_history_limit
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(invalid("batch_size", "must be at least 1"));
        }
        if self.history_capacity == 0 {
            return Err(invalid("history_capacity", "must be at least 1"));
        }
        if self.backoff_cap < self.backoff_base {
            return Err(invalid(
                "backoff_cap",
                format!(
                    "{:?} is smaller than backoff_base {:?}",
                    self.backoff_cap, self.backoff_base
                ),
            ));
        }
        for (field, rate) in [
            ("conflict_rate", self.conflict_rate_threshold),
            ("error_rate", self.error_rate_threshold),
        ] {
            if !(0.0..=1.0).contains(&rate) {
                return Err(invalid(field, format!("{} is outside [0, 1]", rate)));
            }
        }
        for (field, meters) in [
            ("arrival_threshold_m", self.arrival_threshold_m),
            ("dedup_distance_m", self.dedup_distance_m),
        ] {
            if !meters.is_finite() || meters < 0.0 {
                return Err(invalid(field, format!("{} is not a distance", meters)));
            }
        }
        for (field, interval) in [
            ("drain_interval", self.drain_interval),
            ("health_check_interval", self.health_check_interval),
        ] {
            if interval.is_zero() {
                return Err(invalid(field, "must be greater than zero"));
            }
        }
        if self.database_url.is_empty() {
            return Err(invalid("database_url", "must not be empty"));
        }
        Ok(())
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        field,
        reason: reason.into(),
    }
}

/// Builder for [`TrackingConfig`].
#[derive(Debug, Clone)]
pub struct TrackingConfigBuilder {
    config: TrackingConfig,
}

impl Default for TrackingConfigBuilder {
    fn default() -> Self {
        Self {
            config: TrackingConfig {
                database_url: "tracklane.db".to_string(),
                lock_ttl: Duration::from_secs(30),
                arrival_threshold_m: crate::transition::DEFAULT_ARRIVAL_THRESHOLD_M,
                history_capacity: crate::models::delivery::DEFAULT_HISTORY_CAPACITY,
                dedup_distance_m: 5.0,
                dedup_window: Duration::from_secs(2),
                debounce: Duration::from_secs(3),
                batch_size: 3,
                min_flush_interval: Duration::from_secs(5),
                drain_interval: Duration::from_secs(10),
                backoff_base: Duration::from_millis(1000),
                backoff_cap: Duration::from_secs(30),
                request_timeout: Duration::from_secs(15),
                conflict_rate_threshold: 0.01,
                error_rate_threshold: 0.05,
                response_time_threshold: Duration::from_millis(5000),
                health_check_interval: Duration::from_secs(60),
                alert_history_limit: 100,
            },
        }
    }
}

impl TrackingConfigBuilder {
    pub fn database_url(mut self, value: impl Into<String>) -> Self {
        self.config.database_url = value.into();
        self
    }

    pub fn lock_ttl(mut self, value: Duration) -> Self {
        self.config.lock_ttl = value;
        self
    }

    pub fn arrival_threshold_m(mut self, value: f64) -> Self {
        self.config.arrival_threshold_m = value;
        self
    }

    pub fn history_capacity(mut self, value: usize) -> Self {
        self.config.history_capacity = value;
        self
    }

    pub fn dedup_distance_m(mut self, value: f64) -> Self {
        self.config.dedup_distance_m = value;
        self
    }

    pub fn dedup_window(mut self, value: Duration) -> Self {
        self.config.dedup_window = value;
        self
    }

    pub fn debounce(mut self, value: Duration) -> Self {
        self.config.debounce = value;
        self
    }

    pub fn batch_size(mut self, value: usize) -> Self {
        self.config.batch_size = value;
        self
    }

    pub fn min_flush_interval(mut self, value: Duration) -> Self {
        self.config.min_flush_interval = value;
        self
    }

    pub fn drain_interval(mut self, value: Duration) -> Self {
        self.config.drain_interval = value;
        self
    }

    pub fn backoff_base(mut self, value: Duration) -> Self {
        self.config.backoff_base = value;
        self
    }

    pub fn backoff_cap(mut self, value: Duration) -> Self {
        self.config.backoff_cap = value;
        self
    }

    pub fn request_timeout(mut self, value: Duration) -> Self {
        self.config.request_timeout = value;
        self
    }

    pub fn conflict_rate_threshold(mut self, value: f64) -> Self {
        self.config.conflict_rate_threshold = value;
        self
    }

    pub fn error_rate_threshold(mut self, value: f64) -> Self {
        self.config.error_rate_threshold = value;
        self
    }

    pub fn response_time_threshold(mut self, value: Duration) -> Self {
        self.config.response_time_threshold = value;
        self
    }

    pub fn health_check_interval(mut self, value: Duration) -> Self {
        self.config.health_check_interval = value;
        self
    }

    pub fn alert_history_limit(mut self, value: usize) -> Self {
        self.config.alert_history_limit = value;
        self
    }

    /// Validates and builds the configuration.
    pub fn build(self) -> Result<TrackingConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for TrackingConfig {
    fn default() -> Self {
        TrackingConfigBuilder::default().config
    }
}

/// On-disk shape of the configuration. Durations are in milliseconds.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    database_url: Option<String>,
    lock_ttl_ms: Option<u64>,
    arrival_threshold_m: Option<f64>,
    history_capacity: Option<usize>,
    dedup_distance_m: Option<f64>,
    dedup_window_ms: Option<u64>,
    debounce_ms: Option<u64>,
    batch_size: Option<usize>,
    min_flush_interval_ms: Option<u64>,
    drain_interval_ms: Option<u64>,
    backoff_base_ms: Option<u64>,
    backoff_cap_ms: Option<u64>,
    request_timeout_ms: Option<u64>,
    #[serde(default)]
    thresholds: ThresholdsFile,
    health_check_interval_ms: Option<u64>,
    alert_history_limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ThresholdsFile {
    conflict_rate: Option<f64>,
    error_rate: Option<f64>,
    response_time_ms: Option<u64>,
}

impl ConfigFile {
    fn apply(self, mut builder: TrackingConfigBuilder) -> TrackingConfigBuilder {
        let ms = Duration::from_millis;
        if let Some(v) = self.database_url {
            builder = builder.database_url(v);
        }
        if let Some(v) = self.lock_ttl_ms {
            builder = builder.lock_ttl(ms(v));
        }
        if let Some(v) = self.arrival_threshold_m {
            builder = builder.arrival_threshold_m(v);
        }
        if let Some(v) = self.history_capacity {
            builder = builder.history_capacity(v);
        }
        if let Some(v) = self.dedup_distance_m {
            builder = builder.dedup_distance_m(v);
        }
        if let Some(v) = self.dedup_window_ms {
            builder = builder.dedup_window(ms(v));
        }
        if let Some(v) = self.debounce_ms {
            builder = builder.debounce(ms(v));
        }
        if let Some(v) = self.batch_size {
            builder = builder.batch_size(v);
        }
        if let Some(v) = self.min_flush_interval_ms {
            builder = builder.min_flush_interval(ms(v));
        }
        if let Some(v) = self.drain_interval_ms {
            builder = builder.drain_interval(ms(v));
        }
        if let Some(v) = self.backoff_base_ms {
            builder = builder.backoff_base(ms(v));
        }
        if let Some(v) = self.backoff_cap_ms {
            builder = builder.backoff_cap(ms(v));
        }
        if let Some(v) = self.request_timeout_ms {
            builder = builder.request_timeout(ms(v));
        }
        if let Some(v) = self.thresholds.conflict_rate {
            builder = builder.conflict_rate_threshold(v);
        }
        if let Some(v) = self.thresholds.error_rate {
            builder = builder.error_rate_threshold(v);
        }
        if let Some(v) = self.thresholds.response_time_ms {
            builder = builder.response_time_threshold(ms(v));
        }
        if let Some(v) = self.health_check_interval_ms {
            builder = builder.health_check_interval(ms(v));
        }
        if let Some(v) = self.alert_history_limit {
            builder = builder.alert_history_limit(v);
        }
        builder
    }
}
