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

//! Operational metrics and alerting.
//!
//! [`OperationMonitor`] records every attempt the queue makes: outcome,
//! duration and, for failures, the classified error type. It keeps cumulative
//! per-type counters and a day of individual outcomes from which the minute,
//! hour and day windows are computed.
//!
//! Health is judged over the hour window. The system is healthy while the
//! conflict rate, the overall error rate and the average response time all
//! stay below their thresholds. Crossing a threshold raises one alert for that
//! kind; another is raised only after the metric has recovered and crossed
//! again. Conflict alerts are always critical.
//!
//! Every attempt is also forwarded to the `metrics` facade so a host
//! application can export it with any recorder it installs.

use crate::clock::Clock;
use crate::config::TrackingConfig;
use crate::models::error_record::ErrorType;
use crate::models::operation::OperationType;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};
use uuid::Uuid;

/// Cumulative counters for one operation type.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OperationStats {
    pub success_count: u64,
    pub failure_count: u64,
    pub conflict_count: u64,
    pub total_duration_ms: u64,
}

impl OperationStats {
    pub fn attempts(&self) -> u64 {
        self.success_count + self.failure_count
    }

    pub fn average_duration_ms(&self) -> f64 {
        match self.attempts() {
            0 => 0.0,
            n => self.total_duration_ms as f64 / n as f64,
        }
    }
}

/// A rolling window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Window {
    Minute,
    Hour,
    Day,
}

impl Window {
    pub fn span(&self) -> ChronoDuration {
        match self {
            Window::Minute => ChronoDuration::minutes(1),
            Window::Hour => ChronoDuration::hours(1),
            Window::Day => ChronoDuration::days(1),
        }
    }
}

/// Aggregates over one rolling window.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WindowStats {
    pub total: u64,
    pub failures: u64,
    pub conflicts: u64,
    pub error_rate: f64,
    pub conflict_rate: f64,
    pub average_duration_ms: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Low => "low",
            AlertSeverity::Medium => "medium",
            AlertSeverity::High => "high",
            AlertSeverity::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    ConflictRate,
    ErrorRate,
    ResponseTime,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::ConflictRate => "conflict_rate",
            AlertKind::ErrorRate => "error_rate",
            AlertKind::ResponseTime => "response_time",
        }
    }
}

/// A threshold violation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub id: String,
    pub kind: AlertKind,
    pub severity: AlertSeverity,
    pub message: String,
    /// Observed value: a rate in `[0, 1]` or milliseconds
    pub value: f64,
    pub threshold: f64,
    pub raised_at: DateTime<Utc>,
}

/// Result of a health evaluation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub conflict_rate: f64,
    pub error_rate: f64,
    pub average_response_ms: f64,
    /// Alerts raised by this evaluation (newly crossed thresholds only)
    pub raised: Vec<Alert>,
}

/// Read-only view of everything the monitor knows.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonitoringSnapshot {
    pub total_operations: u64,
    pub total_failures: u64,
    pub per_type: BTreeMap<OperationType, OperationStats>,
    pub windows: BTreeMap<&'static str, WindowStats>,
    pub healthy: bool,
    pub alerts: Vec<Alert>,
    pub generated_at: DateTime<Utc>,
}

/// Receives alerts. Errors and panics are caught and logged by the monitor.
pub trait AlertListener: Send + Sync {
    fn on_alert(&self, alert: &Alert) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

impl<F> AlertListener for F
where
    F: Fn(&Alert) -> Result<(), Box<dyn std::error::Error + Send + Sync>> + Send + Sync,
{
    fn on_alert(&self, alert: &Alert) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self(alert)
    }
}

/// Health thresholds. A value at or above its threshold is unhealthy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthThresholds {
    pub conflict_rate: f64,
    pub error_rate: f64,
    pub response_time_ms: f64,
}

impl From<&TrackingConfig> for HealthThresholds {
    fn from(config: &TrackingConfig) -> Self {
        Self {
            conflict_rate: config.conflict_rate_threshold(),
            error_rate: config.error_rate_threshold(),
            response_time_ms: config.response_time_threshold().as_millis() as f64,
        }
    }
}

#[derive(Debug, Clone)]
struct Outcome {
    at: DateTime<Utc>,
    success: bool,
    conflict: bool,
    duration_ms: u64,
}

#[derive(Debug, Default)]
struct MonitorState {
    per_type: BTreeMap<OperationType, OperationStats>,
    outcomes: VecDeque<Outcome>,
    alerts: VecDeque<Alert>,
    active: HashSet<AlertKind>,
}

/// Records attempts, evaluates health and raises alerts.
pub struct OperationMonitor {
    state: Mutex<MonitorState>,
    listeners: RwLock<Vec<Arc<dyn AlertListener>>>,
    clock: Arc<dyn Clock>,
    thresholds: HealthThresholds,
    alert_history_limit: usize,
}

impl std::fmt::Debug for OperationMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationMonitor")
            .field("thresholds", &self.thresholds)
            .field("listeners", &self.listeners.read().len())
            .finish()
    }
}

impl OperationMonitor {
    pub fn new(
        thresholds: HealthThresholds,
        alert_history_limit: usize,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            state: Mutex::new(MonitorState::default()),
            listeners: RwLock::new(Vec::new()),
            clock,
            thresholds,
            alert_history_limit: alert_history_limit.max(1),
        }
    }

    pub fn from_config(config: &TrackingConfig, clock: Arc<dyn Clock>) -> Self {
        Self::new(config.into(), config.alert_history_limit(), clock)
    }

    pub fn add_listener(&self, listener: Arc<dyn AlertListener>) {
        self.listeners.write().push(listener);
    }

    /// Records one attempt. `outcome` carries the classified error on failure.
    pub fn record(
        &self,
        op_type: OperationType,
        duration: Duration,
        outcome: Result<(), ErrorType>,
    ) {
        let now = self.clock.now();
        let duration_ms = duration.as_millis() as u64;
        let conflict = matches!(outcome, Err(t) if t.is_conflict());

        {
            let mut state = self.state.lock();
            let stats = state.per_type.entry(op_type).or_default();
            match outcome {
                Ok(()) => stats.success_count += 1,
                Err(_) => stats.failure_count += 1,
            }
            if conflict {
                stats.conflict_count += 1;
            }
            stats.total_duration_ms += duration_ms;

            state.outcomes.push_back(Outcome {
                at: now,
                success: outcome.is_ok(),
                conflict,
                duration_ms,
            });
            let horizon = now - Window::Day.span();
            while state.outcomes.front().map_or(false, |o| o.at < horizon) {
                state.outcomes.pop_front();
            }
        }

        let result = match outcome {
            Ok(()) => "success",
            Err(_) => "failure",
        };
        metrics::counter!(
            "tracklane_operations_total",
            "operation" => op_type.as_str(),
            "outcome" => result
        )
        .increment(1);
        metrics::histogram!("tracklane_operation_duration_ms", "operation" => op_type.as_str())
            .record(duration_ms as f64);
    }

    /// Aggregates for one rolling window ending now.
    pub fn window_stats(&self, window: Window) -> WindowStats {
        let since = self.clock.now() - window.span();
        let state = self.state.lock();
        Self::aggregate(state.outcomes.iter().filter(|o| o.at >= since))
    }

    fn aggregate<'a>(outcomes: impl Iterator<Item = &'a Outcome>) -> WindowStats {
        let mut stats = WindowStats::default();
        let mut duration_ms = 0u64;
        for outcome in outcomes {
            stats.total += 1;
            duration_ms += outcome.duration_ms;
            if !outcome.success {
                stats.failures += 1;
            }
            if outcome.conflict {
                stats.conflicts += 1;
            }
        }
        if stats.total > 0 {
            let total = stats.total as f64;
            stats.error_rate = stats.failures as f64 / total;
            stats.conflict_rate = stats.conflicts as f64 / total;
            stats.average_duration_ms = duration_ms as f64 / total;
        }
        stats
    }

    /// Evaluates health over the hour window and raises alerts for
    /// thresholds that were crossed since the last evaluation.
    pub fn check_health(&self) -> HealthReport {
        let hour = self.window_stats(Window::Hour);
        let t = self.thresholds;
        let now = self.clock.now();

        let violations = [
            (
                AlertKind::ConflictRate,
                hour.conflict_rate >= t.conflict_rate && hour.conflicts > 0,
                hour.conflict_rate,
                t.conflict_rate,
            ),
            (
                AlertKind::ErrorRate,
                hour.error_rate >= t.error_rate && hour.failures > 0,
                hour.error_rate,
                t.error_rate,
            ),
            (
                AlertKind::ResponseTime,
                hour.total > 0 && hour.average_duration_ms >= t.response_time_ms,
                hour.average_duration_ms,
                t.response_time_ms,
            ),
        ];

        let mut raised = Vec::new();
        let healthy;
        {
            let mut state = self.state.lock();
            for (kind, violated, value, threshold) in violations {
                if !violated {
                    state.active.remove(&kind);
                    continue;
                }
                if !state.active.insert(kind) {
                    continue;
                }
                let alert = Alert {
                    id: Uuid::new_v4().to_string(),
                    kind,
                    severity: severity(kind, value, threshold),
                    message: describe(kind, value, threshold),
                    value,
                    threshold,
                    raised_at: now,
                };
                if state.alerts.len() == self.alert_history_limit {
                    state.alerts.pop_front();
                }
                state.alerts.push_back(alert.clone());
                raised.push(alert);
            }
            healthy = state.active.is_empty();
        }

        for alert in &raised {
            warn!(
                kind = alert.kind.as_str(),
                severity = alert.severity.as_str(),
                value = alert.value,
                threshold = alert.threshold,
                "{}",
                alert.message
            );
            metrics::counter!(
                "tracklane_alerts_total",
                "kind" => alert.kind.as_str(),
                "severity" => alert.severity.as_str()
            )
            .increment(1);
            self.dispatch(alert);
        }

        HealthReport {
            healthy,
            conflict_rate: hour.conflict_rate,
            error_rate: hour.error_rate,
            average_response_ms: hour.average_duration_ms,
            raised,
        }
    }

    fn dispatch(&self, alert: &Alert) {
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            match catch_unwind(AssertUnwindSafe(|| listener.on_alert(alert))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(alert_id = %alert.id, error = %e, "Alert listener failed"),
                Err(_) => error!(alert_id = %alert.id, "Alert listener panicked"),
            }
        }
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.state.lock().alerts.iter().cloned().collect()
    }

    /// Health as of the last evaluation.
    /// Evaluates health and returns a full read-only view.
    pub fn snapshot(&self) -> MonitoringSnapshot {
        let report = self.check_health();
        let windows = [Window::Minute, Window::Hour, Window::Day]
            .into_iter()
            .map(|w| {
                let name = match w {
                    Window::Minute => "minute",
                    Window::Hour => "hour",
                    Window::Day => "day",
                };
                (name, self.window_stats(w))
            })
            .collect();

        let state = self.state.lock();
        let total_operations = state.per_type.values().map(OperationStats::attempts).sum();
        let total_failures = state.per_type.values().map(|s| s.failure_count).sum();
        MonitoringSnapshot {
            total_operations,
            total_failures,
            per_type: state.per_type.clone(),
            windows,
            healthy: report.healthy,
            alerts: state.alerts.iter().cloned().collect(),
            generated_at: self.clock.now(),
        }
    }
}

fn severity(kind: AlertKind, value: f64, threshold: f64) -> AlertSeverity {
    if kind == AlertKind::ConflictRate {
        return AlertSeverity::Critical;
    }
    let ratio = if threshold > 0.0 {
        value / threshold
    } else {
        f64::INFINITY
    };
    match kind {
        AlertKind::ErrorRate if ratio >= 5.0 => AlertSeverity::Critical,
        AlertKind::ErrorRate if ratio >= 3.0 => AlertSeverity::High,
        AlertKind::ErrorRate if ratio >= 2.0 => AlertSeverity::Medium,
        AlertKind::ResponseTime if ratio >= 4.0 => AlertSeverity::High,
        AlertKind::ResponseTime if ratio >= 2.0 => AlertSeverity::Medium,
        _ => AlertSeverity::Low,
    }
}

fn describe(kind: AlertKind, value: f64, threshold: f64) -> String {
    match kind {
        AlertKind::ConflictRate => format!(
            "Conflict rate {:.1}% reached the {:.1}% threshold",
            value * 100.0,
            threshold * 100.0
        ),
        AlertKind::ErrorRate => format!(
            "Error rate {:.1}% reached the {:.1}% threshold",
            value * 100.0,
            threshold * 100.0
        ),
        AlertKind::ResponseTime => format!(
            "Average response time {:.0}ms reached the {:.0}ms threshold",
            value, threshold
        ),
    }
}
