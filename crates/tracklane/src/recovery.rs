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

//! Error classification and recovery strategies.
//!
//! Classification is a pure match over [`TransportError`]; no message text
//! is ever inspected. Each [`ErrorType`] maps to a fixed [`RecoveryPolicy`]:
//!
//! | Type                  | Max retries | Strategy                                 |
//! |-----------------------|-------------|------------------------------------------|
//! | ParallelWriteConflict | 5           | exponential backoff + jitter             |
//! | VersionConflict       | 3           | refresh, then retry                      |
//! | NetworkTimeout        | 10          | linear backoff, paused while offline     |
//! | InvalidTransition     | 1           | refresh, retry once if still applicable  |
//! | ServerError           | 3           | exponential backoff + jitter             |
//! | GenericError          | 0           | surface immediately                      |
//!
//! Exponential delays are `min(base * 2^retry_count, cap) + jitter`, linear
//! delays `min(base * (retry_count + 1), cap) + jitter`, with jitter drawn
//! uniformly from `[0, delay / 10]`.

use crate::error::{ApiErrorCode, TransportError};
use crate::models::delivery::DeliveryTrackingRecord;
use crate::models::error_record::{ErrorType, RecoveryStrategyKind};
use crate::models::operation::OperationPayload;
use crate::transition::TransitionGuard;
use rand::Rng;
use std::time::Duration;

/// Maps a transport failure to its recovery class.
pub fn classify(error: &TransportError) -> ErrorType {
    match error {
        TransportError::Rejected(api) => match api.code {
            ApiErrorCode::OperationInProgress => ErrorType::ParallelWriteConflict,
            ApiErrorCode::VersionConflict => ErrorType::VersionConflict,
            ApiErrorCode::InvalidStatusTransition => ErrorType::InvalidTransition,
            _ => ErrorType::GenericError,
        },
        TransportError::Timeout(_) | TransportError::Offline => ErrorType::NetworkTimeout,
        TransportError::Server { status, .. } if *status >= 500 => ErrorType::ServerError,
        TransportError::Server { .. } | TransportError::Protocol(_) => ErrorType::GenericError,
    }
}

/// Whether the service said the delivery no longer accepts changes.
///
/// Such a rejection is settled by re-fetching the record rather than by
/// the error type's own policy.
pub fn signals_closed(error: &TransportError) -> bool {
    match error {
        TransportError::Rejected(api) => {
            api.code == ApiErrorCode::DeliveryNotActive
                || api.current_status.is_some_and(|status| status.is_terminal())
        }
        _ => false,
    }
}

/// Shape of the delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffStrategy {
    /// Retry on the next batch
    Immediate,
    Linear,
    Exponential,
}

/// The fixed recovery rules for one error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryPolicy {
    pub error_type: ErrorType,
    pub max_retries: u32,
    pub strategy: RecoveryStrategyKind,
    pub backoff: BackoffStrategy,
}

impl RecoveryPolicy {
    pub fn for_error(error_type: ErrorType) -> Self {
        use RecoveryStrategyKind::*;
        let (max_retries, strategy, backoff) = match error_type {
            ErrorType::ParallelWriteConflict => (5, Backoff, BackoffStrategy::Exponential),
            ErrorType::VersionConflict => (3, RefreshAndRetry, BackoffStrategy::Immediate),
            ErrorType::NetworkTimeout => (10, AwaitConnectivity, BackoffStrategy::Linear),
            ErrorType::InvalidTransition => (1, RefreshAndRetryOnce, BackoffStrategy::Immediate),
            ErrorType::ServerError => (3, Backoff, BackoffStrategy::Exponential),
            ErrorType::GenericError => (0, SurfaceImmediately, BackoffStrategy::Immediate),
        };
        Self {
            error_type,
            max_retries,
            strategy,
            backoff,
        }
    }

    /// Whether the entity must be re-fetched before deciding.
    pub fn refreshes(&self) -> bool {
        matches!(
            self.strategy,
            RecoveryStrategyKind::RefreshAndRetry | RecoveryStrategyKind::RefreshAndRetryOnce
        )
    }
}

/// What a refreshed record says about a failed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applicability {
    /// The record already reflects the operation's outcome
    AlreadyApplied,
    /// The operation can no longer be applied to the record
    NoLongerApplicable,
    StillApplicable,
}

/// Judges `payload` against a freshly fetched `record`.
pub fn applicability(payload: &OperationPayload, record: &DeliveryTrackingRecord) -> Applicability {
    match payload.target_status() {
        Some(target) if record.status == target => Applicability::AlreadyApplied,
        Some(target) if TransitionGuard::is_valid(record.status, target) => {
            Applicability::StillApplicable
        }
        Some(_) => Applicability::NoLongerApplicable,
        None if record.is_live && !record.is_terminal() => Applicability::StillApplicable,
        None => Applicability::NoLongerApplicable,
    }
}

/// Outcome of recovery for one failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryDecision {
    /// Requeue at the front and try again after `delay`
    Retry { delay: Duration, consume_budget: bool },
    /// Treat as success without re-applying
    ResolvedNoOp(Applicability),
    /// Give up; the error record becomes `failed`
    Exhausted,
}

/// Delay computation for retries.
#[derive(Debug, Clone, Copy)]
pub struct RecoveryStrategies {
    base: Duration,
    cap: Duration,
}

impl RecoveryStrategies {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    /// `min(base * 2^retry_count, cap)`, before jitter.
    pub fn exponential_delay(&self, retry_count: u32) -> Duration {
        let factor = 2u32.checked_pow(retry_count).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map_or(self.cap, |delay| delay.min(self.cap))
    }

    /// `min(base * (retry_count + 1), cap)`, before jitter.
    pub fn linear_delay(&self, retry_count: u32) -> Duration {
        self.base
            .checked_mul(retry_count.saturating_add(1))
            .map_or(self.cap, |delay| delay.min(self.cap))
    }

    /// Adds uniform jitter in `[0, delay / 10]`.
    pub fn with_jitter(delay: Duration) -> Duration {
        let spread = (delay.as_millis() / 10) as u64;
        if spread == 0 {
            return delay;
        }
        delay + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
    }

    pub fn retry_delay(&self, policy: &RecoveryPolicy, retry_count: u32) -> Duration {
        match policy.backoff {
            BackoffStrategy::Immediate => Duration::ZERO,
            BackoffStrategy::Linear => Self::with_jitter(self.linear_delay(retry_count)),
            BackoffStrategy::Exponential => Self::with_jitter(self.exponential_delay(retry_count)),
        }
    }

    /// Decides what happens after a failed attempt.
    ///
    /// `retry_count` is the number of retries already spent. `refreshed` is
    /// the outcome of re-fetching the entity for refresh strategies (`None`
    /// if no refresh happened or it failed). `offline` pauses
    /// connectivity-bound retries without spending budget.
    pub fn decide(
        &self,
        policy: &RecoveryPolicy,
        retry_count: u32,
        refreshed: Option<Applicability>,
        offline: bool,
    ) -> RecoveryDecision {
        match policy.strategy {
            RecoveryStrategyKind::SurfaceImmediately => return RecoveryDecision::Exhausted,
            RecoveryStrategyKind::AwaitConnectivity if offline => {
                return RecoveryDecision::Retry {
                    delay: Duration::ZERO,
                    consume_budget: false,
                }
            }
            RecoveryStrategyKind::RefreshAndRetry | RecoveryStrategyKind::RefreshAndRetryOnce => {
                match refreshed {
                    Some(outcome @ Applicability::AlreadyApplied)
                    | Some(outcome @ Applicability::NoLongerApplicable) => {
                        return RecoveryDecision::ResolvedNoOp(outcome)
                    }
                    _ => {}
                }
            }
            _ => {}
        }

        if retry_count >= policy.max_retries {
            return RecoveryDecision::Exhausted;
        }
        RecoveryDecision::Retry {
            delay: self.retry_delay(policy, retry_count),
            consume_budget: true,
        }
    }
}
