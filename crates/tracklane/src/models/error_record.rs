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

//! Error Record Model
//!
//! An [`ErrorRecord`] follows a failing [`PendingOperation`] through its
//! retries. It is created on the first failure, updated on every attempt,
//! deleted when the operation resolves and kept in `failed` status once the
//! retry budget is exhausted.
//!
//! [`PendingOperation`]: super::operation::PendingOperation

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Client-side classification of a failed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ErrorType {
    ParallelWriteConflict,
    VersionConflict,
    NetworkTimeout,
    InvalidTransition,
    ServerError,
    GenericError,
}

impl ErrorType {
    pub const ALL: [ErrorType; 6] = [
        ErrorType::ParallelWriteConflict,
        ErrorType::VersionConflict,
        ErrorType::NetworkTimeout,
        ErrorType::InvalidTransition,
        ErrorType::ServerError,
        ErrorType::GenericError,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorType::ParallelWriteConflict => "parallel_write_conflict",
            ErrorType::VersionConflict => "version_conflict",
            ErrorType::NetworkTimeout => "network_timeout",
            ErrorType::InvalidTransition => "invalid_transition",
            ErrorType::ServerError => "server_error",
            ErrorType::GenericError => "generic_error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        ErrorType::ALL.into_iter().find(|t| t.as_str() == s)
    }

    /// Conflict errors feed the conflict-rate health threshold.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            ErrorType::ParallelWriteConflict | ErrorType::VersionConflict
        )
    }

    /// Message shown to the user once recovery has given up.
    pub fn user_message(&self) -> &'static str {
        match self {
            ErrorType::ParallelWriteConflict => {
                "Another update to this delivery kept getting in the way."
            }
            ErrorType::VersionConflict => "This delivery was changed somewhere else.",
            ErrorType::NetworkTimeout => "The server could not be reached.",
            ErrorType::InvalidTransition => "This status change is no longer possible.",
            ErrorType::ServerError => "The server had a problem processing the update.",
            ErrorType::GenericError => "The update was rejected.",
        }
    }

    /// The action suggested alongside [`ErrorType::user_message`].
    pub fn suggested_action(&self) -> &'static str {
        match self {
            ErrorType::ParallelWriteConflict | ErrorType::ServerError => "Try again",
            ErrorType::VersionConflict | ErrorType::InvalidTransition => "Refresh and retry",
            ErrorType::NetworkTimeout => "Check your connection and try again",
            ErrorType::GenericError => "Review the details and try again",
        }
    }
}

impl std::fmt::Display for ErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Recovery strategy chosen for an error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecoveryStrategyKind {
    /// Exponential backoff with jitter
    Backoff,
    /// Re-fetch the entity, then retry unless already resolved
    RefreshAndRetry,
    /// Linear backoff, paused entirely while offline
    AwaitConnectivity,
    /// Re-fetch the entity and retry at most once
    RefreshAndRetryOnce,
    /// Surface to the caller without retrying
    SurfaceImmediately,
}

impl RecoveryStrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryStrategyKind::Backoff => "backoff",
            RecoveryStrategyKind::RefreshAndRetry => "refresh_and_retry",
            RecoveryStrategyKind::AwaitConnectivity => "await_connectivity",
            RecoveryStrategyKind::RefreshAndRetryOnce => "refresh_and_retry_once",
            RecoveryStrategyKind::SurfaceImmediately => "surface_immediately",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "backoff" => Some(RecoveryStrategyKind::Backoff),
            "refresh_and_retry" => Some(RecoveryStrategyKind::RefreshAndRetry),
            "await_connectivity" => Some(RecoveryStrategyKind::AwaitConnectivity),
            "refresh_and_retry_once" => Some(RecoveryStrategyKind::RefreshAndRetryOnce),
            "surface_immediately" => Some(RecoveryStrategyKind::SurfaceImmediately),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorRecordStatus {
    Pending,
    Resolved,
    Failed,
}

impl ErrorRecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorRecordStatus::Pending => "pending",
            ErrorRecordStatus::Resolved => "resolved",
            ErrorRecordStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ErrorRecordStatus::Pending),
            "resolved" => Some(ErrorRecordStatus::Resolved),
            "failed" => Some(ErrorRecordStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for ErrorRecordStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Durable diagnostic record for a failing operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub id: String,
    pub error_type: ErrorType,
    /// The originating pending operation
    pub operation_id: String,
    pub entity_id: String,
    pub retry_count: u32,
    pub max_retries: u32,
    pub strategy: RecoveryStrategyKind,
    pub status: ErrorRecordStatus,
    /// Display form of the most recent failure
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ErrorRecord {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        operation_id: impl Into<String>,
        entity_id: impl Into<String>,
        error_type: ErrorType,
        max_retries: u32,
        strategy: RecoveryStrategyKind,
        last_error: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            error_type,
            operation_id: operation_id.into(),
            entity_id: entity_id.into(),
            retry_count: 0,
            max_retries,
            strategy,
            status: ErrorRecordStatus::Pending,
            last_error,
            created_at: now,
            updated_at: now,
        }
    }
}
