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

//! Error types for the tracking core.
//!
//! Errors are split by concern:
//!
//! - [`ApiError`]: the typed rejection returned by the tracking service
//! - [`TransportError`]: the structured failure a transport reports; recovery
//!   classification is a pure match over this enum
//! - [`StoreError`]: durable client state failures
//! - [`QueueError`]: failures surfaced to callers of the operation queue
//! - [`ConfigError`]: configuration loading and validation failures
//! - [`ClientError`]: failures while building a tracking client

use crate::models::delivery::DeliveryStatus;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Machine-readable rejection codes returned by the tracking service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApiErrorCode {
    ValidationError,
    AccessDenied,
    DeliveryNotFound,
    OrderNotFound,
    InvalidStatusTransition,
    DeliveryAlreadyAssigned,
    TooFarFromDestination,
    WaitingMerchantConfirmation,
    DeliveryNotActive,
    /// The record's operation lock is held by another, non-stale operation
    OperationInProgress,
    /// The caller's expected version no longer matches the record
    VersionConflict,
}

impl ApiErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiErrorCode::ValidationError => "VALIDATION_ERROR",
            ApiErrorCode::AccessDenied => "ACCESS_DENIED",
            ApiErrorCode::DeliveryNotFound => "DELIVERY_NOT_FOUND",
            ApiErrorCode::OrderNotFound => "ORDER_NOT_FOUND",
            ApiErrorCode::InvalidStatusTransition => "INVALID_STATUS_TRANSITION",
            ApiErrorCode::DeliveryAlreadyAssigned => "DELIVERY_ALREADY_ASSIGNED",
            ApiErrorCode::TooFarFromDestination => "TOO_FAR_FROM_DESTINATION",
            ApiErrorCode::WaitingMerchantConfirmation => "WAITING_MERCHANT_CONFIRMATION",
            ApiErrorCode::DeliveryNotActive => "DELIVERY_NOT_ACTIVE",
            ApiErrorCode::OperationInProgress => "OPERATION_IN_PROGRESS",
            ApiErrorCode::VersionConflict => "VERSION_CONFLICT",
        }
    }

    /// Codes a client may retry. Everything else is a validation or access
    /// failure and is surfaced without retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ApiErrorCode::OperationInProgress
                | ApiErrorCode::VersionConflict
                | ApiErrorCode::InvalidStatusTransition
        )
    }
}

impl std::fmt::Display for ApiErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A typed rejection from the tracking service.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct ApiError {
    pub code: ApiErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_status: Option<DeliveryStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempted_status: Option<DeliveryStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_transitions: Option<Vec<DeliveryStatus>>,
    /// Measured distance to the arrival point in meters
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance_m: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_distance_m: Option<f64>,
}

impl ApiError {
    pub fn new(code: ApiErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            current_status: None,
            attempted_status: None,
            allowed_transitions: None,
            distance_m: None,
            allowed_distance_m: None,
        }
    }

    pub fn with_statuses(mut self, current: DeliveryStatus, attempted: DeliveryStatus) -> Self {
        self.current_status = Some(current);
        self.attempted_status = Some(attempted);
        self
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ApiErrorCode::ValidationError, message)
    }

    pub fn not_found(entity_id: &str) -> Self {
        Self::new(
            ApiErrorCode::DeliveryNotFound,
            format!("delivery {} not found", entity_id),
        )
    }

    pub fn invalid_transition(
        current: DeliveryStatus,
        attempted: DeliveryStatus,
        allowed: Vec<DeliveryStatus>,
    ) -> Self {
        let mut error = Self::new(
            ApiErrorCode::InvalidStatusTransition,
            format!("cannot move from {} to {}", current, attempted),
        )
        .with_statuses(current, attempted);
        error.allowed_transitions = Some(allowed);
        error
    }

    pub fn too_far(
        current: DeliveryStatus,
        attempted: DeliveryStatus,
        distance_m: f64,
        allowed_distance_m: f64,
    ) -> Self {
        let mut error = Self::new(
            ApiErrorCode::TooFarFromDestination,
            format!(
                "position is {:.0}m from the destination, at most {:.0}m allowed",
                distance_m, allowed_distance_m
            ),
        )
        .with_statuses(current, attempted);
        error.distance_m = Some(distance_m);
        error.allowed_distance_m = Some(allowed_distance_m);
        error
    }

    pub fn waiting_merchant_confirmation(
        current: DeliveryStatus,
        attempted: DeliveryStatus,
    ) -> Self {
        Self::new(
            ApiErrorCode::WaitingMerchantConfirmation,
            "pickup must be confirmed by the merchant",
        )
        .with_statuses(current, attempted)
    }

    pub fn not_active(entity_id: &str) -> Self {
        Self::new(
            ApiErrorCode::DeliveryNotActive,
            format!("delivery {} is not accepting location updates", entity_id),
        )
    }

    pub fn operation_in_progress(entity_id: &str, held_by: Option<&str>) -> Self {
        Self::new(
            ApiErrorCode::OperationInProgress,
            match held_by {
                Some(holder) => format!("delivery {} is locked by operation {}", entity_id, holder),
                None => format!("delivery {} is locked by another operation", entity_id),
            },
        )
    }

    pub fn version_conflict(entity_id: &str, expected: u64, actual: u64) -> Self {
        Self::new(
            ApiErrorCode::VersionConflict,
            format!(
                "delivery {} is at version {}, expected {}",
                entity_id, actual, expected
            ),
        )
    }
}

/// Structured failure reported by a [`DeliveryTransport`](crate::transport::DeliveryTransport).
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransportError {
    /// The service processed the request and rejected it
    #[error("rejected: {0}")]
    Rejected(ApiError),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// No connectivity; the request never left the device
    #[error("offline")]
    Offline,

    /// Upstream answered with a non-success HTTP-style status
    #[error("server returned {status}: {message}")]
    Server { status: u16, message: String },

    #[error("malformed response: {0}")]
    Protocol(String),
}

impl From<ApiError> for TransportError {
    fn from(error: ApiError) -> Self {
        TransportError::Rejected(error)
    }
}

/// Failures of the durable client store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Connection pool error: {0}")]
    ConnectionPool(String),

    #[error("Database error: {0}")]
    Database(#[from] diesel::result::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Corrupt row in {table}: {message}")]
    CorruptRow {
        table: &'static str,
        message: String,
    },
}

/// Failures surfaced to callers of the operation queue.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The delivery reached a terminal status; nothing more may be queued
    #[error("delivery {entity_id} is already {status}")]
    DeliveryCompleted {
        entity_id: String,
        status: DeliveryStatus,
    },

    /// The request was rejected locally before it was queued
    #[error(transparent)]
    Rejected(#[from] ApiError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Configuration loading and validation failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read configuration file {path}: {source}")]
    ReadError {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse TOML configuration: {0}")]
    TomlParseError(#[from] toml::de::Error),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// Failures while assembling a tracking client.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("a transport is required")]
    MissingTransport,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
