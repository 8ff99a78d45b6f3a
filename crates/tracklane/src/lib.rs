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

//! # Tracklane
//!
//! Tracklane keeps a single delivery-tracking record consistent while several
//! independent actors race to mutate it over an unreliable link: a courier's
//! location stream, the courier's status actions, a merchant confirmation and
//! network retries.
//!
//! The crate is organised leaves first:
//!
//! - [`transition`]: the delivery status state machine and the arrival gate
//! - [`lock`]: per-entity mutual exclusion with staleness reclaim
//! - [`telemetry`]: client-side deduplication and coalescing of location samples
//! - [`queue`]: the durable, replay-safe operation queue
//! - [`recovery`]: error classification and per-error retry strategies
//! - [`monitor`]: per-operation statistics, rolling windows, health and alerts
//!
//! Around that core sit the authoritative [`tracking::TrackingService`], the
//! [`transport::DeliveryTransport`] seam, the SQLite-backed [`dal`] and the
//! [`client::TrackingClient`] facade that wires everything together.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tracklane::{TrackingClient, TrackingConfig};
//!
//! let config = TrackingConfig::builder()
//!     .database_url("/var/lib/courier/tracking.db")
//!     .build()?;
//! let client = TrackingClient::builder()
//!     .config(config)
//!     .transport(transport)
//!     .build()
//!     .await?;
//! client.start();
//!
//! client
//!     .request_status_update("delivery-1", DeliveryStatus::HeadingToPickup, None, None)
//!     .await?;
//! ```

pub mod client;
pub mod clock;
pub mod config;
pub mod connectivity;
pub mod dal;
pub mod database;
pub mod error;
pub mod geo;
pub mod lock;
pub mod models;
pub mod monitor;
pub mod queue;
pub mod recovery;
pub mod scheduler;
pub mod telemetry;
pub mod tracking;
pub mod transition;
pub mod transport;

pub use client::{TrackingClient, TrackingClientBuilder};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{TrackingConfig, TrackingConfigBuilder};
pub use connectivity::ConnectivityMonitor;
pub use database::Database;
pub use error::{
    ApiError, ApiErrorCode, ClientError, ConfigError, QueueError, StoreError, TransportError,
};
pub use models::delivery::{DeliveryStatus, DeliveryTrackingRecord, GeoPoint, LocationSample};
pub use models::error_record::{ErrorRecord, ErrorRecordStatus, ErrorType};
pub use models::operation::{OperationPayload, OperationType, PendingOperation, Priority};
pub use monitor::{Alert, AlertSeverity, MonitoringSnapshot, OperationMonitor};
pub use queue::{BatchReport, OperationQueue, QueueEvent};
pub use telemetry::{SubmitOutcome, TelemetryBatcher};
pub use tracking::TrackingService;
pub use transition::{Actor, GuardRejection, TransitionGuard};
pub use transport::{DeliveryTransport, LoopbackTransport};

use std::sync::Once;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

static LOGGING: Once = Once::new();

/// Installs a `tracing` subscriber for the process.
///
/// With `Some(level)` the filter is fixed at that level; with `None` the
/// `RUST_LOG` environment variable is honoured, falling back to `info`.
/// Calling this more than once is harmless: only the first call installs
/// a subscriber.
pub fn init_logging(level: Option<tracing::Level>) {
    LOGGING.call_once(|| {
        let filter = match level {
            Some(level) => EnvFilter::new(level.to_string().to_lowercase()),
            None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        };

        let _ = tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .try_init();
    });
}
