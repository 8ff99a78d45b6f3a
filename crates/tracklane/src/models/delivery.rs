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

//! Delivery Tracking Model
//!
//! The [`DeliveryTrackingRecord`] is the authoritative per-delivery state
//! object held by the tracking service. Clients keep a snapshot of it purely
//! as a local projection; it is never a second source of truth.

use crate::lock::LockSlot;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Default number of positions retained in a record's location history.
pub const DEFAULT_HISTORY_CAPACITY: usize = 100;

/// Lifecycle status of a delivery.
///
/// `Delivered` and `Cancelled` are terminal: no transitions leave them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Assigned,
    HeadingToPickup,
    AtPickup,
    PickedUp,
    HeadingToDelivery,
    AtDelivery,
    Delivered,
    Cancelled,
}

impl DeliveryStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [DeliveryStatus; 8] = [
        DeliveryStatus::Assigned,
        DeliveryStatus::HeadingToPickup,
        DeliveryStatus::AtPickup,
        DeliveryStatus::PickedUp,
        DeliveryStatus::HeadingToDelivery,
        DeliveryStatus::AtDelivery,
        DeliveryStatus::Delivered,
        DeliveryStatus::Cancelled,
    ];

    /// Returns the wire representation of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Assigned => "assigned",
            DeliveryStatus::HeadingToPickup => "heading_to_pickup",
            DeliveryStatus::AtPickup => "at_pickup",
            DeliveryStatus::PickedUp => "picked_up",
            DeliveryStatus::HeadingToDelivery => "heading_to_delivery",
            DeliveryStatus::AtDelivery => "at_delivery",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Cancelled => "cancelled",
        }
    }

    /// Parses a status from its wire representation.
    pub fn parse(s: &str) -> Option<Self> {
        DeliveryStatus::ALL.into_iter().find(|status| status.as_str() == s)
    }

    /// Returns true for statuses with no outgoing transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeliveryStatus::Delivered | DeliveryStatus::Cancelled)
    }
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A fixed geographic point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }
}

/// A single courier position report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationSample {
    pub latitude: f64,
    pub longitude: f64,
    /// Horizontal accuracy in meters, when the sensor reports one
    pub accuracy: Option<f64>,
    /// Ground speed in meters per second
    pub speed: Option<f64>,
    /// Heading in degrees clockwise from north
    pub heading: Option<f64>,
    /// When the sensor produced the reading
    pub timestamp: DateTime<Utc>,
}

impl LocationSample {
    /// Creates a bare sample with only coordinates and a timestamp.
    pub fn new(latitude: f64, longitude: f64, timestamp: DateTime<Utc>) -> Self {
        Self {
            latitude,
            longitude,
            accuracy: None,
            speed: None,
            heading: None,
            timestamp,
        }
    }

    pub fn with_accuracy(mut self, accuracy: f64) -> Self {
        self.accuracy = Some(accuracy);
        self
    }

    pub fn with_motion(mut self, speed: f64, heading: f64) -> Self {
        self.speed = Some(speed);
        self.heading = Some(heading);
        self
    }

    pub fn point(&self) -> GeoPoint {
        GeoPoint::new(self.latitude, self.longitude)
    }
}

/// Bounded, ordered history of positions.
///
/// Pushing beyond capacity evicts the oldest entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationHistory {
    capacity: usize,
    entries: VecDeque<LocationSample>,
}

impl LocationHistory {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: VecDeque::with_capacity(capacity.max(1)),
        }
    }

    pub fn push(&mut self, sample: LocationSample) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(sample);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &LocationSample> {
        self.entries.iter()
    }

    pub fn latest(&self) -> Option<&LocationSample> {
        self.entries.back()
    }
}

impl Default for LocationHistory {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_HISTORY_CAPACITY)
    }
}

/// The authoritative per-delivery state object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryTrackingRecord {
    /// Stable delivery identifier
    pub id: String,
    /// Associated order, immutable after creation
    pub order_id: String,
    /// Courier currently assigned to the delivery
    pub courier_id: Option<String>,
    pub status: DeliveryStatus,
    pub pickup_location: GeoPoint,
    pub delivery_location: GeoPoint,
    pub current_location: Option<LocationSample>,
    pub location_history: LocationHistory,
    /// Operation lock: acquisition timestamp and holder
    #[serde(flatten)]
    pub lock: LockSlot,
    /// True while the delivery is active and accepts location updates
    pub is_live: bool,
    /// Incremented on every status change; used for optimistic checks
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DeliveryTrackingRecord {
    pub fn new(
        id: impl Into<String>,
        order_id: impl Into<String>,
        pickup_location: GeoPoint,
        delivery_location: GeoPoint,
        history_capacity: usize,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            order_id: order_id.into(),
            courier_id: None,
            status: DeliveryStatus::Assigned,
            pickup_location,
            delivery_location,
            current_location: None,
            location_history: LocationHistory::with_capacity(history_capacity),
            lock: LockSlot::default(),
            is_live: true,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// The fixed point an arrival status is measured against.
    pub fn arrival_point(&self, target: DeliveryStatus) -> Option<GeoPoint> {
        match target {
            DeliveryStatus::AtPickup => Some(self.pickup_location),
            DeliveryStatus::AtDelivery => Some(self.delivery_location),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Records a new courier position in both the current slot and the history.
    pub fn record_location(&mut self, sample: LocationSample) {
        self.location_history.push(sample.clone());
        self.current_location = Some(sample);
    }
}
