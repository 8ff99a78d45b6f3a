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

//! Delivery status state machine.
//!
//! Legal moves are a fixed adjacency table. Two rules sit on top of it:
//!
//! - while a delivery is `at_pickup`, the courier's own status requests are
//!   refused until the merchant confirms the hand-off
//! - arrival states (`at_pickup`, `at_delivery`) need a position within the
//!   arrival threshold of the matching fixed point
//!
//! Checks run in this order: terminal status, hand-off gate, table,
//! arrival position.

use crate::error::ApiError;
use crate::geo::haversine_distance_m;
use crate::models::delivery::{DeliveryStatus, DeliveryTrackingRecord, LocationSample};

/// Default maximum distance in meters for an arrival transition.
pub const DEFAULT_ARRIVAL_THRESHOLD_M: f64 = 200.0;

/// Who is asking for a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Actor {
    Courier,
    /// The merchant hand-off confirmation
    Merchant,
}

/// Why the guard refused a transition.
#[derive(Debug, Clone, PartialEq)]
pub enum GuardRejection {
    /// The delivery is finished
    Terminal,
    AwaitingMerchantConfirmation,
    NotAllowed { allowed: &'static [DeliveryStatus] },
    LocationRequired,
    TooFar { distance_m: f64, allowed_m: f64 },
}

impl GuardRejection {
    /// Maps the rejection onto the service's wire error.
    pub fn into_api_error(self, current: DeliveryStatus, attempted: DeliveryStatus) -> ApiError {
        match self {
            GuardRejection::Terminal => {
                ApiError::invalid_transition(current, attempted, Vec::new())
            }
            GuardRejection::AwaitingMerchantConfirmation => {
                ApiError::waiting_merchant_confirmation(current, attempted)
            }
            GuardRejection::NotAllowed { allowed } => {
                ApiError::invalid_transition(current, attempted, allowed.to_vec())
            }
            GuardRejection::LocationRequired => {
                ApiError::validation(format!("a location is required to move to {}", attempted))
                    .with_statuses(current, attempted)
            }
            GuardRejection::TooFar {
                distance_m,
                allowed_m,
            } => ApiError::too_far(current, attempted, distance_m, allowed_m),
        }
    }
}

/// Validates status transitions.
#[derive(Debug, Clone, Copy)]
pub struct TransitionGuard {
    arrival_threshold_m: f64,
}

impl Default for TransitionGuard {
    fn default() -> Self {
        Self::new(DEFAULT_ARRIVAL_THRESHOLD_M)
    }
}

impl TransitionGuard {
    pub fn new(arrival_threshold_m: f64) -> Self {
        Self {
            arrival_threshold_m,
        }
    }

    pub fn arrival_threshold_m(&self) -> f64 {
        self.arrival_threshold_m
    }

    /// Statuses reachable from `from` in one step.
    pub fn allowed_transitions(from: DeliveryStatus) -> &'static [DeliveryStatus] {
        use DeliveryStatus::*;
        match from {
            Assigned => &[HeadingToPickup, Cancelled],
            HeadingToPickup => &[AtPickup, Cancelled],
            AtPickup => &[PickedUp, Cancelled],
            PickedUp => &[HeadingToDelivery, AtDelivery, Cancelled],
            HeadingToDelivery => &[AtDelivery, Cancelled],
            AtDelivery => &[Delivered, Cancelled],
            Delivered | Cancelled => &[],
        }
    }

    /// Pure table lookup.
    pub fn is_valid(current: DeliveryStatus, target: DeliveryStatus) -> bool {
        Self::allowed_transitions(current).contains(&target)
    }

    /// Full check of a requested transition against `record`.
    pub fn check(
        &self,
        record: &DeliveryTrackingRecord,
        target: DeliveryStatus,
        location: Option<&LocationSample>,
        actor: Actor,
    ) -> Result<(), GuardRejection> {
        let current = record.status;
        if current.is_terminal() {
            return Err(GuardRejection::Terminal);
        }
        if current == DeliveryStatus::AtPickup && actor == Actor::Courier {
            return Err(GuardRejection::AwaitingMerchantConfirmation);
        }
        if !Self::is_valid(current, target) {
            return Err(GuardRejection::NotAllowed {
                allowed: Self::allowed_transitions(current),
            });
        }
        if let Some(point) = record.arrival_point(target) {
            let sample = location.ok_or(GuardRejection::LocationRequired)?;
            let distance_m = haversine_distance_m(sample.point(), point);
            if distance_m > self.arrival_threshold_m {
                return Err(GuardRejection::TooFar {
                    distance_m,
                    allowed_m: self.arrival_threshold_m,
                });
            }
        }
        Ok(())
    }
}
