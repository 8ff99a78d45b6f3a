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

//! `simulate`: the courier hand-off scenario against an in-process service.
//!
//! The run uses a throw-away client store in the system temp directory, so it
//! never touches the configured queue.

use anyhow::Result;
use chrono::Duration as ChronoDuration;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracklane::geo::offset_north;
use tracklane::transport::LoopbackTransport;
use tracklane::{
    Alert, Clock, ConnectivityMonitor, DeliveryStatus, GeoPoint, LocationSample, Priority,
    QueueError, SystemClock, TrackingClient, TrackingConfig, TrackingService,
};

const DELIVERY: &str = "sim-delivery-1";
const ORDER: &str = "sim-order-1";
const COURIER: &str = "sim-courier-1";

pub async fn run(config: &TrackingConfig) -> Result<()> {
    let store = std::env::temp_dir().join(format!("tracklane-simulate-{}.db", std::process::id()));
    let result = scenario(config, &store).await;
    for suffix in ["", "-wal", "-shm"] {
        let _ = std::fs::remove_file(format!("{}{}", store.display(), suffix));
    }
    result
}

async fn scenario(config: &TrackingConfig, store: &Path) -> Result<()> {
    let sim_config = TrackingConfig::builder()
        .database_url(store.display().to_string())
        .arrival_threshold_m(config.arrival_threshold_m())
        .dedup_distance_m(config.dedup_distance_m())
        .dedup_window(config.dedup_window())
        .min_flush_interval(Duration::ZERO)
        .build()?;

    let pickup = GeoPoint::new(40.7128, -74.0060);
    let dropoff = GeoPoint::new(40.7306, -73.9866);

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let service = Arc::new(TrackingService::new(&sim_config, clock.clone()));
    service.create_delivery(DELIVERY, ORDER, pickup, dropoff)?;
    service.assign(DELIVERY, COURIER)?;

    let connectivity = ConnectivityMonitor::default();
    let transport = Arc::new(LoopbackTransport::new(
        service.clone(),
        connectivity.clone(),
        sim_config.request_timeout(),
    ));
    let client = TrackingClient::builder()
        .config(sim_config)
        .transport(transport)
        .clock(clock.clone())
        .connectivity(connectivity)
        .courier_id(COURIER)
        .build()
        .await?;

    client.add_alert_listener(Arc::new(
        |alert: &Alert| -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            println!("{:<42} {} {}", "alert raised", alert.severity.as_str(), alert.message);
            Ok(())
        },
    ));

    let here = |point: GeoPoint| {
        LocationSample::new(point.latitude, point.longitude, clock.now()).with_accuracy(5.0)
    };

    step(
        &client,
        "heading_to_pickup",
        client
            .request_status_update(DELIVERY, DeliveryStatus::HeadingToPickup, None, None)
            .await,
    )
    .await?;
    step(
        &client,
        "at_pickup, 500m away",
        client
            .request_status_update(
                DELIVERY,
                DeliveryStatus::AtPickup,
                None,
                Some(here(offset_north(pickup, 500.0))),
            )
            .await,
    )
    .await?;
    step(
        &client,
        "at_pickup, 50m away",
        client
            .request_status_update(
                DELIVERY,
                DeliveryStatus::AtPickup,
                None,
                Some(here(offset_north(pickup, 50.0))),
            )
            .await,
    )
    .await?;
    step(
        &client,
        "picked_up before merchant confirmation",
        client
            .request_status_update(DELIVERY, DeliveryStatus::PickedUp, None, None)
            .await,
    )
    .await?;

    service.confirm_pickup(DELIVERY, "sim-merchant-confirmation").await?;
    let record = client.refresh(DELIVERY).await?;
    println!("{:<42} merchant confirmed -> now {}", "confirm_pickup", record.status);

    let first = here(offset_north(pickup, 100.0)).with_motion(1.4, 0.0);
    let mut second = here(offset_north(pickup, 103.0)).with_motion(1.4, 0.0);
    second.timestamp = first.timestamp + ChronoDuration::seconds(1);
    let a = client.submit_location(DELIVERY, first, Priority::Normal).await?;
    let b = client.submit_location(DELIVERY, second, Priority::Normal).await?;
    let queued = client.batcher().flush().await?;
    client.drain().await?;
    println!(
        "{:<42} {:?}, {:?} -> {} location update(s) queued",
        "two samples 3m and 1s apart", a, b, queued
    );

    step(
        &client,
        "heading_to_delivery",
        client
            .request_status_update(DELIVERY, DeliveryStatus::HeadingToDelivery, None, None)
            .await,
    )
    .await?;
    step(
        &client,
        "at_delivery, 30m away",
        client
            .request_status_update(
                DELIVERY,
                DeliveryStatus::AtDelivery,
                None,
                Some(here(offset_north(dropoff, 30.0))),
            )
            .await,
    )
    .await?;
    step(
        &client,
        "complete",
        client
            .request_completion(
                DELIVERY,
                Some("Handed to customer".to_string()),
                Some(here(dropoff)),
            )
            .await,
    )
    .await?;

    client.shutdown().await;
    println!();
    println!("{}", serde_json::to_string_pretty(&client.monitoring_snapshot())?);
    Ok(())
}

/// Drains a queued request and prints where the delivery ended up, or prints
/// the local rejection.
async fn step(
    client: &TrackingClient,
    label: &str,
    requested: Result<String, QueueError>,
) -> Result<()> {
    match requested {
        Ok(operation_id) => {
            client.drain().await?;
            let status = client
                .snapshot(DELIVERY)
                .await?
                .map(|record| record.status.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            println!("{:<42} queued {} -> now {}", label, operation_id, status);
        }
        Err(QueueError::Rejected(error)) => println!("{:<42} rejected: {}", label, error),
        Err(error) => return Err(error.into()),
    }
    Ok(())
}
