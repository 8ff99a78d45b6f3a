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

//! Cancellable periodic background tasks.
//!
//! A [`PeriodicTask`] runs an async job on a fixed interval, and also
//! whenever its optional trigger is notified. It can be stopped (for example
//! when the app is backgrounded) and started again later.

use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

type Job = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

struct Running {
    shutdown: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

/// A restartable interval loop.
pub struct PeriodicTask {
    name: String,
    interval: Duration,
    job: Job,
    trigger: Option<Arc<Notify>>,
    running: Mutex<Option<Running>>,
}

impl std::fmt::Debug for PeriodicTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeriodicTask")
            .field("name", &self.name)
            .field("interval", &self.interval)
            .field("running", &self.is_running())
            .finish()
    }
}

impl PeriodicTask {
    pub fn new<F, Fut>(name: impl Into<String>, interval: Duration, job: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            name: name.into(),
            interval,
            job: Arc::new(move || Box::pin(job())),
            trigger: None,
            running: Mutex::new(None),
        }
    }

    /// Also runs the job whenever `trigger` is notified.
    pub fn with_trigger(mut self, trigger: Arc<Notify>) -> Self {
        self.trigger = Some(trigger);
        self
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .map_or(false, |running| !running.handle.is_finished())
    }

    /// Spawns the loop on the current tokio runtime.
    ///
    /// Returns false if the task is already running.
    pub fn start(&self) -> bool {
        let mut running = self.running.lock();
        if running
            .as_ref()
            .map_or(false, |running| !running.handle.is_finished())
        {
            return false;
        }

        let (shutdown, mut shutdown_rx) = broadcast::channel(1);
        let job = self.job.clone();
        let trigger = self.trigger.clone();
        let interval = self.interval;
        let name = self.name.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                let triggered = async {
                    match &trigger {
                        Some(trigger) => trigger.notified().await,
                        None => std::future::pending::<()>().await,
                    }
                };
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        debug!(task = %name, "Periodic task received shutdown signal");
                        break;
                    }
                    _ = ticker.tick() => {}
                    _ = triggered => {
                        debug!(task = %name, "Periodic task triggered");
                    }
                }
                job().await;
            }
        });

        info!(
            task = %self.name,
            interval_ms = self.interval.as_millis() as u64,
            "Periodic task started"
        );
        *running = Some(Running { shutdown, handle });
        true
    }

    /// Stops the loop and waits for the in-flight run to finish.
    ///
    /// Returns false if the task was not running.
    pub async fn stop(&self) -> bool {
        let running = self.running.lock().take();
        let Some(running) = running else {
            return false;
        };
        let _ = running.shutdown.send(());
        let _ = running.handle.await;
        info!(task = %self.name, "Periodic task stopped");
        true
    }
}
