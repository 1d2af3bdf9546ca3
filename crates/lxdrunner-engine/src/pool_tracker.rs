// PoolTracker: consumes the fleet's lifecycle event stream and releases the
// pool slot of every managed instance the fleet reports deleted.

use crate::error_throttler::ErrorThrottler;
use crate::worker_registry::{ReleaseOutcome, WorkerRegistry};

use lxdrunner_common::constants::events::INSTANCE_DELETED;
use lxdrunner_common::{FleetApi, LifecycleEvent, Tracing};
use lxdrunner_sdk::{StringUtil, TraceWriter};

use futures::StreamExt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub struct PoolTracker {
    fleet: Arc<dyn FleetApi>,
    registry: Arc<WorkerRegistry>,
    prefix: String,
    trace: Tracing,
}

impl PoolTracker {
    pub fn new(
        fleet: Arc<dyn FleetApi>,
        registry: Arc<WorkerRegistry>,
        prefix: impl Into<String>,
        trace: Tracing,
    ) -> Self {
        Self {
            fleet,
            registry,
            prefix: prefix.into(),
            trace,
        }
    }

    /// Apply one event. Returns true when it released a slot.
    pub fn handle_event(&self, event: &LifecycleEvent) -> bool {
        if event.action != INSTANCE_DELETED {
            return false;
        }
        let Some(name) = event.instance_name() else {
            return false;
        };
        if !StringUtil::has_managed_prefix(name, &self.prefix) {
            return false;
        }

        match self.registry.release(name) {
            ReleaseOutcome::Released => {
                self.trace.info(&format!(
                    "Removing {} ({} workers)",
                    name,
                    self.registry.len()
                ));
                true
            }
            ReleaseOutcome::AlreadyReleased => {
                self.trace
                    .verbose(&format!("Duplicate deletion event for {}", name));
                false
            }
            ReleaseOutcome::Unknown => {
                self.trace
                    .verbose(&format!("Deleted instance {} was not registered", name));
                false
            }
        }
    }

    /// Follow the event stream until `shutdown`, resubscribing with backoff
    /// whenever the stream fails or ends.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut throttler = ErrorThrottler::new(self.trace.clone());
        self.trace.info("Watching fleet lifecycle events");

        loop {
            let subscribed = tokio::select! {
                s = self.fleet.subscribe_lifecycle_events() => s,
                _ = shutdown.cancelled() => break,
            };

            match subscribed {
                Ok(mut events) => {
                    self.trace.verbose("Event stream connected");
                    let mut healthy = false;
                    loop {
                        let next = tokio::select! {
                            n = events.next() => n,
                            _ = shutdown.cancelled() => return,
                        };
                        match next {
                            Some(Ok(event)) => {
                                if !healthy {
                                    throttler.reset();
                                    healthy = true;
                                }
                                self.handle_event(&event);
                            }
                            Some(Err(e)) => {
                                self.trace.warning(&format!("Event stream error: {}", e));
                                break;
                            }
                            None => {
                                self.trace.warning("Event stream closed");
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    self.trace
                        .error(&format!("Failed to subscribe to fleet events: {}", e));
                }
            }

            if !throttler.increment_and_wait(&shutdown).await {
                break;
            }
        }
        self.trace.info("Stopped watching fleet lifecycle events");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{deleted_event, job_for, trace_manager, FakeFleet};
    use tokio::sync::Notify;

    fn tracker(fleet: Arc<FakeFleet>) -> (PoolTracker, Arc<WorkerRegistry>) {
        let (manager, _) = trace_manager();
        let registry = Arc::new(WorkerRegistry::new(Arc::new(Notify::new())));
        let tracker = PoolTracker::new(fleet, registry.clone(), "lxdrunner", manager.get("Events"));
        (tracker, registry)
    }

    #[test]
    fn test_deletion_releases_once() {
        let (tracker, registry) = tracker(Arc::new(FakeFleet::default()));
        let (job, permit) = job_for("linux", 1);
        let slots = job.config.slots.clone();
        let name = job.instance_name.clone();
        registry.register(job, permit).unwrap();

        assert!(tracker.handle_event(&deleted_event(&name)));
        assert!(!tracker.handle_event(&deleted_event(&name)));
        assert_eq!(slots.available_permits(), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_foreign_and_other_events_ignored() {
        let (tracker, registry) = tracker(Arc::new(FakeFleet::default()));
        let (job, permit) = job_for("linux", 1);
        let name = job.instance_name.clone();
        registry.register(job, permit).unwrap();

        assert!(!tracker.handle_event(&deleted_event("webserver")));
        assert!(!tracker.handle_event(&LifecycleEvent {
            action: "instance-started".into(),
            source: format!("/1.0/instances/{}", name),
        }));
        assert!(!tracker.handle_event(&deleted_event("lxdrunner-000000")));
        assert!(registry.contains(&name));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_releases_and_resubscribes() {
        let fleet = Arc::new(FakeFleet::default());
        let (tracker, registry) = tracker(fleet.clone());
        let tracker = Arc::new(tracker);
        let shutdown = CancellationToken::new();

        let (a, pa) = job_for("linux", 2);
        let (b, pb) = job_for("linux", 2);
        let (name_a, name_b) = (a.instance_name.clone(), b.instance_name.clone());
        registry.register(a, pa).unwrap();
        registry.register(b, pb).unwrap();

        let handle = {
            let tracker = tracker.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { tracker.run(shutdown).await })
        };

        fleet.wait_for_subscribers(1).await;
        fleet.emit(deleted_event(&name_a));
        fleet.close_streams();

        // Reconnects after the backoff and keeps going.
        fleet.wait_for_subscribers(2).await;
        fleet.emit(deleted_event(&name_b));

        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while !registry.is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        shutdown.cancel();
        handle.await.unwrap();
    }
}
