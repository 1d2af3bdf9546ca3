// RunManager: wires the engine together and owns the process lifetime.
//
// Start-up order: the pool tracker subscribes first so no deletion event
// is missed, then the package cache is filled, stale runners are cleaned up
// and jobs queued while the engine was down are admitted. Only then do the
// dispatch loop and the scheduler start.

use crate::github_client::GitHubClient;
use crate::instance_launcher::InstanceLauncher;
use crate::job_queue::JobQueue;
use crate::lxd_client::LxdClient;
use crate::package_cache::PackageCache;
use crate::pool_tracker::PoolTracker;
use crate::reconciler::Reconciler;
use crate::token_cache::TokenCache;
use crate::worker_registry::WorkerRegistry;

use anyhow::{Context, Result};
use lxdrunner_common::constants::return_code;
use lxdrunner_common::{CiProvider, FleetApi, HostContext, ShutdownReason, Tracing};
use lxdrunner_sdk::TraceWriter;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// The engine's long-running components, bound to one pair of clients.
pub struct Engine {
    queue: Arc<JobQueue>,
    tracker: Arc<PoolTracker>,
    reconciler: Reconciler,
    trace: Tracing,
}

impl Engine {
    pub fn build(
        context: &HostContext,
        ci: Arc<dyn CiProvider>,
        fleet: Arc<dyn FleetApi>,
    ) -> Self {
        let config = context.config();
        let registry = Arc::new(WorkerRegistry::new(Arc::new(Notify::new())));
        let packages = Arc::new(PackageCache::new(
            config.package_dir(),
            ci.clone(),
            context.get_trace("PackageCache"),
        ));
        let tokens = TokenCache::new(
            ci.clone(),
            context.secret_masker().clone(),
            context.get_trace("TokenCache"),
        );
        let launcher = InstanceLauncher::new(
            fleet.clone(),
            config.remotes.clone(),
            config.cleanup,
            context.get_trace("Launcher"),
        );
        let queue = Arc::new(JobQueue::new(
            config,
            registry.clone(),
            tokens,
            packages.clone(),
            launcher,
            context.get_trace("JobQueue"),
        ));
        let tracker = Arc::new(PoolTracker::new(
            fleet.clone(),
            registry,
            config.prefix.as_str(),
            context.get_trace("PoolTracker"),
        ));
        let reconciler = Reconciler::new(
            ci,
            fleet,
            queue.clone(),
            packages,
            config.prefix.as_str(),
            context.get_trace("Reconciler"),
        );

        Self {
            queue,
            tracker,
            reconciler,
            trace: context.get_trace("Engine"),
        }
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    /// Fill the package cache, reconcile, and admit pending runs.
    pub async fn startup_init(&self) {
        self.reconciler.refresh_packages().await;
        self.reconciler.reconcile().await;
        let admitted = self.reconciler.submit_pending_runs().await;
        if admitted > 0 {
            self.trace
                .info(&format!("Admitted {} pending jobs", admitted));
        }
    }

    /// Run every component until `shutdown`, then wait for them to stop.
    pub async fn run(&self, shutdown: CancellationToken) {
        let tracker = {
            let tracker = self.tracker.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { tracker.run(shutdown).await })
        };

        self.startup_init().await;
        self.trace.info(&format!("Engine started ({})", self.queue.status()));

        tokio::join!(
            self.queue.clone().run(shutdown.clone()),
            self.reconciler.run(shutdown.clone()),
        );
        if let Err(e) = tracker.await {
            self.trace.error(&format!("Pool tracker failed: {}", e));
        }
        self.trace.info(&format!("Engine stopped ({})", self.queue.status()));
    }
}

pub struct RunManager {
    context: Arc<HostContext>,
    trace: Tracing,
}

impl RunManager {
    pub fn new(context: Arc<HostContext>) -> Self {
        let trace = context.get_trace("RunManager");
        Self { context, trace }
    }

    /// Connect to both APIs and run until a shutdown signal arrives.
    pub async fn run(&self) -> Result<i32> {
        let config = self.context.config().clone();

        let ci: Arc<dyn CiProvider> = Arc::new(
            GitHubClient::new(&config.api_url, &config.pat)
                .context("failed to create CI provider client")?,
        );
        let remote = config.main_remote()?;
        let fleet: Arc<dyn FleetApi> = Arc::new(
            LxdClient::new(remote).context("failed to create fleet client")?,
        );
        self.trace.info(&format!(
            "Connecting to fleet at {}",
            remote.addr.as_deref().unwrap_or_default()
        ));
        if !config.cleanup {
            self.trace
                .warning("Cleanup disabled: failed instances are kept for inspection");
        }

        self.install_signal_handlers();

        let engine = Engine::build(&self.context, ci, fleet);
        engine.run(self.context.shutdown_token()).await;

        Ok(match self.context.shutdown_reason() {
            Some(ShutdownReason::Fatal) => return_code::TERMINATED_ERROR,
            _ => return_code::SUCCESS,
        })
    }

    fn install_signal_handlers(&self) {
        let context = self.context.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    tracing::info!("Ctrl-C received, shutting down");
                    context.shutdown(ShutdownReason::UserCancelled);
                }
                Err(e) => tracing::error!("Failed to listen for Ctrl-C: {}", e),
            }
        });

        #[cfg(unix)]
        {
            let context = self.context.clone();
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                match signal(SignalKind::terminate()) {
                    Ok(mut sigterm) => {
                        sigterm.recv().await;
                        tracing::info!("SIGTERM received, shutting down");
                        context.shutdown(ShutdownReason::Terminated);
                    }
                    Err(e) => tracing::error!("Failed to listen for SIGTERM: {}", e),
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{
        app_config, release, trace_manager, FakeCi, FakeFleet, LINUX_X64_ASSET,
    };
    use lxdrunner_common::{QueuedJob, RepoRef, RunnerArch};
    use std::time::Duration;

    #[tokio::test]
    async fn test_engine_admits_pending_runs_and_stops_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _sink) = trace_manager();
        let context =
            HostContext::with_trace_manager(app_config(dir.path(), 2, RunnerArch::X64), manager);

        let ci = Arc::new(FakeCi::default());
        ci.set_releases(vec![release("v2.300.0", &[LINUX_X64_ASSET])]);
        let repo = RepoRef {
            owner: "octo".into(),
            name: "widgets".into(),
            owner_is_org: false,
        };
        ci.set_repos(vec![repo.clone()]);
        ci.set_queued_jobs(
            &repo,
            vec![QueuedJob {
                id: 11,
                labels: vec!["self-hosted".into(), "linux".into()],
            }],
        );
        let fleet = Arc::new(FakeFleet::default());

        let engine = Arc::new(Engine::build(&context, ci.clone(), fleet.clone()));
        let handle = {
            let engine = engine.clone();
            let shutdown = context.shutdown_token();
            tokio::spawn(async move { engine.run(shutdown).await })
        };

        tokio::time::timeout(Duration::from_secs(10), async {
            while fleet.create_calls() == 0 || engine.queue().registry().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("pending job launched");
        fleet.wait_for_subscribers(1).await;

        context.shutdown(ShutdownReason::UserCancelled);
        tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .expect("engine stopped")
            .unwrap();
        assert_eq!(context.shutdown_reason(), Some(ShutdownReason::UserCancelled));
    }

    #[tokio::test]
    async fn test_startup_warms_package_cache() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _sink) = trace_manager();
        let context =
            HostContext::with_trace_manager(app_config(dir.path(), 1, RunnerArch::X64), manager);
        let ci = Arc::new(FakeCi::default());
        ci.set_releases(vec![release("v2.300.0", &[LINUX_X64_ASSET])]);

        let engine = Engine::build(&context, ci.clone(), Arc::new(FakeFleet::default()));
        engine.startup_init().await;

        assert_eq!(ci.downloads(), 1);
        assert_eq!(ci.org_requests(), 1);
        assert!(dir.path().join("pkgs").join(LINUX_X64_ASSET).is_file());
    }
}
