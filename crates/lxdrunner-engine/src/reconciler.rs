// Reconciler: periodic housekeeping.
//  - de-registers offline runners left behind by deleted instances
//  - returns slots whose instance vanished without a deletion event
//  - keeps the package cache current
//  - at start-up, admits jobs that were queued while the engine was down

use crate::job_queue::JobQueue;
use crate::package_cache::PackageCache;
use crate::worker_registry::ReleaseOutcome;

use lxdrunner_common::constants::{PACKAGE_REFRESH_INTERVAL, RECONCILE_INTERVAL};
use lxdrunner_common::{CiError, CiProvider, FleetApi, JobRequest, Scope, Tracing};
use lxdrunner_sdk::{StringUtil, TraceWriter};

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Counts from one reconcile pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub runners_removed: usize,
    pub slots_released: usize,
}

pub struct Reconciler {
    ci: Arc<dyn CiProvider>,
    fleet: Arc<dyn FleetApi>,
    queue: Arc<JobQueue>,
    packages: Arc<PackageCache>,
    prefix: String,
    trace: Tracing,
}

impl Reconciler {
    pub fn new(
        ci: Arc<dyn CiProvider>,
        fleet: Arc<dyn FleetApi>,
        queue: Arc<JobQueue>,
        packages: Arc<PackageCache>,
        prefix: impl Into<String>,
        trace: Tracing,
    ) -> Self {
        Self {
            ci,
            fleet,
            queue,
            packages,
            prefix: prefix.into(),
            trace,
        }
    }

    /// One full reconcile pass. Failures are logged; nothing propagates.
    pub async fn reconcile(&self) -> ReconcileReport {
        let report = ReconcileReport {
            runners_removed: self.cleanup_runners().await,
            slots_released: self.reconcile_slots().await,
        };
        self.trace.info(&format!(
            "Reconciled: {} offline runners removed, {} slots released, {}",
            report.runners_removed,
            report.slots_released,
            self.queue.status()
        ));
        report
    }

    // -----------------------------------------------------------------------
    // Offline runners
    // -----------------------------------------------------------------------

    /// Every scope whose runners we may have registered: the user's orgs and
    /// the user-owned repositories.
    async fn runner_scopes(&self) -> Vec<Scope> {
        let mut scopes = Vec::new();
        match self.ci.list_orgs().await {
            Ok(orgs) => scopes.extend(orgs.into_iter().map(Scope::Org)),
            Err(e) => self.trace.error(&format!("Listing organizations failed: {}", e)),
        }
        match self.ci.list_user_repos().await {
            Ok(repos) => scopes.extend(repos.into_iter().filter(|r| !r.owner_is_org).map(|r| {
                Scope::Repo {
                    owner: r.owner,
                    repo: r.name,
                }
            })),
            Err(e) => self.trace.error(&format!("Listing repositories failed: {}", e)),
        }
        scopes
    }

    /// Delete offline runners carrying the managed prefix. Returns how many
    /// were removed.
    pub async fn cleanup_runners(&self) -> usize {
        let mut removed = 0;
        for scope in self.runner_scopes().await {
            let runners = match self.ci.list_runners(&scope).await {
                Ok(runners) => runners,
                Err(CiError::Forbidden(_)) => {
                    self.trace
                        .warning(&format!("Get Runners: Access Denied {}", scope));
                    continue;
                }
                Err(e) => {
                    self.trace
                        .error(&format!("Listing runners of {} failed: {}", scope, e));
                    continue;
                }
            };

            for runner in runners
                .iter()
                .filter(|r| r.is_offline() && StringUtil::has_managed_prefix(&r.name, &self.prefix))
            {
                self.trace.info(&format!(
                    "Remove offline runner {} {} ({})",
                    scope, runner.id, runner.name
                ));
                match self.ci.delete_runner(&scope, runner.id).await {
                    Ok(()) => removed += 1,
                    Err(e) => self.trace.error(&format!(
                        "Removing runner {} from {} failed: {}",
                        runner.id, scope, e
                    )),
                }
            }
        }
        removed
    }

    // -----------------------------------------------------------------------
    // Slots
    // -----------------------------------------------------------------------

    /// Release settled workers whose instance no longer exists. Workers still
    /// launching are left alone.
    pub async fn reconcile_slots(&self) -> usize {
        let registry = self.queue.registry();
        let settled = registry.settled_names();
        if settled.is_empty() {
            return 0;
        }

        let live: HashSet<String> = match self.fleet.list_instances().await {
            Ok(names) => names.into_iter().collect(),
            Err(e) => {
                self.trace
                    .error(&format!("Listing instances failed, skipping slot check: {}", e));
                return 0;
            }
        };

        let mut released = 0;
        for name in settled.iter().filter(|n| !live.contains(*n)) {
            // A deletion event may have released it since the snapshot.
            if registry.release(name) == ReleaseOutcome::Released {
                self.trace
                    .warning(&format!("Released slot of vanished instance {}", name));
                released += 1;
            }
        }
        released
    }

    // -----------------------------------------------------------------------
    // Pending runs
    // -----------------------------------------------------------------------

    /// Admit every job queued at the CI provider. Returns how many were
    /// accepted.
    pub async fn submit_pending_runs(&self) -> usize {
        let repos = match self.ci.list_user_repos().await {
            Ok(repos) => repos,
            Err(e) => {
                self.trace
                    .error(&format!("Listing repositories failed: {}", e));
                return 0;
            }
        };

        let mut requests = Vec::new();
        for repo in &repos {
            match self.ci.list_queued_jobs(repo).await {
                Ok(jobs) => requests.extend(jobs.into_iter().map(|job| JobRequest {
                    owner: repo.owner.clone(),
                    repo: repo.name.clone(),
                    org: repo.owner_is_org.then(|| repo.owner.clone()),
                    labels: job.labels,
                    job_id: Some(job.id),
                })),
                Err(e) => self.trace.warning(&format!(
                    "Listing queued runs of {}/{} failed: {}",
                    repo.owner, repo.name, e
                )),
            }
        }

        self.trace
            .warning(&format!("Submitted {} pending run events", requests.len()));
        requests
            .iter()
            .filter(|r| self.queue.submit(r).is_ok())
            .count()
    }

    // -----------------------------------------------------------------------
    // Schedules
    // -----------------------------------------------------------------------

    /// Refresh the package cache, logging the outcome.
    pub async fn refresh_packages(&self) {
        if let Err(e) = self.packages.refresh().await {
            self.trace.error_err(&e);
        }
    }

    /// Run the refresh and reconcile timers until `shutdown`. The start-up
    /// pass has already run, so the first tick of each is one period out.
    pub async fn run(&self, shutdown: CancellationToken) {
        self.run_with_periods(PACKAGE_REFRESH_INTERVAL, RECONCILE_INTERVAL, shutdown)
            .await
    }

    pub async fn run_with_periods(
        &self,
        refresh_every: Duration,
        reconcile_every: Duration,
        shutdown: CancellationToken,
    ) {
        let mut refresh = interval_at(Instant::now() + refresh_every, refresh_every);
        refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut reconcile = interval_at(Instant::now() + reconcile_every, reconcile_every);
        reconcile.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = refresh.tick() => self.refresh_packages().await,
                _ = reconcile.tick() => { self.reconcile().await; }
                _ = shutdown.cancelled() => break,
            }
        }
        self.trace.info("Scheduler stopped");
    }
}
