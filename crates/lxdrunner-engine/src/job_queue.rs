// JobQueue: admission control and the dispatch loop.
//
// Jobs are matched to a runner configuration by exact label set and queued
// FIFO per configuration. The dispatch loop takes a pool slot without
// blocking, registers the worker, and runs its lifecycle as a tracked task.

use crate::instance_launcher::InstanceLauncher;
use crate::job_event::{JobEvent, RunnerConfiguration};
use crate::package_cache::PackageCache;
use crate::token_cache::TokenCache;
use crate::worker_registry::{ReleaseOutcome, WorkerRegistry};

use lxdrunner_common::constants::{QUEUE_POLL_INTERVAL, SHUTDOWN_GRACE_PERIOD};
use lxdrunner_common::{AdmissionError, AppConfig, DispatchError, JobRequest, LabelSet, Tracing};
use lxdrunner_sdk::{StringUtil, TraceWriter};

use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Outcome of one lifecycle task as seen by the supervisor.
type TaskOutcome = (String, std::thread::Result<Result<(), DispatchError>>);

/// Queue and worker counts for status logging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStatus {
    pub queued: usize,
    pub workers: usize,
    /// Live workers per configuration name.
    pub per_config: BTreeMap<String, usize>,
}

impl std::fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} queued, {} workers", self.queued, self.workers)?;
        if !self.per_config.is_empty() {
            let counts: Vec<String> = self
                .per_config
                .iter()
                .map(|(name, n)| format!("{}: {}", name, n))
                .collect();
            write!(f, " [{}]", counts.join(", "))?;
        }
        Ok(())
    }
}

/// Build one `RunnerConfiguration` per runnermap entry.
pub fn build_configurations(config: &AppConfig) -> Vec<Arc<RunnerConfiguration>> {
    config
        .runnermap
        .iter()
        .map(|rc| Arc::new(RunnerConfiguration::new(rc.clone(), config.max_workers_for(rc))))
        .collect()
}

pub struct JobQueue {
    configs: Vec<Arc<RunnerConfiguration>>,
    by_labels: HashMap<LabelSet, usize>,
    // One queue per entry of `configs`.
    queues: Mutex<Vec<VecDeque<JobEvent>>>,
    registry: Arc<WorkerRegistry>,
    wake: Arc<Notify>,
    // Lifecycle tasks allowed to run remote calls at once.
    workers: Arc<Semaphore>,
    tokens: TokenCache,
    packages: Arc<PackageCache>,
    launcher: InstanceLauncher,
    prefix: String,
    github_url: String,
    trace: Tracing,
}

impl JobQueue {
    pub fn new(
        config: &AppConfig,
        registry: Arc<WorkerRegistry>,
        tokens: TokenCache,
        packages: Arc<PackageCache>,
        launcher: InstanceLauncher,
        trace: Tracing,
    ) -> Self {
        let configs = build_configurations(config);
        let by_labels = configs
            .iter()
            .enumerate()
            .map(|(i, rc)| (rc.labels().clone(), i))
            .collect();
        let queues = Mutex::new(vec![VecDeque::new(); configs.len()]);
        Self {
            by_labels,
            queues,
            wake: registry.released_signal(),
            registry,
            workers: Arc::new(Semaphore::new(config.max_workers)),
            configs,
            tokens,
            packages,
            launcher,
            prefix: config.prefix.clone(),
            github_url: config.github_url.clone(),
            trace,
        }
    }

    pub fn configurations(&self) -> &[Arc<RunnerConfiguration>] {
        &self.configs
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    // -----------------------------------------------------------------------
    // Admission
    // -----------------------------------------------------------------------

    /// Admit a job. Returns the name its instance will get. A label set with
    /// no exactly matching configuration is logged and dropped.
    pub fn submit(&self, request: &JobRequest) -> Result<String, AdmissionError> {
        let labels = request.label_set();
        let Some(&index) = self.by_labels.get(&labels) else {
            self.trace.warning(&format!(
                "No runner configuration matches labels {} ({}/{}), dropping job",
                labels, request.owner, request.repo
            ));
            return Err(AdmissionError::NoMatchingConfig(labels));
        };

        let rc = self.configs[index].clone();
        let job = JobEvent::new(request, rc.clone(), &self.prefix, &self.github_url);
        let name = job.instance_name.clone();
        self.trace.info(&format!(
            "Queued {} for {} job {} ({})",
            name,
            job.target(),
            job.job_id.map(|id| id.to_string()).unwrap_or_else(|| "-".into()),
            rc.name()
        ));
        self.queues.lock()[index].push_back(job);
        self.wake.notify_one();
        Ok(name)
    }

    /// Jobs waiting for a slot, per configuration name.
    pub fn queued(&self, config_name: &str) -> usize {
        let queues = self.queues.lock();
        self.configs
            .iter()
            .zip(queues.iter())
            .filter(|(rc, _)| rc.name() == config_name)
            .map(|(_, q)| q.len())
            .sum()
    }

    pub fn status(&self) -> QueueStatus {
        QueueStatus {
            queued: self.queues.lock().iter().map(VecDeque::len).sum(),
            workers: self.registry.len(),
            per_config: self.registry.counts_by_config(),
        }
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    /// Pop, oldest first, every queued job whose configuration has a free
    /// slot, and register it as a worker holding that slot. Configurations
    /// without a free slot are skipped.
    pub fn take_dispatchable(&self) -> Vec<JobEvent> {
        let mut queues = self.queues.lock();
        let mut ready = Vec::new();
        for (rc, queue) in self.configs.iter().zip(queues.iter_mut()) {
            while !queue.is_empty() {
                let Ok(permit) = rc.slots.clone().try_acquire_owned() else {
                    break;
                };
                if let Some(mut job) = queue.pop_front() {
                    let mut permit = permit;
                    while let Err(taken) = self.registry.register(job.clone(), permit) {
                        let fresh = StringUtil::make_instance_name(&self.prefix);
                        self.trace.warning(&format!(
                            "Instance name {} already in use, renaming to {}",
                            job.instance_name, fresh
                        ));
                        permit = taken.permit;
                        job.instance_name = fresh;
                    }
                    ready.push(job);
                }
            }
        }
        ready
    }

    /// Run the dispatch loop until `shutdown`, then give in-flight lifecycle
    /// tasks a grace period to finish.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut tasks: JoinSet<TaskOutcome> = JoinSet::new();
        self.trace.info("Dispatch loop started");

        loop {
            for job in self.take_dispatchable() {
                let queue = self.clone();
                tasks.spawn(async move {
                    let name = job.instance_name.clone();
                    let result = AssertUnwindSafe(queue.dispatch_job(job)).catch_unwind().await;
                    (name, result)
                });
            }

            tokio::select! {
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(QUEUE_POLL_INTERVAL) => {}
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => self.reap(joined),
                _ = shutdown.cancelled() => break,
            }
        }

        if !tasks.is_empty() {
            self.trace.info(&format!(
                "Waiting up to {}s for {} lifecycle tasks",
                SHUTDOWN_GRACE_PERIOD.as_secs(),
                tasks.len()
            ));
            let drained = tokio::time::timeout(SHUTDOWN_GRACE_PERIOD, async {
                while let Some(joined) = tasks.join_next().await {
                    self.reap(joined);
                }
            })
            .await;
            if drained.is_err() {
                self.trace.warning(&format!(
                    "Abandoning {} lifecycle tasks at shutdown",
                    tasks.len()
                ));
                tasks.abort_all();
            }
        }
        self.trace.info("Dispatch loop stopped");
    }

    /// Log a finished lifecycle task.
    fn reap(&self, joined: Result<TaskOutcome, tokio::task::JoinError>) {
        match joined {
            Ok((name, Ok(Ok(())))) => {
                self.trace
                    .info(&format!("{} is running ({})", name, self.status()));
            }
            Ok((name, Ok(Err(e)))) => {
                self.trace.error(&format!("Job for {} failed: {}", name, e));
            }
            Ok((name, Err(_))) => {
                // Whether an instance exists is unknown; slot reconciliation
                // releases the slot if it does not.
                self.trace
                    .error(&format!("Lifecycle task for {} panicked", name));
                self.registry.mark_settled(&name);
            }
            Err(e) => {
                self.trace.error(&format!("Lifecycle task aborted: {}", e));
            }
        }
    }

    /// Fetch a token, attach the package and run the lifecycle. Releases the
    /// slot itself when no deletion event will arrive for the instance.
    pub async fn dispatch_job(&self, mut job: JobEvent) -> Result<(), DispatchError> {
        let _worker = self.workers.clone().acquire_owned().await.ok();
        let name = job.instance_name.clone();
        self.trace.info(&format!(
            "Dispatching {} after {:.1}s in queue",
            name,
            job.queued_at.elapsed().as_secs_f64()
        ));

        let outcome = match self.prepare(&mut job).await {
            Err(e) => Err((e, true)),
            Ok(package) => self
                .launcher
                .run(&job, package)
                .await
                .map_err(|f| (DispatchError::Lifecycle(f.error), f.release_slot)),
        };

        match outcome {
            Ok(()) => {
                self.registry.mark_settled(&name);
                Ok(())
            }
            Err((error, release_slot)) => {
                if release_slot {
                    if self.registry.release(&name) == ReleaseOutcome::Released {
                        self.trace.info(&format!("Released slot of {}", name));
                    }
                } else {
                    self.registry.mark_settled(&name);
                }
                Err(error)
            }
        }
    }

    /// Attach a registration token and select the package. Returns the
    /// package contents.
    async fn prepare(&self, job: &mut JobEvent) -> Result<Vec<u8>, DispatchError> {
        let token = self
            .tokens
            .token(&job.scope)
            .await
            .map_err(|source| DispatchError::Token {
                scope: job.target(),
                source,
            })?;
        job.token = Some(token);

        let rc = &job.config.config;
        let package = self
            .packages
            .select(rc.runner_os.as_str(), rc.runner_arch.as_str())?;
        let bytes = self.packages.read(&package).await?;
        job.package = Some(package);
        Ok(bytes)
    }
}
