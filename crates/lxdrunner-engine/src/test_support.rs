// In-memory CiProvider and FleetApi doubles plus fixtures for engine tests.

use crate::instance_launcher::InstanceLauncher;
use crate::job_event::{JobEvent, RunnerConfiguration};
use crate::job_queue::JobQueue;
use crate::package_cache::PackageCache;
use crate::token_cache::TokenCache;
use crate::worker_registry::WorkerRegistry;

use lxdrunner_common::{
    AppConfig, CiError, CiProvider, ExecOutput, FleetApi, FleetError, InstanceSpec, InstanceType,
    JobRequest, LabelSet, LifecycleEvent, QueuedJob, RegistrationToken, Release, ReleaseAsset,
    RemoteConfig, RepoRef, RunnerArch, RunnerConfig, RunnerInfo, RunnerOs, RunnerPackage, Scope,
    SecretMasker, TraceManager,
};
use lxdrunner_sdk::CollectingTraceWriter;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::channel::mpsc::{unbounded, UnboundedSender};
use futures::stream::BoxStream;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{watch, Notify, OwnedSemaphorePermit};

pub const LINUX_X64_ASSET: &str = "actions-runner-linux-x64-2.300.0.tar.gz";

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

pub fn trace_manager() -> (TraceManager, Arc<CollectingTraceWriter>) {
    let sink = Arc::new(CollectingTraceWriter::new());
    let manager = TraceManager::with_sink(Arc::new(SecretMasker::new()), sink.clone());
    (manager, sink)
}

pub fn runner_config(name: &str, labels: &[&str]) -> RunnerConfig {
    RunnerConfig {
        name: name.to_string(),
        labels: LabelSet::new(labels.iter().copied()),
        image: "jammy".into(),
        profiles: vec!["default".into()],
        runner_os: RunnerOs::Linux,
        runner_arch: RunnerArch::X64,
        instance_type: InstanceType::Container,
        setup_script: "setup.sh".into(),
        max_workers: None,
    }
}

pub fn remotes() -> HashMap<String, RemoteConfig> {
    let remote = |addr: &str, protocol: &str| RemoteConfig {
        addr: Some(addr.to_string()),
        protocol: protocol.to_string(),
        verify: false,
        cert: None,
        key: None,
    };
    HashMap::from([
        ("main".to_string(), remote("https://127.0.0.1:8443", "lxd")),
        (
            "images".to_string(),
            remote("https://images.linuxcontainers.org", "simplestreams"),
        ),
    ])
}

/// Configuration with one `linux` runner for `{self-hosted, linux}` whose
/// setup script and package cache live under `dir`.
pub fn app_config(dir: &Path, max_workers: usize, arch: RunnerArch) -> AppConfig {
    let script = dir.join("setup.sh");
    std::fs::write(&script, "#!/bin/sh\nexit 0\n").expect("write setup script");

    let mut rc = runner_config("linux", &["self-hosted", "linux"]);
    rc.setup_script = script;
    rc.runner_arch = arch;
    rc.max_workers = Some(max_workers);

    AppConfig {
        pat: "ghp_harness".into(),
        prefix: "lxdrunner".into(),
        pkgdir: Some(dir.join("pkgs")),
        max_workers: 10,
        cleanup: true,
        remotes: remotes(),
        runnermap: vec![rc],
        github_url: "https://github.com/".into(),
        api_url: "https://api.github.com/".into(),
    }
}

pub fn job_request(labels: &[&str]) -> JobRequest {
    JobRequest {
        owner: "octo".into(),
        repo: "widgets".into(),
        org: None,
        labels: labels.iter().map(|l| l.to_string()).collect(),
        job_id: Some(7),
    }
}

/// A registered-style job plus the slot it holds.
pub fn job_for(config_name: &str, max_workers: usize) -> (JobEvent, OwnedSemaphorePermit) {
    let rc = Arc::new(RunnerConfiguration::new(
        runner_config(config_name, &["self-hosted", "linux"]),
        max_workers,
    ));
    let permit = rc
        .slots
        .clone()
        .try_acquire_owned()
        .expect("fresh configuration has a free slot");
    let job = JobEvent::new(
        &job_request(&["self-hosted", "linux"]),
        rc,
        "lxdrunner",
        "https://github.com/",
    );
    (job, permit)
}

/// A job ready for the launcher: token and package attached, setup script
/// written under `dir`.
pub fn dispatched_job(dir: &Path, image: &str) -> JobEvent {
    let script = dir.join("setup.sh");
    std::fs::write(&script, "#!/bin/sh\nexit 0\n").expect("write setup script");
    let mut rc = runner_config("linux", &["self-hosted", "linux"]);
    rc.image = image.to_string();
    rc.setup_script = script;
    let rc = Arc::new(RunnerConfiguration::new(rc, 1));
    let mut job = JobEvent::new(
        &job_request(&["self-hosted", "linux"]),
        rc,
        "lxdrunner",
        "https://github.com/",
    );
    job.token = Some("REGTOKEN".into());
    job.package = Some(RunnerPackage {
        os: "linux".into(),
        architecture: "x64".into(),
        version: "2.300.0".into(),
        filename: LINUX_X64_ASSET.into(),
        linkname: "actions-runner-linux-x64-latest".into(),
        download_url: format!("https://downloads.test/{}", LINUX_X64_ASSET),
    });
    job
}

pub fn deleted_event(name: &str) -> LifecycleEvent {
    LifecycleEvent {
        action: "instance-deleted".into(),
        source: format!("/1.0/instances/{}", name),
    }
}

pub fn release(tag: &str, assets: &[&str]) -> Release {
    Release {
        tag_name: tag.to_string(),
        prerelease: false,
        draft: false,
        assets: assets
            .iter()
            .map(|name| ReleaseAsset {
                name: name.to_string(),
                browser_download_url: format!("https://downloads.test/{}/{}", tag, name),
            })
            .collect(),
    }
}

// ---------------------------------------------------------------------------
// FakeCi
// ---------------------------------------------------------------------------

#[derive(Default)]
struct CiState {
    token_requests: usize,
    fail_tokens: bool,
    token_expiry: Option<DateTime<Utc>>,
    releases: Vec<Release>,
    release_requests: usize,
    failing_downloads: HashSet<String>,
    downloads: usize,
    orgs: Vec<String>,
    org_requests: usize,
    repos: Vec<RepoRef>,
    runners: HashMap<Scope, Vec<RunnerInfo>>,
    forbidden: HashSet<Scope>,
    deleted: Vec<(Scope, u64)>,
    queued: HashMap<(String, String), Vec<QueuedJob>>,
}

#[derive(Default)]
pub struct FakeCi {
    state: Mutex<CiState>,
}

impl FakeCi {
    pub fn token_requests(&self) -> usize {
        self.state.lock().token_requests
    }

    pub fn fail_tokens(&self, fail: bool) {
        self.state.lock().fail_tokens = fail;
    }

    /// Expiry of tokens issued from now on. Defaults to one hour after issue.
    pub fn set_token_expiry(&self, at: DateTime<Utc>) {
        self.state.lock().token_expiry = Some(at);
    }

    pub fn set_releases(&self, releases: Vec<Release>) {
        self.state.lock().releases = releases;
    }

    pub fn release_requests(&self) -> usize {
        self.state.lock().release_requests
    }

    pub fn fail_download(&self, filename: &str) {
        self.state.lock().failing_downloads.insert(filename.to_string());
    }

    pub fn downloads(&self) -> usize {
        self.state.lock().downloads
    }

    pub fn set_orgs(&self, orgs: Vec<String>) {
        self.state.lock().orgs = orgs;
    }

    pub fn org_requests(&self) -> usize {
        self.state.lock().org_requests
    }

    pub fn set_repos(&self, repos: Vec<RepoRef>) {
        self.state.lock().repos = repos;
    }

    pub fn set_runners(&self, scope: &Scope, runners: Vec<RunnerInfo>) {
        self.state.lock().runners.insert(scope.clone(), runners);
    }

    pub fn forbid(&self, scope: &Scope) {
        self.state.lock().forbidden.insert(scope.clone());
    }

    pub fn deleted_runners(&self) -> Vec<(Scope, u64)> {
        self.state.lock().deleted.clone()
    }

    pub fn set_queued_jobs(&self, repo: &RepoRef, jobs: Vec<QueuedJob>) {
        self.state
            .lock()
            .queued
            .insert((repo.owner.clone(), repo.name.clone()), jobs);
    }
}

#[async_trait]
impl CiProvider for FakeCi {
    async fn issue_registration_token(
        &self,
        scope: &Scope,
    ) -> Result<RegistrationToken, CiError> {
        let mut state = self.state.lock();
        state.token_requests += 1;
        if state.fail_tokens {
            return Err(CiError::Api {
                status: 500,
                message: format!("token for {} unavailable", scope),
            });
        }
        Ok(RegistrationToken {
            token: format!("REGTOKEN-{}", state.token_requests),
            expires_at: state
                .token_expiry
                .unwrap_or_else(|| Utc::now() + chrono::Duration::hours(1)),
        })
    }

    async fn list_releases(&self, _owner: &str, _repo: &str) -> Result<Vec<Release>, CiError> {
        let mut state = self.state.lock();
        state.release_requests += 1;
        Ok(state.releases.clone())
    }

    async fn list_runners(&self, scope: &Scope) -> Result<Vec<RunnerInfo>, CiError> {
        let state = self.state.lock();
        if state.forbidden.contains(scope) {
            return Err(CiError::Forbidden(scope.to_string()));
        }
        Ok(state.runners.get(scope).cloned().unwrap_or_default())
    }

    async fn delete_runner(&self, scope: &Scope, runner_id: u64) -> Result<(), CiError> {
        self.state.lock().deleted.push((scope.clone(), runner_id));
        Ok(())
    }

    async fn list_orgs(&self) -> Result<Vec<String>, CiError> {
        let mut state = self.state.lock();
        state.org_requests += 1;
        Ok(state.orgs.clone())
    }

    async fn list_user_repos(&self) -> Result<Vec<RepoRef>, CiError> {
        Ok(self.state.lock().repos.clone())
    }

    async fn list_queued_jobs(&self, repo: &RepoRef) -> Result<Vec<QueuedJob>, CiError> {
        Ok(self
            .state
            .lock()
            .queued
            .get(&(repo.owner.clone(), repo.name.clone()))
            .cloned()
            .unwrap_or_default())
    }

    async fn download_asset(&self, url: &str) -> Result<Bytes, CiError> {
        let filename = url.rsplit('/').next().unwrap_or_default().to_string();
        let mut state = self.state.lock();
        if state.failing_downloads.contains(&filename) {
            return Err(CiError::Api {
                status: 502,
                message: format!("download of {} failed", filename),
            });
        }
        state.downloads += 1;
        Ok(Bytes::from(filename))
    }
}

// ---------------------------------------------------------------------------
// FakeFleet
// ---------------------------------------------------------------------------

struct FleetState {
    images: HashSet<String>,
    profiles: HashSet<String>,
    instances: HashSet<String>,
    specs: HashMap<String, InstanceSpec>,
    pushed: HashMap<String, Vec<String>>,
    exec_env: HashMap<String, BTreeMap<String, String>>,
    create_calls: usize,
    delete_calls: usize,
    mkdir_calls: usize,
    force_stops: usize,
    fail_create: bool,
    fail_start: bool,
    fail_delete: bool,
    fail_list: bool,
    mkdir_failures: usize,
    exec_exit_code: i32,
    panic_on_exec: bool,
    subscribers: Vec<UnboundedSender<Result<LifecycleEvent, FleetError>>>,
}

impl Default for FleetState {
    fn default() -> Self {
        Self {
            images: HashSet::from(["jammy".to_string()]),
            profiles: HashSet::from(["default".to_string()]),
            instances: HashSet::new(),
            specs: HashMap::new(),
            pushed: HashMap::new(),
            exec_env: HashMap::new(),
            create_calls: 0,
            delete_calls: 0,
            mkdir_calls: 0,
            force_stops: 0,
            fail_create: false,
            fail_start: false,
            fail_delete: false,
            fail_list: false,
            mkdir_failures: 0,
            exec_exit_code: 0,
            panic_on_exec: false,
            subscribers: Vec::new(),
        }
    }
}

impl FleetState {
    fn remove_and_announce(&mut self, name: &str) {
        self.instances.remove(name);
        let event = deleted_event(name);
        self.subscribers
            .retain(|tx| tx.unbounded_send(Ok(event.clone())).is_ok());
    }
}

pub struct FakeFleet {
    state: Mutex<FleetState>,
    subscriptions: watch::Sender<usize>,
}

impl Default for FakeFleet {
    fn default() -> Self {
        Self {
            state: Mutex::new(FleetState::default()),
            subscriptions: watch::channel(0).0,
        }
    }
}

fn not_found(name: &str) -> FleetError {
    FleetError::NotFound(format!("instance {}", name))
}

impl FakeFleet {
    pub fn remove_image(&self, alias: &str) {
        self.state.lock().images.remove(alias);
    }

    pub fn remove_profile(&self, profile: &str) {
        self.state.lock().profiles.remove(profile);
    }

    pub fn fail_create(&self, fail: bool) {
        self.state.lock().fail_create = fail;
    }

    pub fn fail_start(&self, fail: bool) {
        self.state.lock().fail_start = fail;
    }

    pub fn fail_delete(&self, fail: bool) {
        self.state.lock().fail_delete = fail;
    }

    pub fn fail_list(&self, fail: bool) {
        self.state.lock().fail_list = fail;
    }

    /// Fail the next `count` mkdir calls as if the guest agent were down.
    pub fn set_mkdir_failures(&self, count: usize) {
        self.state.lock().mkdir_failures = count;
    }

    pub fn set_exec_exit_code(&self, code: i32) {
        self.state.lock().exec_exit_code = code;
    }

    pub fn panic_on_exec(&self, panic: bool) {
        self.state.lock().panic_on_exec = panic;
    }

    pub fn add_instance(&self, name: &str) {
        self.state.lock().instances.insert(name.to_string());
    }

    /// Drop an instance without announcing it.
    pub fn remove_instance(&self, name: &str) {
        self.state.lock().instances.remove(name);
    }

    pub fn instance_exists(&self, name: &str) -> bool {
        self.state.lock().instances.contains(name)
    }

    pub fn created_spec(&self, name: &str) -> Option<InstanceSpec> {
        self.state.lock().specs.get(name).cloned()
    }

    pub fn pushed_paths(&self, name: &str) -> Vec<String> {
        self.state.lock().pushed.get(name).cloned().unwrap_or_default()
    }

    pub fn exec_env(&self, name: &str) -> Option<BTreeMap<String, String>> {
        self.state.lock().exec_env.get(name).cloned()
    }

    pub fn create_calls(&self) -> usize {
        self.state.lock().create_calls
    }

    pub fn delete_calls(&self) -> usize {
        self.state.lock().delete_calls
    }

    pub fn mkdir_calls(&self) -> usize {
        self.state.lock().mkdir_calls
    }

    pub fn force_stops(&self) -> usize {
        self.state.lock().force_stops
    }

    /// Send an event to every open subscription.
    pub fn emit(&self, event: LifecycleEvent) {
        self.state
            .lock()
            .subscribers
            .retain(|tx| tx.unbounded_send(Ok(event.clone())).is_ok());
    }

    /// End every open subscription stream.
    pub fn close_streams(&self) {
        self.state.lock().subscribers.clear();
    }

    /// Wait until `count` subscriptions have been opened in total.
    pub async fn wait_for_subscribers(&self, count: usize) {
        let mut rx = self.subscriptions.subscribe();
        let _ = rx.wait_for(|n| *n >= count).await;
    }
}

#[async_trait]
impl FleetApi for FakeFleet {
    async fn image_alias_exists(&self, alias: &str) -> Result<bool, FleetError> {
        Ok(self.state.lock().images.contains(alias))
    }

    async fn profile_exists(&self, profile: &str) -> Result<bool, FleetError> {
        Ok(self.state.lock().profiles.contains(profile))
    }

    async fn list_instances(&self) -> Result<Vec<String>, FleetError> {
        let state = self.state.lock();
        if state.fail_list {
            return Err(FleetError::Api {
                status: 503,
                message: "unavailable".into(),
            });
        }
        Ok(state.instances.iter().cloned().collect())
    }

    async fn create_instance(&self, spec: &InstanceSpec) -> Result<(), FleetError> {
        let mut state = self.state.lock();
        state.create_calls += 1;
        if state.fail_create {
            return Err(FleetError::Operation {
                operation: "create".into(),
                message: "no space left".into(),
            });
        }
        state.instances.insert(spec.name.clone());
        state.specs.insert(spec.name.clone(), spec.clone());
        Ok(())
    }

    async fn start_instance(&self, name: &str) -> Result<(), FleetError> {
        let state = self.state.lock();
        if !state.instances.contains(name) {
            return Err(not_found(name));
        }
        if state.fail_start {
            return Err(FleetError::Operation {
                operation: "start".into(),
                message: "failed to start".into(),
            });
        }
        Ok(())
    }

    async fn stop_instance(&self, name: &str, force: bool) -> Result<(), FleetError> {
        let mut state = self.state.lock();
        if force {
            state.force_stops += 1;
        }
        if !state.instances.contains(name) {
            return Err(not_found(name));
        }
        let ephemeral = state.specs.get(name).map(|s| s.ephemeral).unwrap_or(false);
        if ephemeral {
            state.remove_and_announce(name);
        }
        Ok(())
    }

    async fn delete_instance(&self, name: &str) -> Result<(), FleetError> {
        let mut state = self.state.lock();
        state.delete_calls += 1;
        if state.fail_delete {
            return Err(FleetError::Api {
                status: 500,
                message: "storage busy".into(),
            });
        }
        if !state.instances.contains(name) {
            return Err(not_found(name));
        }
        state.remove_and_announce(name);
        Ok(())
    }

    async fn mkdir(&self, name: &str, _path: &str, _mode: u32) -> Result<(), FleetError> {
        let mut state = self.state.lock();
        state.mkdir_calls += 1;
        if !state.instances.contains(name) {
            return Err(not_found(name));
        }
        if state.mkdir_failures > 0 {
            state.mkdir_failures -= 1;
            return Err(FleetError::Api {
                status: 500,
                message: "guest agent not ready".into(),
            });
        }
        Ok(())
    }

    async fn push_file(
        &self,
        name: &str,
        path: &str,
        _contents: Vec<u8>,
        _mode: u32,
    ) -> Result<(), FleetError> {
        self.state
            .lock()
            .pushed
            .entry(name.to_string())
            .or_default()
            .push(path.to_string());
        Ok(())
    }

    async fn execute(
        &self,
        name: &str,
        _command: &[String],
        env: &BTreeMap<String, String>,
    ) -> Result<ExecOutput, FleetError> {
        let exit_code = {
            let mut state = self.state.lock();
            if state.panic_on_exec {
                drop(state);
                panic!("exec exploded for {}", name);
            }
            state.exec_env.insert(name.to_string(), env.clone());
            state.exec_exit_code
        };
        Ok(ExecOutput {
            exit_code,
            stdout: "setup output".into(),
            stderr: "setup errors".into(),
        })
    }

    async fn subscribe_lifecycle_events(
        &self,
    ) -> Result<BoxStream<'static, Result<LifecycleEvent, FleetError>>, FleetError> {
        let (tx, rx) = unbounded();
        self.state.lock().subscribers.push(tx);
        self.subscriptions.send_modify(|n| *n += 1);
        Ok(rx.boxed())
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

/// A queue wired to fakes, with one `linux` configuration for
/// `{self-hosted, linux}` and a package cache holding the linux/x64 agent.
pub struct Harness {
    pub dir: tempfile::TempDir,
    pub ci: Arc<FakeCi>,
    pub fleet: Arc<FakeFleet>,
    pub manager: TraceManager,
    pub sink: Arc<CollectingTraceWriter>,
    pub registry: Arc<WorkerRegistry>,
    pub packages: Arc<PackageCache>,
    pub queue: Arc<JobQueue>,
}

impl Harness {
    pub async fn new(max_workers: usize) -> Self {
        Self::with_arch(max_workers, RunnerArch::X64).await
    }

    pub async fn with_arch(max_workers: usize, arch: RunnerArch) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = app_config(dir.path(), max_workers, arch);

        let (manager, sink) = trace_manager();
        let ci = Arc::new(FakeCi::default());
        ci.set_releases(vec![release("v2.300.0", &[LINUX_X64_ASSET])]);
        let fleet = Arc::new(FakeFleet::default());

        let packages = Arc::new(PackageCache::new(
            config.package_dir(),
            ci.clone(),
            manager.get("PackageCache"),
        ));
        packages.refresh().await.expect("package refresh");

        let registry = Arc::new(WorkerRegistry::new(Arc::new(Notify::new())));
        let tokens = TokenCache::new(
            ci.clone(),
            manager.secret_masker().clone(),
            manager.get("TokenCache"),
        );
        let launcher = InstanceLauncher::new(
            fleet.clone(),
            config.remotes.clone(),
            config.cleanup,
            manager.get("Launcher"),
        );
        let queue = Arc::new(JobQueue::new(
            &config,
            registry.clone(),
            tokens,
            packages.clone(),
            launcher,
            manager.get("JobQueue"),
        ));

        Self {
            dir,
            ci,
            fleet,
            manager,
            sink,
            registry,
            packages,
            queue,
        }
    }
}
