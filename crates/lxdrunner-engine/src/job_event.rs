// RunnerConfiguration and JobEvent: the runtime forms of a runnermap entry
// and of one admitted job.

use lxdrunner_common::{JobRequest, LabelSet, RunnerConfig, RunnerPackage, Scope};
use lxdrunner_sdk::StringUtil;

use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;

// ---------------------------------------------------------------------------
// RunnerConfiguration
// ---------------------------------------------------------------------------

/// A runnermap entry plus its pool of slots. One per distinct label set,
/// built at start-up and shared for the life of the process.
#[derive(Debug)]
pub struct RunnerConfiguration {
    pub config: RunnerConfig,
    /// Pool slots; one permit is held per live instance.
    pub slots: Arc<Semaphore>,
    pub max_workers: usize,
}

impl RunnerConfiguration {
    pub fn new(config: RunnerConfig, max_workers: usize) -> Self {
        Self {
            config,
            slots: Arc::new(Semaphore::new(max_workers)),
            max_workers,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn labels(&self) -> &LabelSet {
        &self.config.labels
    }

    /// Slots currently held by live or launching instances.
    pub fn slots_in_use(&self) -> usize {
        self.max_workers - self.slots.available_permits()
    }
}

// ---------------------------------------------------------------------------
// JobEvent
// ---------------------------------------------------------------------------

/// One admitted job. Token and package are attached by the dispatch path
/// just before launch.
#[derive(Debug, Clone)]
pub struct JobEvent {
    pub owner: String,
    pub repo: String,
    pub org: Option<String>,
    pub job_id: Option<u64>,
    pub scope: Scope,
    /// Where the runner registers, e.g. `https://github.com/my-org`.
    pub target_url: String,
    pub config: Arc<RunnerConfiguration>,
    pub instance_name: String,
    pub token: Option<String>,
    pub package: Option<RunnerPackage>,
    pub queued_at: Instant,
}

impl JobEvent {
    pub fn new(
        request: &JobRequest,
        config: Arc<RunnerConfiguration>,
        prefix: &str,
        github_url: &str,
    ) -> Self {
        let scope = request.scope();
        let target_url = format!("{}/{}", github_url.trim_end_matches('/'), scope.target());
        Self {
            owner: request.owner.clone(),
            repo: request.repo.clone(),
            org: request.org.clone().filter(|o| !o.is_empty()),
            job_id: request.job_id,
            scope,
            target_url,
            config,
            instance_name: StringUtil::make_instance_name(prefix),
            token: None,
            package: None,
            queued_at: Instant::now(),
        }
    }

    /// The scope target: the org name or `owner/repo`.
    pub fn target(&self) -> String {
        self.scope.target()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::runner_config;

    fn request(org: Option<&str>) -> JobRequest {
        JobRequest {
            owner: "octo".into(),
            repo: "widgets".into(),
            org: org.map(String::from),
            labels: vec!["self-hosted".into()],
            job_id: Some(42),
        }
    }

    #[test]
    fn test_org_target() {
        let rc = Arc::new(RunnerConfiguration::new(runner_config("a", &["self-hosted"]), 1));
        let job = JobEvent::new(&request(Some("octo-org")), rc, "lxdrunner", "https://github.com/");
        assert_eq!(job.target(), "octo-org");
        assert_eq!(job.target_url, "https://github.com/octo-org");
        assert!(job.instance_name.starts_with("lxdrunner-"));
        assert!(job.token.is_none() && job.package.is_none());
    }

    #[test]
    fn test_repo_target_when_org_empty() {
        let rc = Arc::new(RunnerConfiguration::new(runner_config("a", &["self-hosted"]), 1));
        let job = JobEvent::new(&request(Some("")), rc, "lxdrunner", "https://github.com");
        assert_eq!(job.target(), "octo/widgets");
        assert_eq!(job.target_url, "https://github.com/octo/widgets");
        assert_eq!(job.org, None);
    }

    #[test]
    fn test_slots_in_use() {
        let rc = RunnerConfiguration::new(runner_config("a", &["self-hosted"]), 2);
        let _permit = rc.slots.clone().try_acquire_owned().unwrap();
        assert_eq!(rc.slots_in_use(), 1);
    }
}
