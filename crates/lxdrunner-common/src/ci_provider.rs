// CiProvider: the CI provider API as seen by the engine.

use crate::errors::CiError;
use crate::models::{QueuedJob, RegistrationToken, Release, RepoRef, RunnerInfo, Scope};

use async_trait::async_trait;
use bytes::Bytes;

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Token, runner, release and queue operations of the CI provider.
#[async_trait]
pub trait CiProvider: Send + Sync {
    /// Issue a short-lived runner registration token for `scope`.
    async fn issue_registration_token(&self, scope: &Scope)
        -> Result<RegistrationToken, CiError>;

    /// Releases of `owner/repo`, newest first.
    async fn list_releases(&self, owner: &str, repo: &str) -> Result<Vec<Release>, CiError>;

    /// Self-hosted runners registered at `scope`.
    async fn list_runners(&self, scope: &Scope) -> Result<Vec<RunnerInfo>, CiError>;

    /// De-register a runner.
    async fn delete_runner(&self, scope: &Scope, runner_id: u64) -> Result<(), CiError>;

    /// Organizations the authenticated user belongs to.
    async fn list_orgs(&self) -> Result<Vec<String>, CiError>;

    /// Repositories the authenticated user can see.
    async fn list_user_repos(&self) -> Result<Vec<RepoRef>, CiError>;

    /// Jobs of queued workflow runs in `repo`.
    async fn list_queued_jobs(&self, repo: &RepoRef) -> Result<Vec<QueuedJob>, CiError>;

    /// Fetch a release asset.
    async fn download_asset(&self, url: &str) -> Result<Bytes, CiError>;
}
