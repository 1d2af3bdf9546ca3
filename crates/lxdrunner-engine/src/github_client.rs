// GitHubClient: the CI provider API over the GitHub REST v3 endpoints.

use lxdrunner_common::{
    CiError, CiProvider, HttpClientFactory, QueuedJob, RegistrationToken, Release, RepoRef,
    RunnerInfo, Scope,
};

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use url::Url;

/// Page size requested from list endpoints. A shorter page ends the listing.
const PER_PAGE: usize = 100;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RunnersPage {
    #[serde(default)]
    runners: Vec<RunnerInfo>,
}

#[derive(Debug, Deserialize)]
struct OrgEntry {
    login: String,
}

#[derive(Debug, Deserialize)]
struct OwnerEntry {
    login: String,
    #[serde(rename = "type", default)]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct RepoEntry {
    name: String,
    owner: OwnerEntry,
}

impl From<RepoEntry> for RepoRef {
    fn from(entry: RepoEntry) -> Self {
        RepoRef {
            owner_is_org: entry.owner.kind == "Organization",
            owner: entry.owner.login,
            name: entry.name,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RunEntry {
    id: u64,
}

#[derive(Debug, Deserialize)]
struct RunsPage {
    #[serde(default)]
    workflow_runs: Vec<RunEntry>,
}

#[derive(Debug, Deserialize)]
struct JobEntry {
    id: u64,
    #[serde(default)]
    labels: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct JobsPage {
    #[serde(default)]
    jobs: Vec<JobEntry>,
}

// ---------------------------------------------------------------------------
// GitHubClient
// ---------------------------------------------------------------------------

pub struct GitHubClient {
    api: Client,
    downloads: Client,
    base: Url,
}

impl GitHubClient {
    /// Create a client for the API rooted at `api_url`, authenticating with
    /// the personal access token `pat`.
    pub fn new(api_url: &str, pat: &str) -> anyhow::Result<Self> {
        Ok(Self {
            api: HttpClientFactory::create_ci_client(pat)?,
            downloads: HttpClientFactory::create_download_client()?,
            base: Self::base_url(api_url)?,
        })
    }

    /// Parse the API root, making sure relative joins keep its path.
    fn base_url(api_url: &str) -> anyhow::Result<Url> {
        let mut base = api_url.trim().to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        Ok(Url::parse(&base)?)
    }

    fn endpoint(&self, path: &str) -> Result<Url, CiError> {
        self.base
            .join(path.trim_start_matches('/'))
            .map_err(|e| CiError::Decode(format!("bad endpoint {}: {}", path, e)))
    }

    /// Path of the runner collection for `scope`.
    fn runners_path(scope: &Scope) -> String {
        match scope {
            Scope::Org(org) => format!("orgs/{}/actions/runners", org),
            Scope::Repo { owner, repo } => format!("repos/{}/{}/actions/runners", owner, repo),
        }
    }

    async fn check(response: Response, what: &str) -> Result<Response, CiError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        if status == StatusCode::FORBIDDEN {
            return Err(CiError::Forbidden(what.to_string()));
        }
        Err(CiError::Api {
            status: status.as_u16(),
            message: format!("{}: {}", what, body.trim()),
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url, what: &str) -> Result<T, CiError> {
        let response = self.api.get(url).send().await?;
        let response = Self::check(response, what).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| CiError::Decode(format!("{}: {}", what, e)))
    }

    /// Fetch every page of a list endpoint. `items` extracts the entries of
    /// one decoded page.
    async fn get_paged<P, T>(
        &self,
        path: &str,
        query: &[(&str, &str)],
        what: &str,
        items: impl Fn(P) -> Vec<T>,
    ) -> Result<Vec<T>, CiError>
    where
        P: DeserializeOwned,
    {
        let mut all = Vec::new();
        let mut page = 1usize;
        loop {
            let mut url = self.endpoint(path)?;
            {
                let mut pairs = url.query_pairs_mut();
                for (key, value) in query {
                    pairs.append_pair(key, value);
                }
                pairs.append_pair("per_page", &PER_PAGE.to_string());
                pairs.append_pair("page", &page.to_string());
            }
            let batch = items(self.get_json::<P>(url, what).await?);
            let done = batch.len() < PER_PAGE;
            all.extend(batch);
            if done {
                return Ok(all);
            }
            page += 1;
        }
    }
}

#[async_trait]
impl CiProvider for GitHubClient {
    async fn issue_registration_token(
        &self,
        scope: &Scope,
    ) -> Result<RegistrationToken, CiError> {
        let url = self.endpoint(&format!("{}/registration-token", Self::runners_path(scope)))?;
        let what = format!("registration token for {}", scope);
        let response = self.api.post(url).send().await?;
        Self::check(response, &what)
            .await?
            .json::<RegistrationToken>()
            .await
            .map_err(|e| CiError::Decode(format!("{}: {}", what, e)))
    }

    async fn list_releases(&self, owner: &str, repo: &str) -> Result<Vec<Release>, CiError> {
        let url = self.endpoint(&format!("repos/{}/{}/releases", owner, repo))?;
        self.get_json(url, &format!("releases of {}/{}", owner, repo))
            .await
    }

    async fn list_runners(&self, scope: &Scope) -> Result<Vec<RunnerInfo>, CiError> {
        self.get_paged(
            &Self::runners_path(scope),
            &[],
            &format!("runners of {}", scope),
            |page: RunnersPage| page.runners,
        )
        .await
    }

    async fn delete_runner(&self, scope: &Scope, runner_id: u64) -> Result<(), CiError> {
        let url = self.endpoint(&format!("{}/{}", Self::runners_path(scope), runner_id))?;
        let response = self.api.delete(url).send().await?;
        Self::check(response, &format!("delete runner {} of {}", runner_id, scope)).await?;
        Ok(())
    }

    async fn list_orgs(&self) -> Result<Vec<String>, CiError> {
        self.get_paged("user/orgs", &[], "organizations", |page: Vec<OrgEntry>| {
            page.into_iter().map(|o| o.login).collect()
        })
        .await
    }

    async fn list_user_repos(&self) -> Result<Vec<RepoRef>, CiError> {
        self.get_paged("user/repos", &[], "repositories", |page: Vec<RepoEntry>| {
            page.into_iter().map(RepoRef::from).collect()
        })
        .await
    }

    async fn list_queued_jobs(&self, repo: &RepoRef) -> Result<Vec<QueuedJob>, CiError> {
        let base = format!("repos/{}/{}/actions/runs", repo.owner, repo.name);
        let runs = self
            .get_paged(
                &base,
                &[("status", "queued")],
                &format!("queued runs of {}/{}", repo.owner, repo.name),
                |page: RunsPage| page.workflow_runs,
            )
            .await?;

        let mut jobs = Vec::new();
        for run in runs {
            let batch = self
                .get_paged(
                    &format!("{}/{}/jobs", base, run.id),
                    &[],
                    &format!("jobs of run {}", run.id),
                    |page: JobsPage| page.jobs,
                )
                .await?;
            jobs.extend(batch.into_iter().map(|job| QueuedJob {
                id: job.id,
                labels: job.labels,
            }));
        }
        Ok(jobs)
    }

    async fn download_asset(&self, url: &str) -> Result<Bytes, CiError> {
        let response = self.downloads.get(url).send().await?;
        let response = Self::check(response, &format!("download {}", url)).await?;
        Ok(response.bytes().await?)
    }
}
