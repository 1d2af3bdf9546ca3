// Domain types exchanged between the engine and its collaborators.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

// ---------------------------------------------------------------------------
// LabelSet
// ---------------------------------------------------------------------------

/// Canonical, order-independent set of runner labels.
///
/// Used as the key matching admitted jobs to runner configurations; two
/// label lists match only when they contain exactly the same labels.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct LabelSet(BTreeSet<String>);

impl LabelSet {
    /// Build a label set from any list of labels. Duplicates collapse.
    pub fn new<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(labels.into_iter().map(Into::into).collect())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    /// Labels joined by `sep`, in canonical order.
    pub fn join(&self, sep: &str) -> String {
        self.iter().collect::<Vec<_>>().join(sep)
    }
}

impl From<Vec<String>> for LabelSet {
    fn from(labels: Vec<String>) -> Self {
        Self::new(labels)
    }
}

impl From<LabelSet> for Vec<String> {
    fn from(labels: LabelSet) -> Self {
        labels.0.into_iter().collect()
    }
}

impl fmt::Display for LabelSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}}}", self.join(","))
    }
}

// ---------------------------------------------------------------------------
// Scope
// ---------------------------------------------------------------------------

/// Where a runner registers: an organization, or a single repository.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    Org(String),
    Repo { owner: String, repo: String },
}

impl Scope {
    /// Organization scope when `org` is set and non-empty, repository scope
    /// otherwise.
    pub fn for_job(owner: &str, repo: &str, org: Option<&str>) -> Self {
        match org {
            Some(org) if !org.is_empty() => Scope::Org(org.to_string()),
            _ => Scope::Repo {
                owner: owner.to_string(),
                repo: repo.to_string(),
            },
        }
    }

    /// The scope's target string: the org name, or `owner/repo`.
    pub fn target(&self) -> String {
        match self {
            Scope::Org(org) => org.clone(),
            Scope::Repo { owner, repo } => format!("{}/{}", owner, repo),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.target())
    }
}

// ---------------------------------------------------------------------------
// JobRequest
// ---------------------------------------------------------------------------

/// A validated job-admission request, as produced by the webhook receiver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    pub owner: String,
    pub repo: String,
    #[serde(default)]
    pub org: Option<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub job_id: Option<u64>,
}

impl JobRequest {
    pub fn scope(&self) -> Scope {
        Scope::for_job(&self.owner, &self.repo, self.org.as_deref())
    }

    pub fn label_set(&self) -> LabelSet {
        LabelSet::new(self.labels.iter().cloned())
    }
}

// ---------------------------------------------------------------------------
// CI provider payloads
// ---------------------------------------------------------------------------

/// A runner registration token and its expiry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl RegistrationToken {
    /// Validity left at `now`. Negative once expired.
    pub fn remaining(&self, now: DateTime<Utc>) -> chrono::Duration {
        self.expires_at - now
    }

    /// True when `margin` or less of validity is left at `now`.
    pub fn needs_refresh(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        match chrono::Duration::from_std(margin) {
            Ok(margin) => self.remaining(now) <= margin,
            Err(_) => true,
        }
    }
}

/// One downloadable file attached to a release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseAsset {
    pub name: String,
    pub browser_download_url: String,
}

/// A published release of the CI agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Release {
    #[serde(default)]
    pub tag_name: String,
    #[serde(default)]
    pub prerelease: bool,
    #[serde(default)]
    pub draft: bool,
    #[serde(default)]
    pub assets: Vec<ReleaseAsset>,
}

/// A self-hosted runner registered with the CI provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerInfo {
    pub id: u64,
    pub name: String,
    pub status: String,
}

impl RunnerInfo {
    pub fn is_offline(&self) -> bool {
        self.status == "offline"
    }
}

/// A repository visible to the authenticated CI user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoRef {
    pub owner: String,
    pub name: String,
    /// The owner is an organization rather than a user.
    pub owner_is_org: bool,
}

/// A job waiting in the CI provider's queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedJob {
    pub id: u64,
    pub labels: Vec<String>,
}

// ---------------------------------------------------------------------------
// RunnerPackage
// ---------------------------------------------------------------------------

/// An OS/architecture specific CI agent archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerPackage {
    pub os: String,
    pub architecture: String,
    pub version: String,
    /// Versioned file name, as published.
    pub filename: String,
    /// Version independent name of the stable link.
    pub linkname: String,
    pub download_url: String,
}
