// PackageCache: keeps the current CI agent archives on local disk.
//
// Each package is stored under its versioned file name and published under a
// version independent link name (`actions-runner-<os>-<arch>-latest`). The
// link is swapped with a rename, so a launcher reading through it always sees
// a complete archive.

use lxdrunner_common::constants::packages::{LINK_SUFFIX, RELEASE_OWNER, RELEASE_REPO};
use lxdrunner_common::{CacheError, CiProvider, Release, RunnerPackage, Tracing};
use lxdrunner_sdk::{IOUtil, TraceWriter};

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use regex::Regex;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

static ASSET_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^actions-runner-(linux|win|osx)-(x64|arm64|arm)-(\d+(?:\.\d+)*)\.(tar\.gz|zip)$")
        .expect("asset name pattern is valid")
});

/// Map a release asset to a package. Only the plain agent archives are
/// recognised; variants such as `-noexternals` are not.
pub fn parse_asset(name: &str, download_url: &str) -> Result<RunnerPackage, CacheError> {
    let caps = ASSET_NAME
        .captures(name)
        .ok_or_else(|| CacheError::AssetName(name.to_string()))?;
    let os = caps[1].to_string();
    let architecture = caps[2].to_string();
    Ok(RunnerPackage {
        linkname: format!("actions-runner-{}-{}-{}", os, architecture, LINK_SUFFIX),
        version: caps[3].to_string(),
        filename: name.to_string(),
        download_url: download_url.to_string(),
        os,
        architecture,
    })
}

/// Latest published, non-prerelease release. The feed lists newest first.
pub fn latest_stable(releases: &[Release]) -> Option<&Release> {
    releases.iter().find(|r| !r.prerelease && !r.draft)
}

/// What one refresh changed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RefreshReport {
    pub version: String,
    pub downloaded: Vec<String>,
    pub rotated: Vec<String>,
    pub pruned: Vec<String>,
    pub failed: Vec<String>,
}

impl RefreshReport {
    pub fn is_noop(&self) -> bool {
        self.downloaded.is_empty() && self.rotated.is_empty() && self.pruned.is_empty()
    }
}

pub struct PackageCache {
    dir: PathBuf,
    provider: Arc<dyn CiProvider>,
    packages: RwLock<Vec<RunnerPackage>>,
    trace: Tracing,
}

impl PackageCache {
    pub fn new(dir: PathBuf, provider: Arc<dyn CiProvider>, trace: Tracing) -> Self {
        Self {
            dir,
            provider,
            packages: RwLock::new(Vec::new()),
            trace,
        }
    }

    /// Sync the cache with the newest stable release: download what is
    /// missing, rotate links, delete everything else. A failed download
    /// leaves that package's previous generation in place and does not stop
    /// the others.
    pub async fn refresh(&self) -> Result<RefreshReport, CacheError> {
        self.trace.info("Updating runner package cache");

        let releases = self
            .provider
            .list_releases(RELEASE_OWNER, RELEASE_REPO)
            .await
            .map_err(CacheError::Feed)?;
        let release = latest_stable(&releases).ok_or(CacheError::NoRelease)?;

        let mut packages = Vec::new();
        for asset in &release.assets {
            match parse_asset(&asset.name, &asset.browser_download_url) {
                Ok(pkg) => packages.push(pkg),
                Err(_) => self.trace.verbose(&format!("Skipping asset {}", asset.name)),
            }
        }

        fs::create_dir_all(&self.dir).map_err(|e| {
            CacheError::Io(format!("creating {}: {}", self.dir.display(), e))
        })?;

        let mut report = RefreshReport {
            version: release.tag_name.clone(),
            ..Default::default()
        };
        let mut keep = BTreeSet::new();

        for pkg in &packages {
            keep.insert(pkg.linkname.clone());
            let filepath = self.dir.join(&pkg.filename);
            let linkpath = self.dir.join(&pkg.linkname);

            if !filepath.exists() {
                self.trace.info(&format!("Downloading: {}", pkg.filename));
                if let Err(e) = self.download(pkg, &filepath).await {
                    self.trace.error_err(&e);
                    report.failed.push(pkg.filename.clone());
                    // Keep serving the previous generation.
                    if let Some(current) = link_target(&linkpath) {
                        keep.insert(current);
                    }
                    continue;
                }
                report.downloaded.push(pkg.filename.clone());
            }
            keep.insert(pkg.filename.clone());

            if link_target(&linkpath).as_deref() != Some(pkg.filename.as_str()) {
                IOUtil::replace_symlink(&pkg.filename, &linkpath).map_err(|e| {
                    CacheError::Io(format!("{:#}", e))
                })?;
                report.rotated.push(pkg.linkname.clone());
            }
        }

        let present = IOUtil::list_file_names(&self.dir)
            .map_err(|e| CacheError::Io(format!("{:#}", e)))?;
        for name in present.difference(&keep) {
            self.trace.info(&format!("Deleting: {}", name));
            match IOUtil::delete_file(&self.dir.join(name)) {
                Ok(()) => report.pruned.push(name.clone()),
                Err(e) => self.trace.warning(&format!("{:#}", e)),
            }
        }

        *self.packages.write() = packages;
        self.trace.info(&format!(
            "Runner package cache at {}: {} downloaded, {} pruned, {} failed",
            report.version,
            report.downloaded.len(),
            report.pruned.len(),
            report.failed.len()
        ));
        Ok(report)
    }

    async fn download(&self, pkg: &RunnerPackage, filepath: &Path) -> Result<(), CacheError> {
        let bytes = self
            .provider
            .download_asset(&pkg.download_url)
            .await
            .map_err(|e| CacheError::Download {
                filename: pkg.filename.clone(),
                reason: e.to_string(),
            })?;
        IOUtil::write_atomic(filepath, &bytes).map_err(|e| CacheError::Download {
            filename: pkg.filename.clone(),
            reason: format!("{:#}", e),
        })
    }

    /// The package for an OS/architecture pair. No fallback to another
    /// architecture.
    pub fn select(&self, os: &str, arch: &str) -> Result<RunnerPackage, CacheError> {
        self.packages
            .read()
            .iter()
            .find(|p| p.os == os && p.architecture == arch)
            .cloned()
            .ok_or_else(|| CacheError::NoPackage {
                os: os.to_string(),
                arch: arch.to_string(),
            })
    }

    /// Path of the package's stable link.
    pub fn stable_path(&self, pkg: &RunnerPackage) -> PathBuf {
        self.dir.join(&pkg.linkname)
    }

    /// Read the current archive through the stable link.
    pub async fn read(&self, pkg: &RunnerPackage) -> Result<Vec<u8>, CacheError> {
        let path = self.stable_path(pkg);
        tokio::fs::read(&path)
            .await
            .map_err(|e| CacheError::Io(format!("reading {}: {}", path.display(), e)))
    }
}

/// File name a link points at, if `path` is a symlink.
fn link_target(path: &Path) -> Option<String> {
    fs::read_link(path)
        .ok()
        .and_then(|t| t.file_name().map(|n| n.to_string_lossy().into_owned()))
}
