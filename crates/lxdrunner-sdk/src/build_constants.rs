/// Build-time identity of the LXDRunner binaries.

/// Source control information.
pub struct Source;

impl Source {
    /// Commit hash baked in through `LXDRUNNER_COMMIT_HASH`, or "N/A".
    pub const COMMIT_HASH: &'static str = match option_env!("LXDRUNNER_COMMIT_HASH") {
        Some(h) => h,
        None => "N/A",
    };
}

/// Package metadata used for the user agent and `--version`.
#[derive(Debug, Clone)]
pub struct BuildInfo;

impl BuildInfo {
    /// Semantic version from `Cargo.toml`.
    pub const VERSION: &'static str = env!("CARGO_PKG_VERSION");

    /// Product name reported to remote APIs.
    pub const PRODUCT_NAME: &'static str = "LXDRunner";

    /// `LXDRunner/<version>`, sent as the HTTP user agent.
    pub fn user_agent() -> String {
        format!("{}/{}", Self::PRODUCT_NAME, Self::VERSION)
    }
}
