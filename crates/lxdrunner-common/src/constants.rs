// Constants shared across LXDRunner components.
// Grouped by the component that owns them.

use std::time::Duration;

// ---------------------------------------------------------------------------
// Naming
// ---------------------------------------------------------------------------

/// Default managed-name prefix for instances and runners.
pub const DEFAULT_PREFIX: &str = "lxdrunner";

/// Name of the fleet remote the engine drives.
pub const MAIN_REMOTE: &str = "main";

// ---------------------------------------------------------------------------
// Configuration lookup
// ---------------------------------------------------------------------------

pub mod config {
    /// Environment variable naming the configuration file.
    pub const FILE_ENV_VAR: &str = "LXDRCFG";

    /// Config file name searched in the working directory and XDG config dir.
    pub const FILE_NAME: &str = "config.yml";

    /// Application directory under `$XDG_CONFIG_HOME` / `$XDG_CACHE_HOME`.
    pub const APP_DIR: &str = "lxdrunner";

    /// Environment override for the cleanup (diagnostic mode) flag.
    pub const CLEANUP_ENV_VAR: &str = "LXDRUNNER_CLEANUP";

    /// Default CI web URL used to build runner target URLs.
    pub const DEFAULT_GITHUB_URL: &str = "https://github.com/";

    /// Default CI REST API base URL.
    pub const DEFAULT_API_URL: &str = "https://api.github.com/";
}

// ---------------------------------------------------------------------------
// Provisioning
// ---------------------------------------------------------------------------

pub mod provision {
    use std::time::Duration;

    /// Installation directory inside every instance.
    pub const INSTALL_DIR: &str = "/opt/runner";

    /// Name of the pushed runner archive inside `INSTALL_DIR`.
    pub const PACKAGE_FILE: &str = "actions-runner.tgz";

    /// Name of the pushed environment file inside `INSTALL_DIR`.
    pub const VARS_FILE: &str = "setupvars.conf";

    /// Mode used for the install directory and every pushed file.
    pub const FILE_MODE: u32 = 0o755;

    /// Attempts made to reach the guest agent before giving up.
    pub const GUEST_AGENT_ATTEMPTS: u32 = 15;

    /// Delay between guest agent attempts.
    pub const GUEST_AGENT_RETRY_DELAY: Duration = Duration::from_secs(5);

    /// Grace period given to a regular (non-forced) stop during cleanup.
    pub const STOP_TIMEOUT_SECS: i64 = 30;

    /// Environment handed to the setup script.
    pub mod env {
        pub const TOKEN: &str = "GHA_TOKEN";
        pub const URL: &str = "GHA_URL";
        pub const NAME: &str = "GHA_NAME";
        pub const EXTRA_LABELS: &str = "GHA_EXTRA_LABELS";
    }
}

// ---------------------------------------------------------------------------
// Package cache
// ---------------------------------------------------------------------------

pub mod packages {
    /// Owner of the repository publishing runner releases.
    pub const RELEASE_OWNER: &str = "actions";

    /// Repository publishing runner releases.
    pub const RELEASE_REPO: &str = "runner";

    /// Suffix replacing the version in stable link names.
    pub const LINK_SUFFIX: &str = "latest";
}

// ---------------------------------------------------------------------------
// Scheduling
// ---------------------------------------------------------------------------

/// Fallback polling interval of the dispatch loop.
pub const QUEUE_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Registration tokens with this much validity or less are replaced.
pub const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(30 * 60);

/// Interval between package cache refreshes.
pub const PACKAGE_REFRESH_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Interval between offline-runner cleanups and slot reconciliation.
pub const RECONCILE_INTERVAL: Duration = Duration::from_secs(12 * 60 * 60);

/// Time allowed for in-flight lifecycle tasks on shutdown.
pub const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Fleet events
// ---------------------------------------------------------------------------

pub mod events {
    /// Lifecycle action emitted when an instance is removed.
    pub const INSTANCE_DELETED: &str = "instance-deleted";

    /// Event type subscribed to on the fleet event stream.
    pub const LIFECYCLE: &str = "lifecycle";
}

// ---------------------------------------------------------------------------
// Return codes
// ---------------------------------------------------------------------------

pub mod return_code {
    pub const SUCCESS: i32 = 0;
    pub const TERMINATED_ERROR: i32 = 1;
    pub const CONFIG_ERROR: i32 = 2;
}
