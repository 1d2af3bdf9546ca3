// LXDRunner engine: admission, instance lifecycle, pool tracking, package
// cache and reconciliation, plus the GitHub and LXD adapters.

pub mod command_settings;
pub mod error_throttler;
pub mod github_client;
pub mod instance_launcher;
pub mod job_event;
pub mod job_queue;
pub mod lxd_client;
pub mod lxd_events;
pub mod package_cache;
pub mod pool_tracker;
pub mod reconciler;
pub mod runner;
pub mod token_cache;
pub mod worker_registry;

#[cfg(test)]
mod test_support;
