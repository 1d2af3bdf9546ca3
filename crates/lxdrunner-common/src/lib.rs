// lxdrunner-common: configuration, models, errors, logging and the
// collaborator traits shared by the engine and its adapters.

pub mod ci_provider;
pub mod config;
pub mod constants;
pub mod errors;
pub mod fleet;
pub mod host_context;
pub mod http_client_factory;
pub mod models;
pub mod secret_masker;
pub mod tracing;

// ---------------------------------------------------------------------------
// Re-exports for convenient access
// ---------------------------------------------------------------------------

pub use ci_provider::CiProvider;
pub use config::{AppConfig, InstanceType, RemoteConfig, RunnerArch, RunnerConfig, RunnerOs};
pub use errors::{
    AdmissionError, CacheError, CiError, ConfigError, DispatchError, FleetError, LifecycleError,
};
pub use fleet::{ExecOutput, FleetApi, InstanceSource, InstanceSpec, LifecycleEvent};
pub use host_context::{HostContext, ShutdownReason};
pub use http_client_factory::HttpClientFactory;
pub use models::{
    JobRequest, LabelSet, QueuedJob, RegistrationToken, Release, ReleaseAsset, RepoRef,
    RunnerInfo, RunnerPackage, Scope,
};
pub use secret_masker::SecretMasker;
pub use tracing::{TraceEventType, TraceManager, Tracing};
