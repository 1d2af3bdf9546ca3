// HostContext: the process-wide application context.
// Owns the loaded configuration, the trace manager and the shutdown token.

use crate::config::AppConfig;
use crate::secret_masker::SecretMasker;
use crate::tracing::{TraceManager, Tracing};

use lxdrunner_sdk::TraceWriter;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Why the engine is stopping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    UserCancelled,
    Terminated,
    Fatal,
}

impl std::fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownReason::UserCancelled => write!(f, "UserCancelled"),
            ShutdownReason::Terminated => write!(f, "Terminated"),
            ShutdownReason::Fatal => write!(f, "Fatal"),
        }
    }
}

/// Shared context handed to every long-running component.
pub struct HostContext {
    config: Arc<AppConfig>,
    trace_manager: TraceManager,
    shutdown_token: CancellationToken,
    shutdown_reason: Mutex<Option<ShutdownReason>>,
}

impl HostContext {
    /// Build the context for a loaded configuration. The access token is
    /// registered with the masker before anything can log it.
    pub fn new(config: AppConfig) -> Arc<Self> {
        Self::with_trace_manager(config, TraceManager::new(Arc::new(SecretMasker::new())))
    }

    pub fn with_trace_manager(config: AppConfig, trace_manager: TraceManager) -> Arc<Self> {
        trace_manager.secret_masker().add_value(&config.pat);
        Arc::new(Self {
            config: Arc::new(config),
            trace_manager,
            shutdown_token: CancellationToken::new(),
            shutdown_reason: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &Arc<AppConfig> {
        &self.config
    }

    pub fn get_trace(&self, name: &str) -> Tracing {
        self.trace_manager.get(name)
    }

    pub fn secret_masker(&self) -> &Arc<SecretMasker> {
        self.trace_manager.secret_masker()
    }

    // -----------------------------------------------------------------------
    // Shutdown
    // -----------------------------------------------------------------------

    /// Token cancelled when the engine starts shutting down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    pub fn shutdown_reason(&self) -> Option<ShutdownReason> {
        *self.shutdown_reason.lock()
    }

    /// Begin shutdown. The first reason recorded wins.
    pub fn shutdown(&self, reason: ShutdownReason) {
        {
            let mut current = self.shutdown_reason.lock();
            if current.is_some() {
                return;
            }
            *current = Some(reason);
        }
        self.get_trace("HostContext")
            .info(&format!("LXDRunner will shut down: {}", reason));
        self.shutdown_token.cancel();
    }
}
