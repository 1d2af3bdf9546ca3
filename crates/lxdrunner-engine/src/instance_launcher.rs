// InstanceLauncher: drives one compute instance through
// Verifying -> Launching -> Provisioning -> Succeeded, cleaning up on failure.

use crate::job_event::JobEvent;

use lxdrunner_common::constants::provision::{
    env as script_env_keys, FILE_MODE, GUEST_AGENT_ATTEMPTS, GUEST_AGENT_RETRY_DELAY,
    INSTALL_DIR, PACKAGE_FILE, VARS_FILE,
};
use lxdrunner_common::{
    FleetApi, FleetError, InstanceSource, InstanceSpec, LifecycleError, RemoteConfig,
    RunnerConfig, Tracing,
};
use lxdrunner_sdk::{StringUtil, TraceWriter};

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecyclePhase {
    Verifying,
    Launching,
    Provisioning,
    CleaningUp,
    Succeeded,
    Failed,
}

impl fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecyclePhase::Verifying => "Verifying",
            LifecyclePhase::Launching => "Launching",
            LifecyclePhase::Provisioning => "Provisioning",
            LifecyclePhase::CleaningUp => "CleaningUp",
            LifecyclePhase::Succeeded => "Succeeded",
            LifecyclePhase::Failed => "Failed",
        };
        f.write_str(name)
    }
}

/// A lifecycle that did not reach `Succeeded`.
#[derive(Debug)]
pub struct LaunchFailure {
    pub error: LifecycleError,
    /// Phase the failure happened in.
    pub failed_in: LifecyclePhase,
    /// No deletion event will arrive for this instance (it never existed, or
    /// cleanup confirmed it is gone); the caller releases the slot itself.
    pub release_slot: bool,
}

impl fmt::Display for LaunchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (in {})", self.error, self.failed_in)
    }
}

impl std::error::Error for LaunchFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// Provisioning either fails outright or finds the guest unreachable.
enum ProvisionError {
    Unreachable(LifecycleError),
    Failed(LifecycleError),
}

// ---------------------------------------------------------------------------
// InstanceLauncher
// ---------------------------------------------------------------------------

pub struct InstanceLauncher {
    fleet: Arc<dyn FleetApi>,
    remotes: HashMap<String, RemoteConfig>,
    cleanup: bool,
    trace: Tracing,
}

impl InstanceLauncher {
    pub fn new(
        fleet: Arc<dyn FleetApi>,
        remotes: HashMap<String, RemoteConfig>,
        cleanup: bool,
        trace: Tracing,
    ) -> Self {
        Self {
            fleet,
            remotes,
            cleanup,
            trace,
        }
    }

    /// Run the whole lifecycle for `job`. `job.token` must be set; `package`
    /// is the agent archive pushed into the instance.
    pub async fn run(&self, job: &JobEvent, package: Vec<u8>) -> Result<(), LaunchFailure> {
        let trace = self.trace.for_instance(&job.instance_name);
        let rc = &job.config.config;

        // Verifying
        trace.verbose(&format!("-> {}", LifecyclePhase::Verifying));
        let script = self.verify(job, &trace).await.map_err(|errors| LaunchFailure {
            error: LifecycleError::Verification(errors),
            failed_in: LifecyclePhase::Verifying,
            release_slot: true,
        })?;

        // Launching
        trace.verbose(&format!("-> {}", LifecyclePhase::Launching));
        if let Err(source) = self.launch_instance(&job.instance_name, rc, &trace).await {
            let error = LifecycleError::Launch {
                instance: job.instance_name.clone(),
                source,
            };
            return Err(self
                .fail_with_cleanup(&job.instance_name, error, LifecyclePhase::Launching, &trace)
                .await);
        }

        // Provisioning
        trace.verbose(&format!("-> {}", LifecyclePhase::Provisioning));
        match self.provision(job, script, package, &trace).await {
            Ok(()) => {
                trace.info("Provision successful");
                trace.verbose(&format!("-> {}", LifecyclePhase::Succeeded));
                Ok(())
            }
            Err(ProvisionError::Unreachable(error)) => {
                trace.warning(&format!(
                    "Runner start timeout, stopping {}",
                    job.instance_name
                ));
                // Ephemeral: the fleet deletes it once stopped and the
                // deletion event releases the slot.
                let stopped = self.fleet.stop_instance(&job.instance_name, true).await;
                let release_slot = match stopped {
                    Ok(()) => false,
                    Err(e) if e.is_not_found() => true,
                    Err(e) => {
                        trace.error(&format!("Force stop failed: {}", e));
                        false
                    }
                };
                trace.verbose(&format!("-> {}", LifecyclePhase::Failed));
                Err(LaunchFailure {
                    error,
                    failed_in: LifecyclePhase::Provisioning,
                    release_slot,
                })
            }
            Err(ProvisionError::Failed(error)) => Err(self
                .fail_with_cleanup(&job.instance_name, error, LifecyclePhase::Provisioning, &trace)
                .await),
        }
    }

    // -----------------------------------------------------------------------
    // Verifying
    // -----------------------------------------------------------------------

    /// Check that the image, profiles and script exist. Returns the script
    /// contents, or every problem found.
    async fn verify(&self, job: &JobEvent, trace: &Tracing) -> Result<Vec<u8>, Vec<String>> {
        let rc = &job.config.config;
        let mut errors = Vec::new();

        if !rc.image.contains(':') {
            match self.fleet.image_alias_exists(&rc.image).await {
                Ok(true) => {}
                Ok(false) => errors.push(format!("image does not exist: {}", rc.image)),
                Err(e) => errors.push(format!("image lookup failed for {}: {}", rc.image, e)),
            }
        } else if let Err(e) = self.image_to_source(&rc.image) {
            errors.push(e);
        }

        for profile in &rc.profiles {
            match self.fleet.profile_exists(profile).await {
                Ok(true) => {}
                Ok(false) => errors.push(format!("profile does not exist: {}", profile)),
                Err(e) => errors.push(format!("profile lookup failed for {}: {}", profile, e)),
            }
        }

        let script = match tokio::fs::read(&rc.setup_script).await {
            Ok(bytes) => Some(bytes),
            Err(_) => {
                errors.push(format!(
                    "script does not exist: {}",
                    rc.setup_script.display()
                ));
                None
            }
        };

        if job.token.is_none() {
            errors.push("no registration token attached".to_string());
        }

        match script {
            Some(script) if errors.is_empty() => Ok(script),
            _ => {
                for e in &errors {
                    trace.error(&format!("Error: {}", e));
                }
                Err(errors)
            }
        }
    }

    /// Resolve `alias` or `remote:alias` to an instance source.
    pub fn image_to_source(&self, image: &str) -> Result<InstanceSource, String> {
        match image.split_once(':') {
            None => Ok(InstanceSource::Local {
                alias: image.to_string(),
            }),
            Some((remote_name, alias)) => {
                let remote = self
                    .remotes
                    .get(remote_name)
                    .ok_or_else(|| format!("unknown image remote: {}", remote_name))?;
                let server = remote
                    .addr
                    .clone()
                    .ok_or_else(|| format!("image remote {} has no address", remote_name))?;
                Ok(InstanceSource::Remote {
                    alias: alias.to_string(),
                    server,
                    protocol: remote.protocol.clone(),
                })
            }
        }
    }

    // -----------------------------------------------------------------------
    // Launching
    // -----------------------------------------------------------------------

    async fn launch_instance(
        &self,
        name: &str,
        rc: &RunnerConfig,
        trace: &Tracing,
    ) -> Result<(), FleetError> {
        let source = self.image_to_source(&rc.image).map_err(FleetError::Decode)?;
        let spec = InstanceSpec {
            name: name.to_string(),
            ephemeral: true,
            profiles: rc.profiles.clone(),
            source,
            instance_type: rc.instance_type,
        };
        trace.info(&format!(
            "Launching {} from {} ({})",
            rc.instance_type, rc.image, rc.name
        ));
        self.fleet.create_instance(&spec).await?;
        self.fleet.start_instance(name).await
    }

    // -----------------------------------------------------------------------
    // Provisioning
    // -----------------------------------------------------------------------

    /// Environment handed to the setup script.
    pub fn script_env(job: &JobEvent) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        env.insert(
            script_env_keys::TOKEN.to_string(),
            job.token.clone().unwrap_or_default(),
        );
        env.insert(script_env_keys::URL.to_string(), job.target_url.clone());
        env.insert(script_env_keys::NAME.to_string(), job.instance_name.clone());
        env.insert(
            script_env_keys::EXTRA_LABELS.to_string(),
            job.config.labels().join(","),
        );
        env
    }

    async fn provision(
        &self,
        job: &JobEvent,
        script: Vec<u8>,
        package: Vec<u8>,
        trace: &Tracing,
    ) -> Result<(), ProvisionError> {
        let name = job.instance_name.as_str();
        let failed = |reason: String| {
            ProvisionError::Failed(LifecycleError::Provisioning {
                instance: name.to_string(),
                reason,
            })
        };

        self.wait_for_guest(name, trace).await?;

        let script_dst = script_destination(&job.config.config.setup_script);
        let vars_dst = format!("{}/{}", INSTALL_DIR, VARS_FILE);
        let pkg_dst = format!("{}/{}", INSTALL_DIR, PACKAGE_FILE);
        let env = Self::script_env(job);

        trace.info(&format!("Pushing: {}", script_dst));
        self.fleet
            .push_file(name, &script_dst, script, FILE_MODE)
            .await
            .map_err(|e| failed(format!("push {}: {}", script_dst, e)))?;
        trace.info(&format!("Pushing: {}", vars_dst));
        self.fleet
            .push_file(name, &vars_dst, StringUtil::env_file(&env).into_bytes(), FILE_MODE)
            .await
            .map_err(|e| failed(format!("push {}: {}", vars_dst, e)))?;
        trace.info(&format!("Pushing: {}", pkg_dst));
        self.fleet
            .push_file(name, &pkg_dst, package, FILE_MODE)
            .await
            .map_err(|e| failed(format!("push {}: {}", pkg_dst, e)))?;

        trace.info(&format!("Executing: {}", script_dst));
        let output = self
            .fleet
            .execute(name, &[script_dst.clone()], &env)
            .await
            .map_err(|e| failed(format!("exec {}: {}", script_dst, e)))?;

        if !output.success() {
            trace.error(&format!("===STDOUT====\n{}", output.stdout));
            trace.error(&format!("===STDERR====\n{}", output.stderr));
            return Err(failed(format!("provisioner exit code: {}", output.exit_code)));
        }
        trace.verbose(&format!("===STDOUT====\n{}", output.stdout));
        trace.verbose(&format!("===STDERR====\n{}", output.stderr));
        Ok(())
    }

    /// Create the install directory, retrying while the guest agent comes up.
    async fn wait_for_guest(&self, name: &str, trace: &Tracing) -> Result<(), ProvisionError> {
        for attempt in 1..=GUEST_AGENT_ATTEMPTS {
            match self.fleet.mkdir(name, INSTALL_DIR, FILE_MODE).await {
                Ok(()) => {
                    trace.info(&format!("Make dir: {}", INSTALL_DIR));
                    return Ok(());
                }
                Err(e) => {
                    trace.verbose(&format!(
                        "Guest not ready (attempt {}/{}): {}",
                        attempt, GUEST_AGENT_ATTEMPTS, e
                    ));
                    if attempt < GUEST_AGENT_ATTEMPTS {
                        tokio::time::sleep(GUEST_AGENT_RETRY_DELAY).await;
                    }
                }
            }
        }
        Err(ProvisionError::Unreachable(LifecycleError::GuestUnreachable {
            instance: name.to_string(),
            attempts: GUEST_AGENT_ATTEMPTS,
        }))
    }

    // -----------------------------------------------------------------------
    // CleaningUp
    // -----------------------------------------------------------------------

    async fn fail_with_cleanup(
        &self,
        name: &str,
        error: LifecycleError,
        failed_in: LifecyclePhase,
        trace: &Tracing,
    ) -> LaunchFailure {
        trace.error_err(&error);
        trace.verbose(&format!("-> {}", LifecyclePhase::CleaningUp));
        let release_slot = self.cleanup_instance(name, trace).await;
        trace.verbose(&format!("-> {}", LifecyclePhase::Failed));
        LaunchFailure {
            error,
            failed_in,
            release_slot,
        }
    }

    /// Stop and delete `name`. Returns true once the instance is known to
    /// be gone.
    async fn cleanup_instance(&self, name: &str, trace: &Tracing) -> bool {
        if !self.cleanup {
            trace.error("Runner start failed, CLEANUP DISABLED; leaving instance for inspection");
            return false;
        }
        trace.error(&format!("Runner start failed, destroying {}", name));

        match self.fleet.stop_instance(name, false).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => return true,
            // Usually "already stopped"; the delete below decides.
            Err(e) => trace.verbose(&format!("Stop failed: {}", e)),
        }

        match self.fleet.delete_instance(name).await {
            Ok(()) => true,
            Err(e) if e.is_not_found() => true,
            Err(source) => {
                let error = LifecycleError::Cleanup {
                    instance: name.to_string(),
                    source,
                };
                trace.error_err(&error);
                false
            }
        }
    }
}

/// Name of the setup script inside the instance.
pub fn script_destination(script: &Path) -> String {
    let name = script
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "setup.sh".to_string());
    format!("{}/{}", INSTALL_DIR, name)
}
