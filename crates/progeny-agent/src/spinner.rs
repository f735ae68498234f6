use std::time::Duration;

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use progeny_process::{NO_EXPIRY, WorkerRecord, is_valid_session_name};
use tokio::process::Child;

use crate::config::{InstanceSpec, ProgenyConfig};
use crate::error::{Error, Result};
use crate::process_manager::ProcessRegistry;
use crate::process_manager_support::{now_unix, send_sigterm, wait_for_local_tcp_port};
use crate::recipes::Capabilities;
use crate::templates::{CommandBuilder, LaunchSpec, WorkerConfig};
use crate::worker::{WorkerLaunch, reap_in_background, spawn_worker};

/// How workers are started. Taken from [`ProgenyConfig`].
#[derive(Debug, Clone)]
pub struct LaunchSettings {
    pub launcher: Vec<String>,
    pub session_env_var: String,
    pub config_env_var: String,
    pub startup_check: Duration,
    pub ready_timeout: Option<Duration>,
    pub worker_timeout: Option<Duration>,
    pub uniquify_sessions: bool,
}

impl LaunchSettings {
    pub fn from_config(cfg: &ProgenyConfig) -> Self {
        Self {
            launcher: cfg.launcher.clone(),
            session_env_var: cfg.session_env_var.clone(),
            config_env_var: cfg.config_env_var.clone(),
            startup_check: Duration::from_millis(cfg.startup_check_ms),
            ready_timeout: cfg.ready_timeout_ms.map(Duration::from_millis),
            worker_timeout: cfg.worker_timeout_sec.map(Duration::from_secs),
            uniquify_sessions: cfg.uniquify_sessions,
        }
    }
}

/// Session name for a worker. A random suffix keeps the routing token in a
/// shared URL from being guessed from the identifier.
pub fn build_session_name(identifier: &str, uniquify: bool) -> String {
    if !uniquify {
        return identifier.to_string();
    }
    let bytes: [u8; 12] = rand::random();
    format!("{identifier}-{}", URL_SAFE_NO_PAD.encode(bytes))
}

/// What a shutdown did, for the caller's exit path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    pub swept: usize,
}

/// Ties the command builder, port pool and registry together.
pub struct Progeny {
    builder: CommandBuilder,
    registry: ProcessRegistry,
    capabilities: Capabilities,
    settings: LaunchSettings,
}

impl Progeny {
    pub fn new(
        builder: CommandBuilder,
        registry: ProcessRegistry,
        capabilities: Capabilities,
        settings: LaunchSettings,
    ) -> Self {
        Self {
            builder,
            registry,
            capabilities,
            settings,
        }
    }

    pub fn registry(&self) -> &ProcessRegistry {
        &self.registry
    }

    pub fn builder(&self) -> &CommandBuilder {
        &self.builder
    }

    /// Start a worker for `identifier` and register it.
    ///
    /// `uniquify` overrides the configured session naming. Identifiers that
    /// would not make a valid session name are refused before any port is
    /// reserved. The port is only provisional until the record is committed;
    /// every failure before that gives it back.
    pub async fn spin(
        &self,
        identifier: &str,
        launch: &LaunchSpec,
        uniquify: Option<bool>,
    ) -> Result<(u16, String)> {
        let (command, config) = self.builder.resolve(launch)?;
        let session_name =
            build_session_name(identifier, uniquify.unwrap_or(self.settings.uniquify_sessions));
        if !is_valid_session_name(&session_name) {
            return Err(Error::InvalidIdentifier(identifier.to_string()));
        }
        let reservation = self.registry.reserve(identifier).await?;
        let port = reservation.port();

        let (child, record) = match self
            .start_worker(identifier, &session_name, port, &command, config)
            .await
        {
            Ok(started) => started,
            Err(err) => {
                self.registry.release(reservation).await;
                return Err(err);
            }
        };

        if let Err(err) = self.registry.commit(reservation, &record).await {
            abort_worker(child).await;
            return Err(err);
        }
        reap_in_background(identifier, child);

        tracing::info!(
            identifier,
            session = %session_name,
            port,
            pid = record.pid,
            "worker started"
        );
        Ok((port, session_name))
    }

    pub async fn spin_instance(&self, instance: &InstanceSpec) -> Result<(u16, String)> {
        self.spin(&instance.identifier, &instance.launch, instance.uniquify)
            .await
    }

    async fn start_worker(
        &self,
        identifier: &str,
        session_name: &str,
        port: u16,
        command: &str,
        mut config: WorkerConfig,
    ) -> Result<(Child, WorkerRecord)> {
        config.insert("port".to_string(), port.into());
        let recipe_file = command
            .split_whitespace()
            .next()
            .and_then(|name| self.capabilities.source(name));

        let mut child = spawn_worker(&WorkerLaunch {
            identifier,
            launcher: &self.settings.launcher,
            command,
            recipe_file,
            session_env_var: &self.settings.session_env_var,
            session_name,
            config_env_var: &self.settings.config_env_var,
            config: &config,
        })?;

        let Some(pid) = child.id() else {
            return Err(Error::WorkerExited {
                identifier: identifier.to_string(),
                status: "no pid".to_string(),
            });
        };

        tokio::time::sleep(self.settings.startup_check).await;
        if let Some(status) = child.try_wait()? {
            return Err(Error::WorkerExited {
                identifier: identifier.to_string(),
                status: status.to_string(),
            });
        }

        if let Some(timeout) = self.settings.ready_timeout
            && !wait_for_local_tcp_port(port, timeout).await
        {
            abort_worker(child).await;
            return Err(Error::WorkerNotReady {
                identifier: identifier.to_string(),
                port,
            });
        }

        let now = now_unix();
        let expiry_timestamp = self
            .settings
            .worker_timeout
            .map(|t| now.saturating_add(i64::try_from(t.as_secs()).unwrap_or(i64::MAX)))
            .unwrap_or(NO_EXPIRY)
            .min(NO_EXPIRY);

        Ok((
            child,
            WorkerRecord {
                identifier: identifier.to_string(),
                session_name: session_name.to_string(),
                port,
                pid,
                expiry_timestamp,
                created_at: now,
            },
        ))
    }

    /// Stop the cleaning timer, terminate every worker, then tear down the
    /// registry. Safe to call while a scheduled pass is running.
    pub async fn shutdown(&self) -> Result<ShutdownReport> {
        tracing::info!("shutting down: cleaning up all workers");
        let swept = self.registry.teardown().await?;
        tracing::info!(count = swept, "shutdown complete");
        Ok(ShutdownReport { swept })
    }
}

async fn abort_worker(mut child: Child) {
    if let Some(pid) = child.id() {
        let _ = send_sigterm(pid);
    }
    if let Err(err) = child.kill().await {
        tracing::debug!(%err, "kill worker");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_name_is_identifier_unless_uniquified() {
        assert_eq!(build_session_name("alice", false), "alice");

        let a = build_session_name("alice", true);
        let b = build_session_name("alice", true);
        assert!(a.starts_with("alice-"));
        assert_ne!(a, b);
        assert!(is_valid_session_name(&a));
        assert!(
            a["alice-".len()..]
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        );
    }
}
