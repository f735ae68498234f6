use std::{path::Path, process::Stdio};

use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::{Child, Command},
};

use crate::error::{Error, Result};
use crate::templates::WorkerConfig;

/// Everything needed to start one worker process.
pub(crate) struct WorkerLaunch<'a> {
    pub identifier: &'a str,
    pub launcher: &'a [String],
    pub command: &'a str,
    pub recipe_file: Option<&'a Path>,
    pub session_env_var: &'a str,
    pub session_name: &'a str,
    pub config_env_var: &'a str,
    pub config: &'a WorkerConfig,
}

/// `launcher... <command tokens...> [-F <recipe file>]`
pub(crate) fn build_argv(launcher: &[String], command: &str, recipe_file: Option<&Path>) -> Vec<String> {
    let mut argv: Vec<String> = launcher.to_vec();
    argv.extend(command.split_whitespace().map(str::to_string));
    if let Some(file) = recipe_file {
        argv.push("-F".to_string());
        argv.push(file.display().to_string());
    }
    argv
}

#[cfg(target_os = "linux")]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    // The worker gets SIGTERM if the agent dies without a clean shutdown.
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    Ok(())
}

fn forward_output(identifier: &str, child: &mut Child) {
    if let Some(out) = child.stdout.take() {
        let identifier = identifier.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(out).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::info!(target: "progeny::worker", identifier = %identifier, "{line}");
            }
        });
    }
    if let Some(err) = child.stderr.take() {
        let identifier = identifier.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(err).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::warn!(target: "progeny::worker", identifier = %identifier, "{line}");
            }
        });
    }
}

/// Start the worker in its own session. The child inherits our environment
/// plus the session allowlist and the JSON config overrides.
pub(crate) fn spawn_worker(launch: &WorkerLaunch<'_>) -> Result<Child> {
    let argv = build_argv(launch.launcher, launch.command, launch.recipe_file);
    let Some((exec, args)) = argv.split_first() else {
        return Err(Error::Config("launcher and command are both empty".to_string()));
    };

    let config_json = serde_json::to_string(launch.config)
        .map_err(|e| Error::Config(format!("encode worker config: {e}")))?;

    let mut cmd = Command::new(exec);
    cmd.args(args)
        .env(launch.session_env_var, launch.session_name)
        .env(launch.config_env_var, &config_json)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    #[cfg(unix)]
    {
        unsafe {
            cmd.pre_exec(|| {
                set_parent_death_signal()?;
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }

    let command_line = argv.join(" ");
    tracing::info!(
        identifier = launch.identifier,
        session = launch.session_name,
        command = %command_line,
        config = %config_json,
        "starting worker"
    );
    let mut child = cmd.spawn().map_err(|source| Error::Spawn {
        command: command_line,
        source,
    })?;
    forward_output(launch.identifier, &mut child);
    Ok(child)
}

/// Detach from a registered worker. Only reaps the exit status; the registry
/// stays the source of truth.
pub(crate) fn reap_in_background(identifier: &str, mut child: Child) {
    let identifier = identifier.to_string();
    tokio::spawn(async move {
        match child.wait().await {
            Ok(status) => tracing::info!(identifier = %identifier, %status, "worker exited"),
            Err(err) => tracing::warn!(identifier = %identifier, %err, "wait for worker failed"),
        }
    });
}
