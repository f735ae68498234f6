use std::time::Duration;

pub(crate) fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.trim().parse::<u64>().ok())
}

pub(crate) fn env_bool(name: &str) -> Option<bool> {
    std::env::var(name).ok().map(|v| {
        matches!(
            v.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

pub(crate) fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}

pub fn format_error_chain(err: &anyhow::Error) -> String {
    let mut parts = Vec::<String>::new();
    for cause in err.chain() {
        let s = cause.to_string();
        if s.is_empty() {
            continue;
        }
        if parts.last() == Some(&s) {
            continue;
        }
        parts.push(s);
    }
    if parts.is_empty() {
        "unknown error".to_string()
    } else {
        parts.join(": ")
    }
}

// pid 0 and 1 are never ours; kill(0, ..) would hit our own process group.
fn signalable(pid: u32) -> Option<i32> {
    i32::try_from(pid).ok().filter(|p| *p > 1)
}

#[cfg(target_os = "linux")]
fn is_zombie(pid: u32) -> bool {
    let Ok(s) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
        return false;
    };
    // State is the first field after the parenthesized comm.
    s.rfind(')')
        .and_then(|end| s.get(end + 2..))
        .and_then(|rest| rest.chars().next())
        .is_some_and(|state| state == 'Z')
}

#[cfg(not(target_os = "linux"))]
fn is_zombie(_pid: u32) -> bool {
    false
}

/// Whether an OS process with this pid exists (and is not a zombie).
#[cfg(unix)]
pub fn pid_is_alive(pid: u32) -> bool {
    let Some(p) = signalable(pid) else {
        return false;
    };
    let rc = unsafe { libc::kill(p, 0) };
    let exists = rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM);
    exists && !is_zombie(pid)
}

#[cfg(not(unix))]
pub fn pid_is_alive(_pid: u32) -> bool {
    false
}

/// SIGTERM the worker's process group, falling back to the pid alone when it
/// does not lead a group.
#[cfg(unix)]
pub fn send_sigterm(pid: u32) -> std::io::Result<()> {
    let Some(p) = signalable(pid) else {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("refusing to signal pid {pid}"),
        ));
    };
    if unsafe { libc::kill(-p, libc::SIGTERM) } == 0 {
        return Ok(());
    }
    if unsafe { libc::kill(p, libc::SIGTERM) } == 0 {
        return Ok(());
    }
    Err(std::io::Error::last_os_error())
}

#[cfg(not(unix))]
pub fn send_sigterm(pid: u32) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        format!("cannot signal pid {pid} on this platform"),
    ))
}

/// Best-effort: signal, wait out the grace period, log what happened.
pub async fn terminate_pid(pid: u32, grace: Duration) {
    if !pid_is_alive(pid) {
        tracing::info!(pid, "process already gone");
        return;
    }
    if let Err(err) = send_sigterm(pid) {
        tracing::warn!(pid, %err, "failed to send SIGTERM");
        return;
    }
    tokio::time::sleep(grace).await;
    if pid_is_alive(pid) {
        tracing::warn!(pid, grace_ms = grace.as_millis() as u64, "process still alive after SIGTERM");
    } else {
        tracing::info!(pid, "terminated process");
    }
}

pub async fn wait_for_local_tcp_port(port: u16, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Ok(s) = tokio::net::TcpStream::connect(("127.0.0.1", port)).await {
            drop(s);
            return true;
        }

        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
}

/// SIGTERM, SIGINT and SIGQUIT streams. Created before any worker starts so
/// a signal during startup still leads to a clean shutdown.
pub struct ShutdownSignals {
    term: tokio::signal::unix::Signal,
    int: tokio::signal::unix::Signal,
    quit: tokio::signal::unix::Signal,
}

impl ShutdownSignals {
    pub fn install() -> std::io::Result<Self> {
        use tokio::signal::unix::{SignalKind, signal};
        Ok(Self {
            term: signal(SignalKind::terminate())?,
            int: signal(SignalKind::interrupt())?,
            quit: signal(SignalKind::quit())?,
        })
    }

    /// Name of the first signal received since [`ShutdownSignals::install`].
    pub async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.term.recv() => "SIGTERM",
            _ = self.int.recv() => "SIGINT",
            _ = self.quit.recv() => "SIGQUIT",
        }
    }
}
