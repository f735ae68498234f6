/// Ctrl-C or SIGTERM, whichever comes first. The SIGTERM stream is created
/// up front so a signal sent while the listener is binding is kept.
pub struct ShutdownSignal {
    #[cfg(unix)]
    term: tokio::signal::unix::Signal,
}

impl ShutdownSignal {
    pub fn install() -> std::io::Result<Self> {
        Ok(Self {
            #[cfg(unix)]
            term: tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?,
        })
    }

    pub async fn recv(mut self) -> &'static str {
        let ctrl_c = async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::warn!(%err, "ctrl-c handler failed");
                std::future::pending::<()>().await;
            }
        };
        #[cfg(unix)]
        let term = self.term.recv();
        #[cfg(not(unix))]
        let term = std::future::pending::<Option<()>>();

        tokio::select! {
            _ = ctrl_c => "SIGINT",
            _ = term => "SIGTERM",
        }
    }
}
