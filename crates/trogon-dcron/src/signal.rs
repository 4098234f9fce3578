use tracing::warn;

/// The process signal that asked the node to leave its namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Interrupt,
    Terminate,
}

impl ShutdownSignal {
    pub fn name(self) -> &'static str {
        match self {
            Self::Interrupt => "SIGINT",
            Self::Terminate => "SIGTERM",
        }
    }
}

/// First of Ctrl-C or SIGTERM. A handler that fails to install is logged and
/// left pending.
pub async fn wait_for_shutdown() -> ShutdownSignal {
    tokio::select! {
        signal = interrupt() => signal,
        signal = terminate() => signal,
    }
}

async fn interrupt() -> ShutdownSignal {
    if let Err(error) = tokio::signal::ctrl_c().await {
        warn!(error = %error, "Ctrl+C handler unavailable");
        return std::future::pending().await;
    }
    ShutdownSignal::Interrupt
}

#[cfg(unix)]
async fn terminate() -> ShutdownSignal {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut stream) => {
            stream.recv().await;
            ShutdownSignal::Terminate
        }
        Err(error) => {
            warn!(error = %error, "SIGTERM handler unavailable");
            std::future::pending().await
        }
    }
}

#[cfg(not(unix))]
async fn terminate() -> ShutdownSignal {
    std::future::pending().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_names() {
        assert_eq!(ShutdownSignal::Interrupt.name(), "SIGINT");
        assert_eq!(ShutdownSignal::Terminate.name(), "SIGTERM");
    }
}
