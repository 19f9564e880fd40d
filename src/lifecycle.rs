//! Stop requests, OS termination signals and the orphan watchdog

use std::fmt;
use tokio::sync::mpsc;

/// Why the lifecycle loop is ending
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// `stop()` or `GET /shutdown`
    Requested,
    /// SIGINT or SIGTERM
    Signal(&'static str),
    /// The launching process went away
    ParentExited,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Requested => write!(f, "stop requested"),
            Self::Signal(name) => write!(f, "received {}", name),
            Self::ParentExited => write!(f, "parent process exited"),
        }
    }
}

/// Sending half of the stop channel; cheap to clone
#[derive(Debug, Clone)]
pub struct StopHandle {
    tx: mpsc::Sender<StopReason>,
}

impl StopHandle {
    /// Ask the loop to stop.
    ///
    /// Returns false when a stop is already pending or the loop is gone. Never
    /// blocks.
    pub fn request(&self, reason: StopReason) -> bool {
        self.tx.try_send(reason).is_ok()
    }
}

/// Receiving half, owned by the lifecycle loop
#[derive(Debug)]
pub struct StopReceiver {
    rx: mpsc::Receiver<StopReason>,
}

impl StopReceiver {
    /// Next stop request; `None` once every handle is dropped
    pub async fn recv(&mut self) -> Option<StopReason> {
        self.rx.recv().await
    }
}

/// Capacity-1 stop channel; a second request while one is pending is dropped
pub fn stop_channel() -> (StopHandle, StopReceiver) {
    let (tx, rx) = mpsc::channel(1);
    (StopHandle { tx }, StopReceiver { rx })
}

/// Resolves on the first SIGINT or SIGTERM
pub async fn termination_signal() -> StopReason {
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to listen for SIGINT: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                if term.recv().await.is_none() {
                    std::future::pending::<()>().await;
                }
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => StopReason::Signal("SIGINT"),
        _ = terminate => StopReason::Signal("SIGTERM"),
    }
}

/// Detects that the process which launched us has exited.
///
/// On Unix an orphan is re-parented, so a parent pid different from the one
/// seen at startup means the launcher is gone.
#[derive(Debug, Clone)]
pub struct ParentWatchdog {
    initial: Option<u32>,
}

impl ParentWatchdog {
    pub fn new(enabled: bool) -> Self {
        Self {
            initial: if enabled { current_parent() } else { None },
        }
    }

    pub fn disabled() -> Self {
        Self { initial: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.initial.is_some()
    }

    pub fn parent_exited(&self) -> bool {
        match (self.initial, current_parent()) {
            (Some(initial), Some(now)) => initial != now,
            _ => false,
        }
    }
}

#[cfg(unix)]
fn current_parent() -> Option<u32> {
    Some(std::os::unix::process::parent_id())
}

#[cfg(not(unix))]
fn current_parent() -> Option<u32> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stop_channel_holds_one_request() {
        let (handle, mut rx) = stop_channel();
        assert!(handle.request(StopReason::Requested));
        assert!(!handle.request(StopReason::ParentExited));
        assert_eq!(rx.recv().await, Some(StopReason::Requested));

        assert!(handle.clone().request(StopReason::Signal("SIGTERM")));
        assert_eq!(rx.recv().await, Some(StopReason::Signal("SIGTERM")));
    }

    #[tokio::test]
    async fn test_request_after_receiver_dropped() {
        let (handle, rx) = stop_channel();
        drop(rx);
        assert!(!handle.request(StopReason::Requested));
    }

    #[test]
    fn test_watchdog() {
        let disabled = ParentWatchdog::disabled();
        assert!(!disabled.is_enabled());
        assert!(!disabled.parent_exited());

        let watchdog = ParentWatchdog::new(true);
        assert_eq!(watchdog.is_enabled(), cfg!(unix));
        assert!(!watchdog.parent_exited());
    }

    #[test]
    fn test_reason_display() {
        assert_eq!(StopReason::Signal("SIGINT").to_string(), "received SIGINT");
        assert_eq!(StopReason::ParentExited.to_string(), "parent process exited");
    }
}
