//! Pipeline status: Disabled / Idle / Translating / Tripped / Misconfigured.
//! Held behind an RwLock and mirrored on a watch channel for subscribers.

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum PipelineState {
    /// Translation switched off; submissions are dropped.
    Disabled,
    /// Enabled and waiting for work.
    Idle,
    /// A cycle is running.
    Translating,
    /// The character circuit breaker fired.
    Tripped,
    /// Startup configuration is unusable. Nothing can enable translation.
    Misconfigured,
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineState::Disabled => write!(f, "Disabled"),
            PipelineState::Idle => write!(f, "Idle"),
            PipelineState::Translating => write!(f, "Translating"),
            PipelineState::Tripped => write!(f, "Tripped"),
            PipelineState::Misconfigured => write!(f, "Misconfigured"),
        }
    }
}

impl PipelineState {
    pub fn is_enabled(self) -> bool {
        matches!(self, PipelineState::Idle | PipelineState::Translating)
    }
}

/// What the host shows to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineStatus {
    pub state: PipelineState,
    pub message: Option<String>,
    /// Needs the user's attention (breaker or configuration problem).
    pub highlighted: bool,
}

impl PipelineStatus {
    fn plain(state: PipelineState) -> Self {
        Self {
            state,
            message: None,
            highlighted: false,
        }
    }
}

pub struct StatusBoard {
    status: RwLock<PipelineStatus>,
    status_tx: watch::Sender<PipelineStatus>,
    status_rx: watch::Receiver<PipelineStatus>,
}

impl StatusBoard {
    pub fn new(enabled: bool) -> Self {
        let initial = PipelineStatus::plain(if enabled {
            PipelineState::Idle
        } else {
            PipelineState::Disabled
        });
        let (status_tx, status_rx) = watch::channel(initial.clone());
        Self {
            status: RwLock::new(initial),
            status_tx,
            status_rx,
        }
    }

    pub fn current(&self) -> PipelineStatus {
        self.status.read().clone()
    }

    pub fn state(&self) -> PipelineState {
        self.status.read().state
    }

    pub fn is_enabled(&self) -> bool {
        self.state().is_enabled()
    }

    /// Flip enabled/disabled. Returns whether translation is now enabled.
    pub fn toggle(&self) -> bool {
        let enable = !self.is_enabled();
        self.force_enable(enable)
    }

    /// Set enabled explicitly. Clears a tripped breaker when enabling.
    /// Has no effect while misconfigured.
    pub fn force_enable(&self, enable: bool) -> bool {
        let mut status = self.status.write();
        let prev = status.state;
        if prev == PipelineState::Misconfigured {
            warn!("translation cannot be enabled: pipeline is misconfigured");
            return false;
        }
        if prev.is_enabled() == enable {
            return enable;
        }
        *status = PipelineStatus::plain(if enable {
            PipelineState::Idle
        } else {
            PipelineState::Disabled
        });
        let _ = self.status_tx.send(status.clone());
        info!(from = %prev, to = %status.state, "translation toggled");
        enable
    }

    /// Circuit breaker fired: disable and raise a highlighted message.
    pub fn trip(&self, message: String) {
        let mut status = self.status.write();
        let prev = status.state;
        *status = PipelineStatus {
            state: PipelineState::Tripped,
            message: Some(message),
            highlighted: true,
        };
        let _ = self.status_tx.send(status.clone());
        warn!(from = %prev, message = ?status.message, "translation circuit breaker tripped");
    }

    /// Permanent configuration failure.
    pub fn misconfigured(&self, message: String) {
        let mut status = self.status.write();
        *status = PipelineStatus {
            state: PipelineState::Misconfigured,
            message: Some(message),
            highlighted: true,
        };
        let _ = self.status_tx.send(status.clone());
        warn!(message = ?status.message, "pipeline misconfigured");
    }

    /// Idle -> Translating. Returns false when translation is not enabled.
    pub fn begin_cycle(&self) -> bool {
        let mut status = self.status.write();
        match status.state {
            PipelineState::Idle => {
                status.state = PipelineState::Translating;
                let _ = self.status_tx.send(status.clone());
                true
            }
            PipelineState::Translating => true,
            _ => false,
        }
    }

    /// Translating -> Idle. Any other state set during the cycle is kept.
    pub fn end_cycle(&self) {
        let mut status = self.status.write();
        if status.state == PipelineState::Translating {
            status.state = PipelineState::Idle;
            let _ = self.status_tx.send(status.clone());
        }
    }

    /// Subscribe to status changes.
    pub fn subscribe(&self) -> watch::Receiver<PipelineStatus> {
        self.status_rx.clone()
    }
}
