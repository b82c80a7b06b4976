//! Component lifecycle contract and the readiness gate.
//!
//! Every daemon subsystem implements [`Component`]. Subsystems whose startup
//! finishes after construction also implement [`AsyncComponent`] and expose a
//! [`ReadinessHandle`] that dependents await before issuing work.
//!
//! The gate is a broadcast-once cell built on `tokio::sync::watch`: it resolves
//! at most once, any number of handles may wait on it, and a handle created
//! after resolution still observes the outcome.

use std::future::Future;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::GateError;

/// A subsystem participating in the daemon lifecycle.
///
/// `shutdown` releases everything the component owns even when startup never
/// completed, must be bounded in time, and must succeed when called again.
pub trait Component: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    fn shutdown(&self) -> impl Future<Output = Result<(), Self::Error>> + Send;
}

/// A [`Component`] that becomes usable asynchronously.
pub trait AsyncComponent: Component {
    fn wait_for_ready(&self) -> ReadinessHandle;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GateState {
    Pending,
    Open,
    Closed,
}

/// Single-fire readiness signal, owned by the component that becomes ready.
#[derive(Debug)]
pub struct ReadinessGate {
    tx: watch::Sender<GateState>,
}

impl Default for ReadinessGate {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadinessGate {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(GateState::Pending);
        Self { tx }
    }

    /// Signal readiness. Returns `false` if the gate had already resolved.
    pub fn open(&self) -> bool {
        self.resolve(GateState::Open)
    }

    /// Release waiters without signaling readiness. Returns `false` if the gate
    /// had already resolved; an open gate stays open.
    pub fn close(&self) -> bool {
        self.resolve(GateState::Closed)
    }

    pub fn is_open(&self) -> bool {
        *self.tx.borrow() == GateState::Open
    }

    pub fn is_resolved(&self) -> bool {
        *self.tx.borrow() != GateState::Pending
    }

    pub fn handle(&self) -> ReadinessHandle {
        ReadinessHandle {
            rx: self.tx.subscribe(),
        }
    }

    fn resolve(&self, to: GateState) -> bool {
        self.tx.send_if_modified(|state| {
            if *state == GateState::Pending {
                *state = to;
                true
            } else {
                false
            }
        })
    }
}

/// Cloneable view of a [`ReadinessGate`].
#[derive(Debug, Clone)]
pub struct ReadinessHandle {
    rx: watch::Receiver<GateState>,
}

impl ReadinessHandle {
    /// `true` once the gate has opened. Never reverts.
    pub fn is_ready(&self) -> bool {
        *self.rx.borrow() == GateState::Open
    }

    /// Wait until the gate resolves.
    ///
    /// Returns [`GateError::Closed`] if the component gave up (or was dropped)
    /// before becoming ready.
    pub async fn wait(mut self) -> Result<(), GateError> {
        let resolved = self
            .rx
            .wait_for(|state| *state != GateState::Pending)
            .await
            .map(|state| *state);
        match resolved {
            Ok(GateState::Open) => Ok(()),
            _ => Err(GateError::Closed),
        }
    }

    /// Like [`wait`](Self::wait), but gives up with [`GateError::Canceled`]
    /// when `cancel` fires first.
    pub async fn wait_cancellable(self, cancel: &CancellationToken) -> Result<(), GateError> {
        tokio::select! {
            biased;
            result = self.wait() => result,
            _ = cancel.cancelled() => Err(GateError::Canceled),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
