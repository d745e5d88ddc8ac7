//! Adapter state monitoring.
//!
//! Tracks the radio's power/authorization state as reported by the
//! platform. Scans and connects are gated on [`AdapterState::PoweredOn`].

use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::utils::broadcast_stream;

/// Power/authorization state of the local adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AdapterState {
    /// State not reported yet.
    #[default]
    Unknown,
    /// No BLE support on this host.
    Unsupported,
    /// The app is not allowed to use Bluetooth.
    Unauthorized,
    /// The radio is off.
    PoweredOff,
    /// The radio is restarting.
    Resetting,
    /// The radio is on and usable.
    PoweredOn,
}

impl AdapterState {
    /// Check whether scans and connects are allowed.
    pub fn is_powered_on(&self) -> bool {
        matches!(self, Self::PoweredOn)
    }
}

impl std::fmt::Display for AdapterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown => write!(f, "Unknown"),
            Self::Unsupported => write!(f, "Unsupported"),
            Self::Unauthorized => write!(f, "Unauthorized"),
            Self::PoweredOff => write!(f, "PoweredOff"),
            Self::Resetting => write!(f, "Resetting"),
            Self::PoweredOn => write!(f, "PoweredOn"),
        }
    }
}

/// Outcome of applying a platform state report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterTransition {
    /// The report repeated the current state.
    Unchanged,
    /// The adapter became usable.
    PoweredOn,
    /// The adapter stopped being usable; all radio activity is void.
    Lost(AdapterState),
    /// Some other change between unusable states.
    Changed(AdapterState),
}

/// Holds the current [`AdapterState`] and broadcasts changes.
pub struct AdapterMonitor {
    /// Current state.
    state: RwLock<AdapterState>,
    /// Channel for state changes.
    state_tx: broadcast::Sender<AdapterState>,
}

impl AdapterMonitor {
    /// Create a monitor starting from `initial`.
    pub fn new(initial: AdapterState, capacity: usize) -> Self {
        let (state_tx, _) = broadcast::channel(capacity.max(1));

        Self {
            state: RwLock::new(initial),
            state_tx,
        }
    }

    /// Get the current adapter state.
    pub fn state(&self) -> AdapterState {
        *self.state.read()
    }

    /// Fail with [`Error::AdapterUnavailable`] unless powered on.
    pub fn ensure_powered_on(&self) -> Result<()> {
        let state = self.state();
        if state.is_powered_on() {
            Ok(())
        } else {
            debug!("Rejecting operation, adapter is {}", state);
            Err(Error::AdapterUnavailable { state })
        }
    }

    /// Stream the current state followed by every change.
    pub fn observe(&self) -> BoxStream<'static, AdapterState> {
        // Subscribe under the read lock so no change slips between the two.
        let state = self.state.read();
        let rx = self.state_tx.subscribe();
        let current = *state;
        drop(state);

        stream::once(async move { current })
            .chain(broadcast_stream(rx))
            .boxed()
    }

    /// Apply a state reported by the platform.
    pub(crate) fn update(&self, new_state: AdapterState) -> AdapterTransition {
        let old_state = {
            let mut state = self.state.write();
            let old = *state;
            *state = new_state;
            if old != new_state {
                let _ = self.state_tx.send(new_state);
            }
            old
        };

        if old_state == new_state {
            return AdapterTransition::Unchanged;
        }

        info!("Adapter state changed: {} -> {}", old_state, new_state);

        match (old_state.is_powered_on(), new_state.is_powered_on()) {
            (false, true) => AdapterTransition::PoweredOn,
            (true, false) => {
                warn!("Adapter left PoweredOn, radio activity is lost");
                AdapterTransition::Lost(new_state)
            }
            _ => AdapterTransition::Changed(new_state),
        }
    }
}
