//! BLE connection management.
//!
//! Drives each device through the connection lifecycle:
//!
//! ```text
//! Disconnected -> Connecting -> DiscoveringServices -> Subscribing -> Connected
//!                     |                 |                   |             |
//!                     +---------> Failed(kind) <------------+       Disconnecting
//!                                       |                                 |
//!                                       +--------> Disconnected <---------+
//! ```
//!
//! At most one attempt runs per device. Concurrent `connect` calls for the
//! same device join the attempt already in flight and share its outcome.

use futures::future::{BoxFuture, FutureExt, Shared};
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::ble::adapter::{AdapterMonitor, AdapterState};
use crate::ble::notifications::Subscription;
use crate::ble::platform::{BlePlatform, GattCharacteristic, GattService};
use crate::ble::resolver::{self, TargetCharacteristic};
use crate::config::ManagerConfig;
use crate::data::{DeviceId, Reading};
use crate::error::{ConnectError, Error, ErrorKind, Result};
use crate::protocol::Decoder;
use crate::utils::broadcast_stream;

/// Connection state of one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ConnectionState {
    /// No link.
    #[default]
    Disconnected,
    /// Link being established.
    Connecting,
    /// Link up, enumerating services.
    DiscoveringServices,
    /// Target characteristic found, enabling notifications.
    Subscribing,
    /// Link up and notifications flowing.
    Connected,
    /// Teardown in progress.
    Disconnecting,
    /// The attempt failed. Always followed by `Disconnected`.
    Failed(ErrorKind),
}

impl ConnectionState {
    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Check if a connect attempt is in flight.
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::DiscoveringServices | Self::Subscribing
        )
    }

    /// Check if in a transitional state.
    pub fn is_transitioning(&self) -> bool {
        self.is_in_flight() || matches!(self, Self::Disconnecting)
    }

    /// Check whether `next` is a legal successor of this state.
    pub fn can_transition_to(&self, next: &ConnectionState) -> bool {
        use ConnectionState::*;

        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, DiscoveringServices)
                | (DiscoveringServices, Subscribing)
                | (Subscribing, Connected)
                | (Connected, Disconnecting)
                | (Disconnecting, Disconnected)
                | (Connecting | DiscoveringServices | Subscribing, Failed(_))
                | (Failed(_), Disconnected)
        )
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::DiscoveringServices => write!(f, "Discovering services"),
            Self::Subscribing => write!(f, "Subscribing"),
            Self::Connected => write!(f, "Connected"),
            Self::Disconnecting => write!(f, "Disconnecting"),
            Self::Failed(kind) => write!(f, "Failed ({})", kind),
        }
    }
}

/// Event for connection state changes.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionEvent {
    /// The device whose state changed.
    pub identifier: DeviceId,
    /// The new connection state.
    pub state: ConnectionState,
}

/// A live connection with its notification subscription.
#[derive(Clone)]
pub struct ConnectionHandle {
    device_id: DeviceId,
    characteristic: GattCharacteristic,
    subscription: Arc<Subscription>,
}

impl ConnectionHandle {
    /// The connected device.
    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// The characteristic notifications come from.
    pub fn characteristic(&self) -> &GattCharacteristic {
        &self.characteristic
    }

    /// Service holding the subscribed characteristic.
    pub fn service_uuid(&self) -> Uuid {
        self.characteristic.service_uuid
    }

    /// Stream of decoded readings. Ends when the connection is torn down.
    pub fn readings(&self) -> BoxStream<'static, Reading> {
        self.subscription.readings()
    }

    /// Check if the subscription is still live.
    pub fn is_active(&self) -> bool {
        self.subscription.is_active()
    }

    /// Check if two handles refer to the same established connection.
    pub fn same_connection(&self, other: &ConnectionHandle) -> bool {
        Arc::ptr_eq(&self.subscription, &other.subscription)
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("device_id", &self.device_id)
            .field("characteristic", &self.characteristic.uuid)
            .field("active", &self.is_active())
            .finish()
    }
}

type AttemptFuture = Shared<BoxFuture<'static, Result<ConnectionHandle>>>;

/// A connect attempt in flight.
struct Attempt {
    /// Taken by whoever cancels first.
    cancel_tx: Option<oneshot::Sender<Error>>,
    /// Outcome shared by every caller.
    result: AttemptFuture,
}

struct ActiveConnection {
    handle: ConnectionHandle,
    services: Vec<GattService>,
}

struct DeviceSlot {
    state: ConnectionState,
    state_tx: broadcast::Sender<ConnectionState>,
    attempt: Option<Attempt>,
    active: Option<ActiveConnection>,
}

impl DeviceSlot {
    fn new(capacity: usize) -> Self {
        let (state_tx, _) = broadcast::channel(capacity.max(1));
        Self {
            state: ConnectionState::Disconnected,
            state_tx,
            attempt: None,
            active: None,
        }
    }
}

/// What `disconnect` has to do once the slot lock is released.
enum Teardown {
    Done,
    AwaitAttempt(AttemptFuture),
    Close(Option<ActiveConnection>),
}

struct ConnectionInner {
    platform: Arc<dyn BlePlatform>,
    /// Checked under the slot lock before an attempt starts.
    adapter: Arc<AdapterMonitor>,
    decoder: Arc<dyn Decoder>,
    connect_timeout: Duration,
    target: TargetCharacteristic,
    reading_capacity: usize,
    event_capacity: usize,
    slots: Mutex<HashMap<DeviceId, DeviceSlot>>,
    event_tx: broadcast::Sender<ConnectionEvent>,
}

/// Manages connections to any number of devices.
///
/// Cloning is cheap and every clone drives the same devices.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ConnectionInner>,
}

impl ConnectionManager {
    /// Create a connection manager.
    pub fn new(
        platform: Arc<dyn BlePlatform>,
        adapter: Arc<AdapterMonitor>,
        decoder: Arc<dyn Decoder>,
        config: &ManagerConfig,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(config.event_capacity.max(1));

        Self {
            inner: Arc::new(ConnectionInner {
                platform,
                adapter,
                decoder,
                connect_timeout: config.connect_timeout,
                target: config.target.clone(),
                reading_capacity: config.reading_capacity,
                event_capacity: config.event_capacity,
                slots: Mutex::new(HashMap::new()),
                event_tx,
            }),
        }
    }

    /// Current state of a device. Unknown devices are `Disconnected`.
    pub fn state(&self, id: &DeviceId) -> ConnectionState {
        self.inner
            .slots
            .lock()
            .get(id)
            .map(|slot| slot.state)
            .unwrap_or_default()
    }

    /// The live connection to a device, if any.
    pub fn handle(&self, id: &DeviceId) -> Option<ConnectionHandle> {
        self.inner
            .slots
            .lock()
            .get(id)
            .and_then(|slot| slot.active.as_ref())
            .map(|active| active.handle.clone())
    }

    /// A device with a connect attempt in flight, if any.
    pub fn in_flight(&self) -> Option<(DeviceId, ConnectionState)> {
        self.inner
            .slots
            .lock()
            .iter()
            .find(|(_, slot)| slot.state.is_in_flight())
            .map(|(id, slot)| (id.clone(), slot.state))
    }

    /// Devices that are not `Disconnected`.
    pub fn active_devices(&self) -> Vec<DeviceId> {
        let mut ids: Vec<_> = self
            .inner
            .slots
            .lock()
            .iter()
            .filter(|(_, slot)| slot.state != ConnectionState::Disconnected)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Subscribe to state changes of every device.
    pub fn subscribe_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Stream of a device's state: the current value, then every change.
    pub fn observe(&self, id: &DeviceId) -> BoxStream<'static, ConnectionState> {
        let mut slots = self.inner.slots.lock();
        let slot = slots
            .entry(id.clone())
            .or_insert_with(|| DeviceSlot::new(self.inner.event_capacity));
        let rx = slot.state_tx.subscribe();

        stream::once(futures::future::ready(slot.state))
            .chain(broadcast_stream(rx))
            .boxed()
    }

    /// Connect to a device and subscribe to the configured characteristic.
    ///
    /// Returns the existing connection if the device is already connected,
    /// and joins the pending attempt if one is in flight.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AdapterUnavailable`] unless the adapter is powered
    /// on, or the error that failed the attempt. The device is back in
    /// `Disconnected` by the time this returns.
    pub async fn connect(&self, id: &DeviceId) -> Result<ConnectionHandle> {
        let target = self.inner.target.clone();
        self.connect_with(id, target).await
    }

    /// Connect to a device and subscribe to `target`.
    pub async fn connect_with(
        &self,
        id: &DeviceId,
        target: TargetCharacteristic,
    ) -> Result<ConnectionHandle> {
        let attempt = {
            let mut slots = self.inner.slots.lock();
            let slot = slots
                .entry(id.clone())
                .or_insert_with(|| DeviceSlot::new(self.inner.event_capacity));

            match slot.state {
                ConnectionState::Connected => {
                    if let Some(active) = &slot.active {
                        debug!("Already connected to {}", id);
                        return Ok(active.handle.clone());
                    }
                    return Err(Error::Internal(format!(
                        "{} is connected without a subscription",
                        id
                    )));
                }
                ConnectionState::Disconnected => {
                    // Checked under the lock: an adapter loss either sees this
                    // slot or is seen here.
                    self.inner.adapter.ensure_powered_on()?;
                    self.inner.begin_attempt(slot, id, target)
                }
                state => match &slot.attempt {
                    Some(attempt) => {
                        debug!("Joining connect attempt already in flight for {}", id);
                        attempt.result.clone()
                    }
                    None => return Err(Error::ConnectionBusy { state }),
                },
            }
        };

        attempt.await
    }

    /// Disconnect a device.
    ///
    /// Idempotent: disconnecting an unknown or disconnected device is a no-op.
    /// An attempt still in flight is cancelled and fails with
    /// [`Error::Cancelled`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Disconnect`] if the platform refused to drop the
    /// link. The device is `Disconnected` regardless.
    pub async fn disconnect(&self, id: &DeviceId) -> Result<()> {
        loop {
            let step = {
                let mut slots = self.inner.slots.lock();
                match slots.get_mut(id) {
                    None => Teardown::Done,
                    Some(slot) => match slot.state {
                        ConnectionState::Connected => {
                            let active = slot.active.take();
                            self.inner
                                .apply(slot, id, ConnectionState::Disconnecting);
                            Teardown::Close(active)
                        }
                        state if state.is_in_flight() => match slot.attempt.as_mut() {
                            Some(attempt) => {
                                if let Some(cancel_tx) = attempt.cancel_tx.take() {
                                    info!("Cancelling connect attempt for {}", id);
                                    let _ = cancel_tx.send(Error::Cancelled);
                                }
                                Teardown::AwaitAttempt(attempt.result.clone())
                            }
                            None => Teardown::Done,
                        },
                        _ => Teardown::Done,
                    },
                }
            };

            match step {
                Teardown::Done => {
                    debug!("{} already disconnected", id);
                    return Ok(());
                }
                // The attempt may still have won the race; look again.
                Teardown::AwaitAttempt(result) => {
                    let _ = result.await;
                }
                Teardown::Close(active) => return self.inner.close(id, active, true).await,
            }
        }
    }

    /// Disconnect every device that is not already disconnected.
    pub async fn disconnect_all(&self) {
        for id in self.active_devices() {
            if let Err(e) = self.disconnect(&id).await {
                warn!("Failed to disconnect {}: {}", id, e);
            }
        }
    }

    /// Drop every connection after the adapter became unusable.
    ///
    /// Attempts in flight fail with [`Error::AdapterUnavailable`]; connected
    /// devices go through `Disconnecting` without talking to the radio.
    pub async fn force_disconnect_all(&self, state: AdapterState) {
        let (pending, connected) = {
            let mut slots = self.inner.slots.lock();
            let mut pending = Vec::new();
            let mut connected = Vec::new();

            for (id, slot) in slots.iter_mut() {
                if slot.state.is_in_flight() {
                    if let Some(attempt) = slot.attempt.as_mut() {
                        if let Some(cancel_tx) = attempt.cancel_tx.take() {
                            let _ = cancel_tx.send(Error::AdapterUnavailable { state });
                        }
                        pending.push(attempt.result.clone());
                    }
                } else if slot.state.is_connected() {
                    let active = slot.active.take();
                    self.inner
                        .apply(slot, id, ConnectionState::Disconnecting);
                    connected.push((id.clone(), active));
                }
            }

            (pending, connected)
        };

        if !pending.is_empty() || !connected.is_empty() {
            warn!(
                "Adapter is {}: dropping {} connections and {} attempts",
                state,
                connected.len(),
                pending.len()
            );
        }

        for (id, active) in connected {
            let _ = self.inner.close(&id, active, false).await;
        }
        futures::future::join_all(pending).await;
    }

    /// Handle a link dropped by the peer or the radio.
    ///
    /// Returns true if the device was connected, i.e. the loss should be
    /// reported to the application.
    pub async fn handle_link_lost(&self, id: &DeviceId) -> bool {
        let step = {
            let mut slots = self.inner.slots.lock();
            match slots.get_mut(id) {
                Some(slot) if slot.state.is_connected() => {
                    let active = slot.active.take();
                    self.inner
                        .apply(slot, id, ConnectionState::Disconnecting);
                    Teardown::Close(active)
                }
                Some(slot) if slot.state.is_in_flight() => {
                    if let Some(cancel_tx) = slot.attempt.as_mut().and_then(|a| a.cancel_tx.take()) {
                        let _ = cancel_tx.send(Error::Connect(ConnectError::Unreachable {
                            reason: "link dropped during setup".to_string(),
                        }));
                    }
                    Teardown::Done
                }
                _ => Teardown::Done,
            }
        };

        match step {
            Teardown::Close(active) => {
                warn!("Lost connection to {}", id);
                let _ = self.inner.close(id, active, false).await;
                true
            }
            _ => false,
        }
    }

    /// Stream readings from `target` on a device, connecting first if needed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TargetMismatch`] if the device is already subscribed
    /// to a characteristic `target` does not accept.
    pub async fn subscribe_readings(
        &self,
        id: &DeviceId,
        target: TargetCharacteristic,
    ) -> Result<BoxStream<'static, Reading>> {
        let handle = match self.handle(id) {
            Some(handle) => handle,
            None => self.connect_with(id, target.clone()).await?,
        };

        if !target.accepts(handle.characteristic()) {
            return Err(Error::TargetMismatch {
                requested: target.to_string(),
                active: handle.characteristic().uuid.to_string(),
            });
        }

        Ok(handle.readings())
    }

    /// Read a characteristic of a connected device once.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotConnected`] if the device is not connected and
    /// [`Error::CharacteristicNotFound`] if it has no readable
    /// characteristic `uuid`.
    pub async fn read(&self, id: &DeviceId, uuid: &Uuid) -> Result<Reading> {
        let services = self
            .inner
            .slots
            .lock()
            .get(id)
            .and_then(|slot| slot.active.as_ref())
            .map(|active| active.services.clone())
            .ok_or_else(|| Error::NotConnected {
                identifier: id.to_string(),
            })?;

        let characteristic = resolver::find_characteristic(&services, uuid)
            .filter(|c| c.properties.read)
            .ok_or_else(|| Error::CharacteristicNotFound {
                target: format!("readable characteristic {}", uuid),
            })?;

        let raw = self.inner.platform.read(id, &characteristic).await?;
        debug!("Read {} bytes from {} on {}", raw.len(), uuid, id);

        Ok(Subscription::decode(self.inner.decoder.as_ref(), raw))
    }
}

impl ConnectionInner {
    /// Apply a transition if it is legal, publishing it.
    fn apply(&self, slot: &mut DeviceSlot, id: &DeviceId, next: ConnectionState) -> bool {
        if !slot.state.can_transition_to(&next) {
            warn!(
                "Ignoring invalid transition for {}: {} -> {}",
                id, slot.state, next
            );
            return false;
        }

        debug!("Connection state for {}: {} -> {}", id, slot.state, next);
        slot.state = next;

        let _ = slot.state_tx.send(next);
        let _ = self.event_tx.send(ConnectionEvent {
            identifier: id.clone(),
            state: next,
        });

        true
    }

    fn transition(&self, id: &DeviceId, next: ConnectionState) -> bool {
        let mut slots = self.slots.lock();
        match slots.get_mut(id) {
            Some(slot) => self.apply(slot, id, next),
            None => false,
        }
    }

    /// Move a disconnected slot to `Connecting` and spawn the attempt.
    fn begin_attempt(
        self: &Arc<Self>,
        slot: &mut DeviceSlot,
        id: &DeviceId,
        target: TargetCharacteristic,
    ) -> AttemptFuture {
        info!("Connecting to {}", id);
        self.apply(slot, id, ConnectionState::Connecting);

        let (cancel_tx, cancel_rx) = oneshot::channel();
        let task = tokio::spawn(self.clone().run_attempt(id.clone(), target, cancel_rx));

        let result = async move {
            task.await
                .unwrap_or_else(|e| Err(Error::Internal(format!("connect task failed: {}", e))))
        }
        .boxed()
        .shared();

        slot.attempt = Some(Attempt {
            cancel_tx: Some(cancel_tx),
            result: result.clone(),
        });

        result
    }

    async fn run_attempt(
        self: Arc<Self>,
        id: DeviceId,
        target: TargetCharacteristic,
        mut cancel_rx: oneshot::Receiver<Error>,
    ) -> Result<ConnectionHandle> {
        let outcome = tokio::select! {
            biased;
            reason = &mut cancel_rx => Err(reason.unwrap_or(Error::Cancelled)),
            result = tokio::time::timeout(self.connect_timeout, self.establish(&id, &target)) => {
                match result {
                    Ok(result) => result,
                    Err(_) => Err(ConnectError::Timeout.into()),
                }
            }
        };

        match outcome {
            Ok((handle, services)) => {
                let mut slots = self.slots.lock();
                if let Some(slot) = slots.get_mut(&id) {
                    self.apply(slot, &id, ConnectionState::Connected);
                    slot.attempt = None;
                    slot.active = Some(ActiveConnection {
                        handle: handle.clone(),
                        services,
                    });
                }
                info!("Connected to {} via {}", id, handle.characteristic.uuid);
                Ok(handle)
            }
            Err(e) => {
                error!("Connection to {} failed: {}", id, e);

                // The radio is gone; there is nothing to tell it.
                if e.kind() != ErrorKind::AdapterUnavailable {
                    match tokio::time::timeout(self.connect_timeout, self.platform.disconnect(&id))
                        .await
                    {
                        Ok(Err(cleanup)) => debug!("Cleanup disconnect of {} failed: {}", id, cleanup),
                        Err(_) => debug!("Cleanup disconnect of {} timed out", id),
                        Ok(Ok(())) => {}
                    }
                }

                let mut slots = self.slots.lock();
                if let Some(slot) = slots.get_mut(&id) {
                    self.apply(slot, &id, ConnectionState::Failed(e.kind()));
                    self.apply(slot, &id, ConnectionState::Disconnected);
                    slot.attempt = None;
                }
                Err(e)
            }
        }
    }

    /// Link, discover, resolve, subscribe.
    async fn establish(
        &self,
        id: &DeviceId,
        target: &TargetCharacteristic,
    ) -> Result<(ConnectionHandle, Vec<GattService>)> {
        self.platform.connect(id).await.map_err(|e| match e {
            Error::Bluetooth(reason) => ConnectError::Unreachable { reason }.into(),
            other => other,
        })?;

        self.transition(id, ConnectionState::DiscoveringServices);
        let services = self.platform.discover_services(id).await.map_err(|e| match e {
            Error::Bluetooth(reason) => Error::gatt(reason),
            other => other,
        })?;
        debug!("Discovered {} services on {}", services.len(), id);

        let characteristic = resolver::resolve(&services, target)?;

        self.transition(id, ConnectionState::Subscribing);
        let subscription = Subscription::start(
            self.platform.clone(),
            id.clone(),
            characteristic.clone(),
            self.decoder.clone(),
            self.reading_capacity,
        )
        .await?;

        let handle = ConnectionHandle {
            device_id: id.clone(),
            characteristic,
            subscription,
        };
        Ok((handle, services))
    }

    /// Finish a teardown that already moved the slot to `Disconnecting`.
    async fn close(
        &self,
        id: &DeviceId,
        active: Option<ActiveConnection>,
        notify_platform: bool,
    ) -> Result<()> {
        if let Some(active) = active {
            if let Err(e) = active.handle.subscription.unsubscribe(notify_platform).await {
                warn!("Failed to unsubscribe from {}: {}", id, e);
            }
        }

        let result = if notify_platform {
            match self.platform.disconnect(id).await {
                Ok(()) => {
                    info!("Disconnected from {}", id);
                    Ok(())
                }
                Err(e) => {
                    error!("Failed to disconnect from {}: {}", id, e);
                    Err(Error::Disconnect {
                        reason: e.to_string(),
                    })
                }
            }
        } else {
            Ok(())
        };

        self.transition(id, ConnectionState::Disconnected);
        result
    }
}
