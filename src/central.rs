//! Central manager tying the adapter monitor, scanner and connection
//! manager to one radio.
//!
//! A single routing task consumes the platform's event stream: adapter
//! state reports go to the [`AdapterMonitor`], advertisements to the
//! [`DeviceScanner`], and peer-initiated disconnects to the
//! [`ConnectionManager`].

use futures::stream::{BoxStream, StreamExt};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::ble::adapter::{AdapterMonitor, AdapterState, AdapterTransition};
use crate::ble::btleplug_platform::BtleplugPlatform;
use crate::ble::connection::{ConnectionEvent, ConnectionHandle, ConnectionManager, ConnectionState};
use crate::ble::platform::{BlePlatform, PlatformEvent, ScanFilter};
use crate::ble::resolver::TargetCharacteristic;
use crate::ble::scanner::DeviceScanner;
use crate::callback::CallbackHandle;
use crate::config::ManagerConfig;
use crate::data::{DeviceId, DiscoveredDevice, Reading};
use crate::error::{Error, Result};
use crate::events::{CentralEvent, ScanStopReason};
use crate::protocol::{Decoder, Utf8TextDecoder};

/// Entry point for scanning, connecting and streaming readings.
pub struct CentralManager {
    config: ManagerConfig,
    adapter: Arc<AdapterMonitor>,
    scanner: Arc<DeviceScanner>,
    connections: ConnectionManager,
    /// Manager-level events.
    event_tx: broadcast::Sender<CentralEvent>,
    /// Callback ID counter.
    callback_counter: AtomicU64,
    /// Platform event routing task.
    router_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl CentralManager {
    /// Create a manager on the first Bluetooth adapter, decoding
    /// notifications as UTF-8 text.
    ///
    /// # Errors
    ///
    /// Returns an error if no adapter is available.
    pub async fn new(config: ManagerConfig) -> Result<Self> {
        let platform = BtleplugPlatform::new().await?;
        Self::with_platform(Arc::new(platform), config, Arc::new(Utf8TextDecoder)).await
    }

    /// Create a manager on any radio with any payload decoder.
    pub async fn with_platform(
        platform: Arc<dyn BlePlatform>,
        config: ManagerConfig,
        decoder: Arc<dyn Decoder>,
    ) -> Result<Self> {
        // Subscribe before reading the state so no change falls in between.
        let events = platform.events().await?;
        let initial = platform.adapter_state().await?;
        info!("Bluetooth adapter is {}", initial);

        let (event_tx, _) = broadcast::channel(config.event_capacity.max(1));
        let adapter = Arc::new(AdapterMonitor::new(initial, config.event_capacity));
        let scanner = Arc::new(DeviceScanner::new(
            platform.clone(),
            adapter.clone(),
            event_tx.clone(),
            config.clear_on_rescan,
            config.event_capacity,
        ));
        let connections = ConnectionManager::new(platform, adapter.clone(), decoder, &config);

        let router = EventRouter {
            adapter: adapter.clone(),
            scanner: scanner.clone(),
            connections: connections.clone(),
            event_tx: event_tx.clone(),
            auto_scan: config.auto_scan_on_powered_on,
            scan_timeout: config.scan_timeout,
        };
        let handle = tokio::spawn(router.run(events));

        Ok(Self {
            config,
            adapter,
            scanner,
            connections,
            event_tx,
            callback_counter: AtomicU64::new(0),
            router_handle: Mutex::new(Some(handle)),
        })
    }

    /// The configuration this manager was built with.
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    // Adapter

    /// Get the current adapter state.
    pub fn adapter_state(&self) -> AdapterState {
        self.adapter.state()
    }

    /// Stream the adapter state: the current value, then every change.
    pub fn observe_adapter_state(&self) -> BoxStream<'static, AdapterState> {
        self.adapter.observe()
    }

    // Scanning

    /// Start a scan session that ends after `timeout`.
    ///
    /// Any running session is stopped first. The stream yields each new or
    /// refreshed device and ends with the session.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AdapterUnavailable`] unless the adapter is powered
    /// on, and [`Error::ConnectionBusy`] while a connect attempt is in flight.
    pub async fn start_scan(
        &self,
        filter: ScanFilter,
        timeout: Duration,
    ) -> Result<BoxStream<'static, DiscoveredDevice>> {
        // Scanning and connecting share the radio.
        if let Some((id, state)) = self.connections.in_flight() {
            debug!("Refusing to scan while {} is {}", id, state);
            return Err(Error::ConnectionBusy { state });
        }

        self.scanner.start_scan(filter, timeout).await
    }

    /// Stop scanning. Safe to call when not scanning.
    pub async fn stop_scan(&self) -> Result<()> {
        self.scanner.stop_scan().await
    }

    /// Check if scanning is active.
    pub fn is_scanning(&self) -> bool {
        self.scanner.is_scanning()
    }

    /// Get discovered devices sorted by signal strength (strongest first).
    pub fn discovered_devices(&self) -> Vec<DiscoveredDevice> {
        self.scanner.devices()
    }

    /// Get a discovered device by identifier.
    pub fn device(&self, id: &DeviceId) -> Option<DiscoveredDevice> {
        self.scanner.device(id)
    }

    // Connections

    /// Connect to a device and subscribe to the configured characteristic.
    ///
    /// A running scan is stopped first. Concurrent calls for the same
    /// device share a single attempt.
    ///
    /// # Errors
    ///
    /// Returns the error that failed the attempt; the device is left
    /// `Disconnected`.
    pub async fn connect(&self, id: &DeviceId) -> Result<ConnectionHandle> {
        self.connect_with(id, self.config.target.clone()).await
    }

    /// Connect to a device and subscribe to `target`.
    pub async fn connect_with(
        &self,
        id: &DeviceId,
        target: TargetCharacteristic,
    ) -> Result<ConnectionHandle> {
        if let Some(handle) = self.connections.handle(id) {
            return Ok(handle);
        }

        self.adapter.ensure_powered_on()?;
        self.scanner.stop_with(ScanStopReason::Connecting).await;
        self.connections.connect_with(id, target).await
    }

    /// Disconnect a device. Idempotent; cancels a pending connect.
    pub async fn disconnect(&self, id: &DeviceId) -> Result<()> {
        self.connections.disconnect(id).await
    }

    /// Get the connection state of a device.
    pub fn connection_state(&self, id: &DeviceId) -> ConnectionState {
        self.connections.state(id)
    }

    /// Stream a device's connection state: the current value, then every change.
    pub fn observe_connection_state(&self, id: &DeviceId) -> BoxStream<'static, ConnectionState> {
        self.connections.observe(id)
    }

    /// Subscribe to connection state changes of every device.
    pub fn subscribe_connection_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.connections.subscribe_events()
    }

    /// Stream decoded readings from a device, connecting first if needed.
    ///
    /// `service` and `characteristic` narrow the target; with neither, the
    /// first notifiable characteristic is used.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TargetMismatch`] if
    /// the device is already subscribed elsewhere, or the connect error.
    pub async fn subscribe_readings(
        &self,
        id: &DeviceId,
        service: Option<Uuid>,
        characteristic: Option<Uuid>,
    ) -> Result<BoxStream<'static, Reading>> {
        let target = TargetCharacteristic {
            service,
            characteristic,
        };

        if self.connections.handle(id).is_none() {
            self.adapter.ensure_powered_on()?;
            self.scanner.stop_with(ScanStopReason::Connecting).await;
        }

        self.connections.subscribe_readings(id, target).await
    }

    /// Read a characteristic of a connected device once.
    pub async fn read_characteristic(&self, id: &DeviceId, characteristic: &Uuid) -> Result<Reading> {
        self.connections.read(id, characteristic).await
    }

    // Events

    /// Subscribe to manager-level events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<CentralEvent> {
        self.event_tx.subscribe()
    }

    /// Register a callback for manager-level events.
    ///
    /// The callback runs until the returned handle is dropped.
    pub fn on_event<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(CentralEvent) + Send + Sync + 'static,
    {
        let callback_id = self.callback_counter.fetch_add(1, Ordering::SeqCst);
        let mut rx = self.event_tx.subscribe();

        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => callback(event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Event callback lagged, skipped {} events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        CallbackHandle::new(callback_id, move || {
            handle.abort();
        })
    }

    /// Stop scanning and disconnect every device.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down central manager");

        self.scanner.stop_with(ScanStopReason::Stopped).await;
        self.connections.disconnect_all().await;

        Ok(())
    }
}

impl Drop for CentralManager {
    fn drop(&mut self) {
        if let Some(handle) = self.router_handle.lock().take() {
            handle.abort();
        }
    }
}

/// Feeds platform events to the component that owns them.
struct EventRouter {
    adapter: Arc<AdapterMonitor>,
    scanner: Arc<DeviceScanner>,
    connections: ConnectionManager,
    event_tx: broadcast::Sender<CentralEvent>,
    auto_scan: bool,
    scan_timeout: Duration,
}

impl EventRouter {
    async fn run(self, mut events: BoxStream<'static, PlatformEvent>) {
        if self.auto_scan && self.adapter.state().is_powered_on() {
            self.start_auto_scan().await;
        }

        while let Some(event) = events.next().await {
            self.handle(event).await;
        }

        debug!("Platform event stream ended");
    }

    async fn handle(&self, event: PlatformEvent) {
        match event {
            PlatformEvent::StateChanged(state) => match self.adapter.update(state) {
                AdapterTransition::Lost(state) => {
                    self.scanner
                        .stop_with(ScanStopReason::AdapterUnavailable)
                        .await;
                    self.connections.force_disconnect_all(state).await;
                    let _ = self.event_tx.send(CentralEvent::AdapterUnavailable(state));
                }
                AdapterTransition::PoweredOn if self.auto_scan => self.start_auto_scan().await,
                _ => {}
            },
            PlatformEvent::Advertisement(advertisement) => self.scanner.ingest(advertisement),
            PlatformEvent::Disconnected(id) => {
                if self.connections.handle_link_lost(&id).await {
                    let _ = self.event_tx.send(CentralEvent::LinkLost(id));
                }
            }
        }
    }

    async fn start_auto_scan(&self) {
        info!("Adapter powered on, starting scan");

        // Devices land in the table; nobody needs the session stream.
        if let Err(e) = self
            .scanner
            .start_scan(ScanFilter::default(), self.scan_timeout)
            .await
        {
            warn!("Automatic scan failed to start: {}", e);
        }
    }
}
