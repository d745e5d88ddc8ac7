//! BLE scanning functionality.
//!
//! Runs time-bounded discovery sessions and keeps the de-duplicated table
//! of devices seen.

use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, Mutex};
use tracing::{debug, info, trace, warn};

use crate::ble::adapter::AdapterMonitor;
use crate::ble::platform::{Advertisement, BlePlatform, ScanFilter};
use crate::data::{DeviceId, DiscoveredDevice};
use crate::error::Result;
use crate::events::{CentralEvent, ScanStopReason};
use crate::utils::broadcast_stream;

/// Devices discovered during scanning, keyed by identifier.
#[derive(Debug, Clone, Default)]
pub struct DeviceTable {
    devices: HashMap<DeviceId, DiscoveredDevice>,
}

impl DeviceTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new device or refresh an existing one from an advertisement.
    ///
    /// Returns the stored entry and whether it was newly created.
    pub fn upsert(
        &mut self,
        advertisement: &Advertisement,
        seen_at: DateTime<Utc>,
    ) -> (DiscoveredDevice, bool) {
        match self.devices.get_mut(&advertisement.id) {
            Some(device) => {
                if advertisement.rssi.is_some() {
                    device.signal_strength = advertisement.rssi;
                }
                if advertisement.local_name.is_some() {
                    device.display_name = advertisement.local_name.clone();
                }
                device.last_seen_at = seen_at;
                (device.clone(), false)
            }
            None => {
                let device = DiscoveredDevice {
                    id: advertisement.id.clone(),
                    display_name: advertisement.local_name.clone(),
                    signal_strength: advertisement.rssi,
                    last_seen_at: seen_at,
                };
                self.devices.insert(device.id.clone(), device.clone());
                (device, true)
            }
        }
    }

    /// Get a device by identifier.
    pub fn get(&self, id: &DeviceId) -> Option<&DiscoveredDevice> {
        self.devices.get(id)
    }

    /// Number of devices.
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Check if the table is empty.
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Remove every device.
    pub fn clear(&mut self) {
        self.devices.clear();
    }

    /// Devices sorted by signal strength, strongest first.
    pub fn by_signal(&self) -> Vec<DiscoveredDevice> {
        let mut devices: Vec<_> = self.devices.values().cloned().collect();
        devices.sort_by(|a, b| {
            b.signal_strength
                .unwrap_or(i16::MIN)
                .cmp(&a.signal_strength.unwrap_or(i16::MIN))
                .then_with(|| a.id.cmp(&b.id))
        });
        devices
    }
}

/// A running scan session.
struct ScanSession {
    id: u64,
    stop_tx: Option<oneshot::Sender<ScanStopReason>>,
    handle: tokio::task::JoinHandle<()>,
}

/// State shared with session tasks.
#[derive(Clone)]
struct SessionContext {
    platform: Arc<dyn BlePlatform>,
    devices: Arc<RwLock<DeviceTable>>,
    active_session: Arc<AtomicU64>,
    event_tx: broadcast::Sender<CentralEvent>,
}

/// BLE scanner for discovering peripherals.
pub struct DeviceScanner {
    /// Shared with session tasks.
    context: SessionContext,
    /// Adapter gate.
    adapter: Arc<AdapterMonitor>,
    /// Whether each new session starts with an empty table.
    clear_on_rescan: bool,
    /// Raw advertisements from the platform, fanned out to the session task.
    advertisement_tx: broadcast::Sender<Advertisement>,
    /// The current session. Locked across start/stop so they never interleave.
    session: Mutex<Option<ScanSession>>,
    /// Session number counter.
    session_counter: AtomicU64,
    /// Per-session output channel capacity.
    capacity: usize,
}

impl DeviceScanner {
    /// Create a scanner.
    pub fn new(
        platform: Arc<dyn BlePlatform>,
        adapter: Arc<AdapterMonitor>,
        event_tx: broadcast::Sender<CentralEvent>,
        clear_on_rescan: bool,
        capacity: usize,
    ) -> Self {
        let capacity = capacity.max(1);
        let (advertisement_tx, _) = broadcast::channel(capacity);

        Self {
            context: SessionContext {
                platform,
                devices: Arc::new(RwLock::new(DeviceTable::new())),
                active_session: Arc::new(AtomicU64::new(0)),
                event_tx,
            },
            adapter,
            clear_on_rescan,
            advertisement_tx,
            session: Mutex::new(None),
            session_counter: AtomicU64::new(0),
            capacity,
        }
    }

    /// Start a scan session that ends after `timeout`.
    ///
    /// A session already running is stopped first. The returned stream
    /// yields every new or refreshed device of this session and ends with
    /// the session.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AdapterUnavailable`](crate::Error::AdapterUnavailable)
    /// unless the adapter is powered on, or the platform's scan error.
    pub async fn start_scan(
        &self,
        filter: ScanFilter,
        timeout: Duration,
    ) -> Result<BoxStream<'static, DiscoveredDevice>> {
        self.adapter.ensure_powered_on()?;

        let mut session = self.session.lock().await;

        if let Some(previous) = session.take() {
            Self::end_session(previous, ScanStopReason::Superseded).await;
        }

        if self.clear_on_rescan {
            self.context.devices.write().clear();
        }

        // Subscribe before the radio starts so no callback is missed.
        let advertisements = self.advertisement_tx.subscribe();

        self.context.platform.start_scan(&filter).await?;

        let id = self.session_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let (stop_tx, stop_rx) = oneshot::channel();
        let (device_tx, device_rx) = broadcast::channel(self.capacity);

        info!(
            "Starting BLE scan session {} (timeout {:?}, filter {:?})",
            id, timeout, filter
        );

        self.context.active_session.store(id, Ordering::SeqCst);

        let handle = tokio::spawn(Self::run_session(
            self.context.clone(),
            id,
            filter,
            timeout,
            stop_rx,
            advertisements,
            device_tx,
        ));

        *session = Some(ScanSession {
            id,
            stop_tx: Some(stop_tx),
            handle,
        });

        Ok(broadcast_stream(device_rx))
    }

    /// Stop the current scan session. Safe to call when not scanning.
    pub async fn stop_scan(&self) -> Result<()> {
        self.stop_with(ScanStopReason::Stopped).await;
        Ok(())
    }

    /// Stop the current scan session, if any, recording `reason`.
    pub(crate) async fn stop_with(&self, reason: ScanStopReason) {
        let previous = self.session.lock().await.take();

        match previous {
            Some(session) => Self::end_session(session, reason).await,
            None => debug!("Not scanning, ignoring stop request"),
        }
    }

    /// Feed a platform advertisement to the running session.
    pub(crate) fn ingest(&self, advertisement: Advertisement) {
        // No receiver means no session; the advertisement is discarded.
        let _ = self.advertisement_tx.send(advertisement);
    }

    /// Check if a session is running.
    pub fn is_scanning(&self) -> bool {
        self.context.active_session.load(Ordering::SeqCst) != 0
    }

    /// Get all discovered devices, strongest signal first.
    pub fn devices(&self) -> Vec<DiscoveredDevice> {
        self.context.devices.read().by_signal()
    }

    /// Get a discovered device by identifier.
    pub fn device(&self, id: &DeviceId) -> Option<DiscoveredDevice> {
        self.context.devices.read().get(id).cloned()
    }

    /// Number of discovered devices.
    pub fn device_count(&self) -> usize {
        self.context.devices.read().len()
    }

    async fn end_session(mut session: ScanSession, reason: ScanStopReason) {
        debug!("Ending scan session {} ({:?})", session.id, reason);

        if let Some(stop_tx) = session.stop_tx.take() {
            // Fails only when the session already ended on its own.
            let _ = stop_tx.send(reason);
        }

        if let Err(e) = session.handle.await {
            warn!("Scan session {} task failed: {}", session.id, e);
        }
    }

    async fn run_session(
        context: SessionContext,
        id: u64,
        filter: ScanFilter,
        timeout: Duration,
        mut stop_rx: oneshot::Receiver<ScanStopReason>,
        mut advertisements: broadcast::Receiver<Advertisement>,
        device_tx: broadcast::Sender<DiscoveredDevice>,
    ) {
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        let reason = loop {
            tokio::select! {
                biased;
                reason = &mut stop_rx => {
                    break reason.unwrap_or(ScanStopReason::Stopped);
                }
                _ = &mut deadline => {
                    break ScanStopReason::Timeout;
                }
                advertisement = advertisements.recv() => match advertisement {
                    Ok(advertisement) => {
                        if !filter.matches(&advertisement) {
                            continue;
                        }

                        let (device, is_new) = context
                            .devices
                            .write()
                            .upsert(&advertisement, Utc::now());

                        if is_new {
                            debug!(
                                "Discovered device {} ({}, rssi {:?})",
                                device.id,
                                device.name_or_default(),
                                device.signal_strength
                            );
                        } else {
                            trace!("Refreshed device {}", device.id);
                        }

                        let _ = device_tx.send(device);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Scan session {} skipped {} advertisements", id, skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        break ScanStopReason::Stopped;
                    }
                },
            }
        };

        if let Err(e) = context.platform.stop_scan().await {
            debug!("Platform stop_scan failed: {}", e);
        }

        let _ = context
            .active_session
            .compare_exchange(id, 0, Ordering::SeqCst, Ordering::SeqCst);

        info!("Scan session {} ended ({:?})", id, reason);

        let _ = context
            .event_tx
            .send(CentralEvent::ScanStopped { session: id, reason });
    }
}

impl Drop for DeviceScanner {
    fn drop(&mut self) {
        if let Ok(mut session) = self.session.try_lock() {
            if let Some(stop_tx) = session.as_mut().and_then(|s| s.stop_tx.take()) {
                let _ = stop_tx.send(ScanStopReason::Stopped);
            }
        }
    }
}
