//! Notification pipeline.
//!
//! Subscribes once to a resolved characteristic, decodes every pushed
//! payload and broadcasts the resulting [`Reading`]s. A payload that fails
//! to decode becomes a reading carrying the error; the stream carries on.

use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

use crate::ble::platform::{BlePlatform, GattCharacteristic, Notification};
use crate::data::{DeviceId, Reading};
use crate::error::{Error, Result};
use crate::protocol::Decoder;
use crate::utils::broadcast_stream;

/// An active notification subscription on one characteristic.
pub struct Subscription {
    /// The subscribed device.
    device_id: DeviceId,
    /// The subscribed characteristic.
    characteristic: GattCharacteristic,
    /// Radio access for unsubscribe.
    platform: Arc<dyn BlePlatform>,
    /// Cleared by the first teardown.
    active: AtomicBool,
    /// Decoded readings. Taken on teardown so every reading stream ends.
    reading_tx: Mutex<Option<broadcast::Sender<Reading>>>,
    /// The decode task.
    pump_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Subscription {
    /// Subscribe to `characteristic` and start decoding its notifications.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Subscription`] if the characteristic cannot notify or
    /// the platform refuses the subscription.
    pub(crate) async fn start(
        platform: Arc<dyn BlePlatform>,
        device_id: DeviceId,
        characteristic: GattCharacteristic,
        decoder: Arc<dyn Decoder>,
        capacity: usize,
    ) -> Result<Arc<Self>> {
        if !characteristic.properties.can_notify() {
            return Err(Error::Subscription {
                reason: format!("characteristic {} does not notify", characteristic.uuid),
            });
        }

        // Take the stream before enabling notifications so the first push is not lost.
        let notifications = platform
            .notifications(&device_id)
            .await
            .map_err(Self::classify)?;

        platform
            .subscribe(&device_id, &characteristic)
            .await
            .map_err(Self::classify)?;

        debug!(
            "Subscribed to notifications from {} on {}",
            characteristic.uuid, device_id
        );

        let (reading_tx, _) = broadcast::channel(capacity.max(1));

        let subscription = Arc::new(Self {
            device_id,
            characteristic,
            platform,
            active: AtomicBool::new(true),
            reading_tx: Mutex::new(Some(reading_tx.clone())),
            pump_handle: Mutex::new(None),
        });

        let handle = tokio::spawn(Self::pump(
            notifications,
            subscription.characteristic.uuid,
            decoder,
            reading_tx,
        ));
        *subscription.pump_handle.lock() = Some(handle);

        Ok(subscription)
    }

    fn classify(error: Error) -> Error {
        match error {
            Error::PermissionDenied | Error::AdapterUnavailable { .. } => error,
            other => Error::Subscription {
                reason: other.to_string(),
            },
        }
    }

    /// Decode one payload into a reading.
    pub(crate) fn decode(decoder: &dyn Decoder, payload: Vec<u8>) -> Reading {
        let value = decoder.decode(&payload);
        Reading::new(Bytes::from(payload), value)
    }

    async fn pump(
        mut notifications: BoxStream<'static, Notification>,
        characteristic_uuid: uuid::Uuid,
        decoder: Arc<dyn Decoder>,
        reading_tx: broadcast::Sender<Reading>,
    ) {
        debug!("Notification pipeline for {} started", characteristic_uuid);

        while let Some(notification) = notifications.next().await {
            if notification.characteristic_uuid != characteristic_uuid {
                continue;
            }

            trace!(
                "Notification from {}: {} bytes, data: {:02X?}",
                characteristic_uuid,
                notification.value.len(),
                &notification.value[..std::cmp::min(notification.value.len(), 20)]
            );

            let reading = Self::decode(decoder.as_ref(), notification.value);
            if let Err(e) = &reading.value {
                warn!("Malformed payload from {}: {}", characteristic_uuid, e);
            }

            let _ = reading_tx.send(reading);
        }

        debug!("Notification pipeline for {} stopped", characteristic_uuid);
    }

    /// The subscribed characteristic.
    pub fn characteristic(&self) -> &GattCharacteristic {
        &self.characteristic
    }

    /// Check whether the subscription is still live.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Stream of decoded readings. Ends when the subscription is torn down;
    /// empty if it already was.
    pub fn readings(&self) -> BoxStream<'static, Reading> {
        match self.reading_tx.lock().as_ref() {
            Some(reading_tx) => broadcast_stream(reading_tx.subscribe()),
            None => stream::empty().boxed(),
        }
    }

    /// Tear the subscription down. Only the first call does anything.
    ///
    /// `notify_platform` is false when the link is already gone and there is
    /// nobody to tell.
    pub(crate) async fn unsubscribe(&self, notify_platform: bool) -> Result<()> {
        if !self.active.swap(false, Ordering::SeqCst) {
            trace!("Subscription on {} already torn down", self.device_id);
            return Ok(());
        }

        let handle = self.pump_handle.lock().take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
        // The pump held the only other sender.
        self.reading_tx.lock().take();

        let result = if notify_platform {
            self.platform
                .unsubscribe(&self.device_id, &self.characteristic)
                .await
                .map_err(Self::classify)
        } else {
            Ok(())
        };

        debug!(
            "Unsubscribed from notifications from {} on {}",
            self.characteristic.uuid, self.device_id
        );

        result
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(handle) = self.pump_handle.lock().take() {
            handle.abort();
        }
        self.reading_tx.lock().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::fake::{read_only_characteristic, sensor_services, FakePlatform};
    use crate::data::ReadingValue;
    use crate::error::DecodeError;
    use crate::protocol::decoder::MockDecoder;
    use crate::protocol::Utf8TextDecoder;

    fn target() -> GattCharacteristic {
        sensor_services()[0].characteristics[1].clone()
    }

    async fn subscription(platform: &Arc<FakePlatform>) -> Arc<Subscription> {
        platform.add_device("A");
        Subscription::start(
            platform.clone(),
            DeviceId::new("A"),
            target(),
            Arc::new(Utf8TextDecoder),
            16,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_readings_are_decoded() {
        let platform = Arc::new(FakePlatform::new());
        let subscription = subscription(&platform).await;
        let mut readings = subscription.readings();

        platform.notify("A", 0x1234, b"300");

        let reading = readings.next().await.unwrap();
        assert_eq!(reading.value, Ok(ReadingValue::Text("300".to_string())));
        assert_eq!(reading.raw, Bytes::from_static(b"300"));
        assert_eq!(platform.subscribe_calls("A"), 1);
    }

    #[tokio::test]
    async fn test_malformed_payload_does_not_end_stream() {
        let platform = Arc::new(FakePlatform::new());
        let subscription = subscription(&platform).await;
        let mut readings = subscription.readings();

        platform.notify("A", 0x1234, &[0xff, 0xfe]);
        platform.notify("A", 0x1234, b"310");

        let bad = readings.next().await.unwrap();
        assert_eq!(bad.value, Err(DecodeError::InvalidUtf8 { valid_up_to: 0 }));

        let good = readings.next().await.unwrap();
        assert_eq!(good.value, Ok(ReadingValue::Text("310".to_string())));
        assert!(subscription.is_active());
    }

    #[tokio::test]
    async fn test_other_characteristics_are_ignored() {
        let platform = Arc::new(FakePlatform::new());
        let subscription = subscription(&platform).await;
        let mut readings = subscription.readings();

        platform.notify("A", 0x0001, b"999");
        platform.notify("A", 0x1234, b"300");

        let reading = readings.next().await.unwrap();
        assert_eq!(reading.raw, Bytes::from_static(b"300"));
    }

    #[tokio::test]
    async fn test_pluggable_decoder() {
        let platform = Arc::new(FakePlatform::new());
        platform.add_device("A");

        let mut decoder = MockDecoder::new();
        let mut calls = 0;
        decoder.expect_decode().times(2).returning(move |_| {
            calls += 1;
            if calls == 1 {
                Err(DecodeError::Empty)
            } else {
                Ok(ReadingValue::Number(42.0))
            }
        });

        let subscription = Subscription::start(
            platform.clone(),
            DeviceId::new("A"),
            target(),
            Arc::new(decoder),
            16,
        )
        .await
        .unwrap();
        let mut readings = subscription.readings();

        platform.notify("A", 0x1234, b"first");
        platform.notify("A", 0x1234, b"second");

        assert_eq!(readings.next().await.unwrap().value, Err(DecodeError::Empty));
        assert_eq!(
            readings.next().await.unwrap().value,
            Ok(ReadingValue::Number(42.0))
        );
    }

    #[tokio::test]
    async fn test_unsubscribe_happens_once() {
        let platform = Arc::new(FakePlatform::new());
        let subscription = subscription(&platform).await;
        let readings = subscription.readings();

        subscription.unsubscribe(true).await.unwrap();
        subscription.unsubscribe(true).await.unwrap();

        assert!(!subscription.is_active());
        assert_eq!(platform.unsubscribe_calls("A"), 1);

        // The subscription is still alive, yet its streams are finished.
        let remaining: Vec<_> = readings.collect().await;
        assert!(remaining.is_empty());
        assert!(subscription.readings().next().await.is_none());
    }

    #[tokio::test]
    async fn test_non_notifying_characteristic_is_rejected() {
        let platform = Arc::new(FakePlatform::new());
        platform.add_device("A");

        let result = Subscription::start(
            platform.clone(),
            DeviceId::new("A"),
            read_only_characteristic(0x00ff, 0x0001),
            Arc::new(Utf8TextDecoder),
            16,
        )
        .await;

        assert!(matches!(result, Err(Error::Subscription { .. })));
        assert_eq!(platform.subscribe_calls("A"), 0);
    }

    #[tokio::test]
    async fn test_platform_subscribe_failure() {
        let platform = Arc::new(FakePlatform::new());
        platform.add_device("A");
        platform.fail_subscribe("A", Error::Bluetooth("CCCD write failed".into()));

        let result = Subscription::start(
            platform.clone(),
            DeviceId::new("A"),
            target(),
            Arc::new(Utf8TextDecoder),
            16,
        )
        .await;

        assert!(matches!(result, Err(Error::Subscription { .. })));
    }
}
