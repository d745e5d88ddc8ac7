//! Utility functions for the smartsleeve-ble crate.

use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::broadcast;
use tracing::warn;

/// Placeholder shown when no water level is available.
pub const WATER_LEVEL_PLACEHOLDER: &str = "--.-- ml";

/// Format a water level for display.
///
/// # Arguments
///
/// * `millilitres` - The current level, or `None` when the device is disconnected
///
/// # Example
///
/// ```
/// use smartsleeve_ble::format_water_level;
///
/// assert_eq!(format_water_level(Some(300.0)), "300 ml");
/// assert_eq!(format_water_level(None), "--.-- ml");
/// ```
pub fn format_water_level(millilitres: Option<f64>) -> String {
    match millilitres {
        Some(ml) if ml.is_finite() => {
            if ml.fract() == 0.0 {
                format!("{:.0} ml", ml)
            } else {
                format!("{:.1} ml", ml)
            }
        }
        _ => WATER_LEVEL_PLACEHOLDER.to_string(),
    }
}

/// Turn a broadcast receiver into a stream.
///
/// Lagged receivers skip what they missed and keep going; the stream ends
/// when every sender is dropped.
pub(crate) fn broadcast_stream<T>(rx: broadcast::Receiver<T>) -> BoxStream<'static, T>
where
    T: Clone + Send + 'static,
{
    stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(item) => return Some((item, rx)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Stream receiver lagged, skipped {} items", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_water_level() {
        assert_eq!(format_water_level(Some(300.0)), "300 ml");
        assert_eq!(format_water_level(Some(12.5)), "12.5 ml");
        assert_eq!(format_water_level(None), "--.-- ml");
        assert_eq!(format_water_level(Some(f64::NAN)), "--.-- ml");
    }

    #[tokio::test]
    async fn test_broadcast_stream_ends_when_sender_dropped() {
        let (tx, rx) = broadcast::channel(4);
        let stream = broadcast_stream(rx);

        tx.send(1).unwrap();
        tx.send(2).unwrap();
        drop(tx);

        let items: Vec<i32> = stream.collect().await;
        assert_eq!(items, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_broadcast_stream_survives_lag() {
        let (tx, rx) = broadcast::channel(2);
        let stream = broadcast_stream(rx);

        for i in 0..5 {
            tx.send(i).unwrap();
        }
        drop(tx);

        let items: Vec<i32> = stream.collect().await;
        assert_eq!(items, vec![3, 4]);
    }
}
