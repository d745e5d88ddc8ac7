//! GATT service/characteristic resolution.
//!
//! After a link is up, the services of the peripheral are enumerated and
//! the characteristic to subscribe to is picked by a [`TargetCharacteristic`]
//! rule.

use tracing::debug;
use uuid::Uuid;

use crate::ble::platform::{GattCharacteristic, GattService};
use crate::error::{Error, Result};

/// Which characteristic to subscribe to.
///
/// A specified characteristic UUID is matched by equality; otherwise the
/// first characteristic that supports notifications wins. A specified
/// service UUID restricts the search to that service.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TargetCharacteristic {
    /// Restrict to this service.
    pub service: Option<Uuid>,
    /// Match this characteristic exactly.
    pub characteristic: Option<Uuid>,
}

impl TargetCharacteristic {
    /// Match any notifiable characteristic.
    pub fn any_notifiable() -> Self {
        Self::default()
    }

    /// Match a characteristic by UUID.
    pub fn uuid(characteristic: Uuid) -> Self {
        Self {
            service: None,
            characteristic: Some(characteristic),
        }
    }

    /// Restrict the search to a service.
    pub fn in_service(mut self, service: Uuid) -> Self {
        self.service = Some(service);
        self
    }

    /// Check whether a resolved characteristic satisfies this rule.
    pub fn accepts(&self, characteristic: &GattCharacteristic) -> bool {
        self.service
            .map_or(true, |service| service == characteristic.service_uuid)
            && match self.characteristic {
                Some(uuid) => uuid == characteristic.uuid,
                None => characteristic.properties.can_notify(),
            }
    }
}

impl std::fmt::Display for TargetCharacteristic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.characteristic {
            Some(uuid) => write!(f, "characteristic {}", uuid)?,
            None => write!(f, "notifiable characteristic")?,
        }
        if let Some(service) = self.service {
            write!(f, " in service {}", service)?;
        }
        Ok(())
    }
}

/// Pick the characteristic matching `target`.
///
/// # Errors
///
/// Returns [`Error::CharacteristicNotFound`] if nothing matches.
pub fn resolve(services: &[GattService], target: &TargetCharacteristic) -> Result<GattCharacteristic> {
    let found = services
        .iter()
        .flat_map(|service| service.characteristics.iter())
        .find(|characteristic| target.accepts(characteristic))
        .cloned();

    match found {
        Some(characteristic) => {
            debug!(
                "Resolved {} to {} in service {} ({:?})",
                target, characteristic.uuid, characteristic.service_uuid, characteristic.properties
            );
            Ok(characteristic)
        }
        None => {
            debug!("No match for {} among {} services", target, services.len());
            for service in services {
                for characteristic in &service.characteristics {
                    debug!(
                        "  Available characteristic: {} in service {}",
                        characteristic.uuid, service.uuid
                    );
                }
            }
            Err(Error::CharacteristicNotFound {
                target: target.to_string(),
            })
        }
    }
}

/// Find a characteristic by UUID, regardless of capabilities.
pub fn find_characteristic(services: &[GattService], uuid: &Uuid) -> Option<GattCharacteristic> {
    services
        .iter()
        .flat_map(|service| service.characteristics.iter())
        .find(|characteristic| characteristic.uuid == *uuid)
        .cloned()
}
