//! MDNS/Zeroconf discovery: an external collaborator (spec.md §1, §6).
//!
//! The core never resolves `_arsdk-<hex>._udp.local.` service records
//! itself; this module only pins the recognised device-id table and the
//! tuple shape a real locator (e.g. `mdns-sd`) plugs into, per spec.md's
//! "pluggable locator producing `{device_id, ip, port}` tuples."

use std::net::IpAddr;
use std::time::Duration;

/// Recognised device ids (spec.md §6). Mambo is BLE-only in practice and
/// has no MDNS service id; it is reachable only by direct construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    BebopDrone,
    JumpingSumo,
    SkyController,
    JumpingNight,
    JumpingRace,
    Bebop2,
    SkyController2,
    Mambo,
}

impl DeviceKind {
    /// The 4-hex-digit id used in the `_arsdk-<hex>._udp.local.` service
    /// type, or `None` for [`DeviceKind::Mambo`] (no MDNS presence).
    pub fn service_id(self) -> Option<&'static str> {
        match self {
            Self::BebopDrone => Some("0901"),
            Self::JumpingSumo => Some("0902"),
            Self::SkyController => Some("0903"),
            Self::JumpingNight => Some("0905"),
            Self::JumpingRace => Some("0906"),
            Self::Bebop2 => Some("090c"),
            Self::SkyController2 => Some("090f"),
            Self::Mambo => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unrecognised arsdk device id {0:?}")]
pub struct UnknownDeviceId(String);

impl TryFrom<&str> for DeviceKind {
    type Error = UnknownDeviceId;

    fn try_from(hex_id: &str) -> Result<Self, Self::Error> {
        match hex_id {
            "0901" => Ok(Self::BebopDrone),
            "0902" => Ok(Self::JumpingSumo),
            "0903" => Ok(Self::SkyController),
            "0905" => Ok(Self::JumpingNight),
            "0906" => Ok(Self::JumpingRace),
            "090c" => Ok(Self::Bebop2),
            "090f" => Ok(Self::SkyController2),
            other => Err(UnknownDeviceId(other.to_owned())),
        }
    }
}

/// One resolved `{device_id, ip, port}` tuple plus the service name MDNS
/// advertised it under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    pub kind: DeviceKind,
    pub name: String,
    pub address: IpAddr,
    pub port: u16,
}

/// Implemented by a real MDNS/Zeroconf resolver; shipping one is out of
/// scope for this crate (spec.md §1's "pluggable locator").
pub trait Locator {
    fn discover(&self, timeout: Duration) -> Vec<DiscoveredDevice>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_ids_match_the_spec_table() {
        assert_eq!(DeviceKind::BebopDrone.service_id(), Some("0901"));
        assert_eq!(DeviceKind::Bebop2.service_id(), Some("090c"));
        assert_eq!(DeviceKind::SkyController2.service_id(), Some("090f"));
        assert_eq!(DeviceKind::Mambo.service_id(), None);
    }

    #[test]
    fn try_from_round_trips_known_ids() {
        assert_eq!(DeviceKind::try_from("0902").unwrap(), DeviceKind::JumpingSumo);
        assert!(DeviceKind::try_from("ffff").is_err());
    }
}
