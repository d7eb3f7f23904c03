//! Link bootstrap
//!
//! Brings the radio up, finds the configured network by name, locks the
//! radio to its channel and, when a password is configured, associates with
//! the access point.

use std::net::Ipv4Addr;

use tracing::{debug, info};

use super::error::{ConnectError, RadioError};
use super::radio::Radio;

/// Result of bringing the link up
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub ssid: String,
    pub password: Option<String>,
    pub channel: u8,
    /// Address assigned by the access point, if associated
    pub ip_address: Option<Ipv4Addr>,
}

/// Channel of the first visible network named `ssid`
pub fn find_channel(radio: &dyn Radio, ssid: &str) -> Result<Option<u8>, RadioError> {
    let networks = radio.scan()?;
    debug!("Scan found {} networks", networks.len());
    Ok(networks
        .into_iter()
        .find(|ap| ap.ssid == ssid)
        .map(|ap| ap.channel))
}

/// Bring the link up on the channel of `ssid`.
///
/// A missing network is reported as [`ConnectError::NetworkNotFound`] and is
/// not retried here.
pub fn bring_up(
    radio: &dyn Radio,
    ssid: &str,
    password: Option<&str>,
) -> Result<Link, ConnectError> {
    if ssid.is_empty() {
        return Err(ConnectError::MissingSsid);
    }

    radio.start()?;

    let channel =
        find_channel(radio, ssid)?.ok_or_else(|| ConnectError::NetworkNotFound(ssid.to_string()))?;
    radio.set_channel(channel)?;
    info!("Found network '{}' on channel {}", ssid, channel);

    let ip_address = match password {
        Some(password) => {
            let ip = radio.associate(ssid, password, channel)?;
            info!("Got IP address {}", ip);
            Some(ip)
        }
        None => None,
    };

    Ok(Link {
        ssid: ssid.to_string(),
        password: password.map(str::to_string),
        channel,
        ip_address,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::mac::MacAddress;
    use crate::network::sim::SimulatedAir;

    #[test]
    fn test_bring_up_selects_channel() {
        let air = SimulatedAir::new();
        air.add_access_point("other", 1, None);
        air.add_access_point("moods", 9, None);
        let radio = air.radio(MacAddress::random());

        let link = bring_up(radio.as_ref(), "moods", None).unwrap();
        assert_eq!(link.channel, 9);
        assert_eq!(link.ip_address, None);
        assert_eq!(radio.channel(), Some(9));
    }

    #[test]
    fn test_missing_network_is_distinguishable() {
        let air = SimulatedAir::new();
        air.add_access_point("other", 1, None);
        let radio = air.radio(MacAddress::random());

        assert_eq!(
            bring_up(radio.as_ref(), "moods", None),
            Err(ConnectError::NetworkNotFound("moods".to_string()))
        );
        assert_eq!(
            bring_up(radio.as_ref(), "", None),
            Err(ConnectError::MissingSsid)
        );
    }

    #[test]
    fn test_password_triggers_association() {
        let air = SimulatedAir::new();
        air.add_access_point("moods", 6, Some("secret"));
        let radio = air.radio(MacAddress::random());

        let link = bring_up(radio.as_ref(), "moods", Some("secret")).unwrap();
        assert!(link.ip_address.is_some());
        assert_eq!(radio.ip_address(), link.ip_address);

        let err = bring_up(radio.as_ref(), "moods", Some("nope")).unwrap_err();
        assert!(matches!(
            err,
            ConnectError::Radio(RadioError::AssociationFailed { .. })
        ));
    }
}
