//! SFU Configuration

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};

use crate::engine::TransportListenOptions;
use crate::rtp::IceServer;

/// SFU configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SfuConfig {
    /// Maximum number of concurrent rooms (0 = unlimited)
    pub max_rooms: usize,
    /// Maximum peers per room (0 = unlimited)
    pub max_peers_per_room: usize,
    /// Local address media transports bind to
    pub listen_ip: IpAddr,
    /// Public address advertised in ICE candidates (needed behind NAT)
    pub announced_address: Option<String>,
    /// Lower bound of the RTC port range (0 = let the engine pick)
    pub rtc_min_port: u16,
    /// Upper bound of the RTC port range
    pub rtc_max_port: u16,
    /// STUN/TURN servers handed to clients with every transport
    pub ice_servers: Vec<IceServer>,
    /// Capacity of each peer's outbound notification queue
    pub notification_queue_capacity: usize,
}

impl Default for SfuConfig {
    fn default() -> Self {
        Self {
            max_rooms: 0,
            max_peers_per_room: 50,
            listen_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            announced_address: None,
            rtc_min_port: 40000,
            rtc_max_port: 49999,
            ice_servers: vec![IceServer {
                urls: "stun:stun.l.google.com:19302".to_string(),
                username: None,
                credential: None,
            }],
            notification_queue_capacity: 256,
        }
    }
}

impl SfuConfig {
    /// Transport binding options: UDP and TCP enabled, UDP preferred
    #[must_use]
    pub fn transport_options(&self) -> TransportListenOptions {
        let port_range = if self.rtc_min_port == 0 {
            None
        } else {
            Some(self.rtc_min_port..=self.rtc_max_port)
        };

        TransportListenOptions {
            listen_ip: self.listen_ip,
            announced_address: self.announced_address.clone(),
            port_range,
            enable_udp: true,
            enable_tcp: true,
            prefer_udp: true,
        }
    }

    /// Collect every configuration problem instead of failing on the first
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.rtc_min_port != 0 && self.rtc_min_port > self.rtc_max_port {
            errors.push(format!(
                "rtc_min_port ({}) must not exceed rtc_max_port ({})",
                self.rtc_min_port, self.rtc_max_port
            ));
        }
        if self.notification_queue_capacity == 0 {
            errors.push("notification_queue_capacity must be greater than 0".to_string());
        }
        for server in &self.ice_servers {
            if !(server.urls.starts_with("stun:")
                || server.urls.starts_with("turn:")
                || server.urls.starts_with("turns:"))
            {
                errors.push(format!("ice server url '{}' must use stun:, turn: or turns:", server.urls));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_transport_options() {
        let config = SfuConfig::default();
        let options = config.transport_options();
        assert!(options.enable_udp && options.enable_tcp && options.prefer_udp);
        assert_eq!(options.port_range, Some(40000..=49999));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let config = SfuConfig {
            rtc_min_port: 5000,
            rtc_max_port: 4000,
            notification_queue_capacity: 0,
            ice_servers: vec![IceServer {
                urls: "http://example.com".to_string(),
                username: None,
                credential: None,
            }],
            ..Default::default()
        };
        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 3);
    }

    #[test]
    fn test_zero_min_port_lets_engine_pick() {
        let config = SfuConfig {
            rtc_min_port: 0,
            ..Default::default()
        };
        assert_eq!(config.transport_options().port_range, None);
    }
}
