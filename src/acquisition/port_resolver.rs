// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the gantry-control project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Serial port discovery
//!
//! The controller is an Arduino class board, either genuine or a clone behind
//! a CH340/CP210x/FTDI bridge. Discovery matches an ordered list of
//! signatures against each port description and picks the first hit.

use anyhow::Result;
use log::{debug, info, warn};
use tokio_serial::SerialPortType;

/// A serial port seen on the host.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PortCandidate {
    pub path: String,
    pub manufacturer: Option<String>,
    /// USB vendor id rendered as 4 lowercase hex digits.
    pub vendor_id: Option<String>,
    pub product: Option<String>,
}

impl PortCandidate {
    /// Upper-cased `path manufacturer vendor_id` string used for matching.
    pub fn haystack(&self) -> String {
        format!(
            "{} {} {}",
            self.path,
            self.manufacturer.as_deref().unwrap_or(""),
            self.vendor_id.as_deref().unwrap_or("")
        )
        .to_uppercase()
    }
}

/// Source of serial port candidates.
#[cfg_attr(test, mockall::automock)]
pub trait PortEnumerator: Send + Sync {
    fn candidates(&self) -> Result<Vec<PortCandidate>>;
}

/// Enumerates the serial ports of the host.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemPorts;

impl PortEnumerator for SystemPorts {
    fn candidates(&self) -> Result<Vec<PortCandidate>> {
        let ports = tokio_serial::available_ports()?;
        Ok(ports
            .into_iter()
            .map(|port| match port.port_type {
                SerialPortType::UsbPort(usb) => PortCandidate {
                    path: port.port_name,
                    manufacturer: usb.manufacturer,
                    vendor_id: Some(format!("{:04x}", usb.vid)),
                    product: usb.product,
                },
                _ => PortCandidate {
                    path: port.port_name,
                    ..Default::default()
                },
            })
            .collect())
    }
}

/// Picks the controller port among the enumerated candidates.
pub struct PortResolver {
    enumerator: Box<dyn PortEnumerator>,
    signatures: Vec<String>,
}

impl PortResolver {
    pub fn new(enumerator: Box<dyn PortEnumerator>, signatures: Vec<String>) -> Self {
        Self {
            enumerator,
            signatures,
        }
    }

    /// Resolver over the host serial ports.
    pub fn system(signatures: Vec<String>) -> Self {
        Self::new(Box::new(SystemPorts), signatures)
    }

    /// Return the path of the first port matching a signature.
    ///
    /// Signatures are tried in order, and for each signature the ports in
    /// enumeration order. Returns `None` when nothing matches or when the
    /// ports cannot be enumerated.
    pub fn resolve(&self) -> Option<String> {
        let candidates = match self.enumerator.candidates() {
            Ok(candidates) => candidates,
            Err(err) => {
                warn!("Failed to enumerate serial ports: {}", err);
                return None;
            }
        };

        debug!("Found {} serial port(s)", candidates.len());
        let haystacks: Vec<String> = candidates.iter().map(PortCandidate::haystack).collect();

        for signature in &self.signatures {
            let needle = signature.to_uppercase();
            if let Some(index) = haystacks.iter().position(|h| h.contains(&needle)) {
                let path = candidates[index].path.clone();
                info!("Controller port found: {} (matched {})", path, signature);
                return Some(path);
            }
        }

        warn!("No controller port found");
        for candidate in &candidates {
            info!(
                "  {} - {} {}",
                candidate.path,
                candidate.manufacturer.as_deref().unwrap_or("unknown"),
                candidate.product.as_deref().unwrap_or("")
            );
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_SIGNATURES;

    fn signatures() -> Vec<String> {
        DEFAULT_SIGNATURES.iter().map(|s| s.to_string()).collect()
    }

    fn candidate(path: &str, manufacturer: Option<&str>, vid: Option<&str>) -> PortCandidate {
        PortCandidate {
            path: path.to_string(),
            manufacturer: manufacturer.map(str::to_string),
            vendor_id: vid.map(str::to_string),
            product: None,
        }
    }

    #[test]
    fn test_resolve_by_vendor_id() {
        let mut mock = MockPortEnumerator::new();
        mock.expect_candidates().returning(|| {
            Ok(vec![
                candidate("/dev/ttyS0", None, None),
                candidate("/dev/ttyACM0", Some("Unknown"), Some("2341")),
            ])
        });

        let resolver = PortResolver::new(Box::new(mock), signatures());
        assert_eq!(resolver.resolve().as_deref(), Some("/dev/ttyACM0"));
    }

    #[test]
    fn test_resolve_is_case_insensitive() {
        let mut mock = MockPortEnumerator::new();
        mock.expect_candidates()
            .returning(|| Ok(vec![candidate("COM4", Some("wch.cn"), Some("1a86"))]));

        let resolver = PortResolver::new(Box::new(mock), signatures());
        assert_eq!(resolver.resolve().as_deref(), Some("COM4"));
    }

    #[test]
    fn test_signature_order_wins_over_port_order() {
        let mut mock = MockPortEnumerator::new();
        mock.expect_candidates().returning(|| {
            Ok(vec![
                candidate("/dev/ttyUSB0", Some("FTDI FT232R"), Some("0403")),
                candidate("/dev/ttyACM1", Some("Arduino (www.arduino.cc)"), Some("2341")),
            ])
        });

        let resolver = PortResolver::new(Box::new(mock), signatures());
        assert_eq!(resolver.resolve().as_deref(), Some("/dev/ttyACM1"));
    }

    #[test]
    fn test_no_match_returns_none() {
        let mut mock = MockPortEnumerator::new();
        mock.expect_candidates()
            .returning(|| Ok(vec![candidate("/dev/ttyS0", Some("Intel"), Some("8086"))]));

        let resolver = PortResolver::new(Box::new(mock), signatures());
        assert_eq!(resolver.resolve(), None);
    }

    #[test]
    fn test_enumeration_failure_returns_none() {
        let mut mock = MockPortEnumerator::new();
        mock.expect_candidates()
            .returning(|| Err(anyhow::anyhow!("permission denied")));

        let resolver = PortResolver::new(Box::new(mock), signatures());
        assert_eq!(resolver.resolve(), None);
    }

    #[test]
    fn test_resolve_is_repeatable() {
        let mut mock = MockPortEnumerator::new();
        mock.expect_candidates()
            .times(2)
            .returning(|| Ok(vec![candidate("/dev/ttyUSB3", Some("Silicon Labs CP2102"), None)]));

        let resolver = PortResolver::new(Box::new(mock), signatures());
        assert_eq!(resolver.resolve(), resolver.resolve());
    }
}
