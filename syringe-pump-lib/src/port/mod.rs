//! Serial port discovery for syringe pumps.
//!
//! Each pump sits alone on its own USB-serial adapter at bus address 1, so
//! a pump is found by probing every candidate port with the identification
//! query and matching the pump id it reports.

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "macos")]
mod macos;
#[cfg(target_os = "windows")]
mod windows;

#[cfg(target_os = "linux")]
use linux::{is_port_open, PORT_PREFIX};
#[cfg(target_os = "macos")]
use macos::{is_port_open, PORT_PREFIX};
#[cfg(target_os = "windows")]
use windows::{is_port_open, PORT_PREFIX};

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
const PORT_PREFIX: &str = "";
#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
fn is_port_open(_port_name: &str) -> bool {
    false
}

use anyhow::Result;
use core::time::Duration;
use log::{debug, info};
use thiserror::Error;
use tokio_serial::SerialPortBuilderExt;

use crate::protocol::{self, parse_pump_id};
use crate::transport::{SerialLink, Transport, MIN_COMMAND_INTERVAL};

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("no syringe pump with id {pump_id} found ({candidates} port(s) probed)")]
    NotFound { pump_id: u8, candidates: usize },
    #[error("{port_name:?} busy")]
    PortBusy { port_name: String },
}

#[derive(Debug, Clone)]
pub struct PortSettings {
    pub baudrate: u32,
    /// Line read timeout.
    pub timeout: Duration,
    pub min_interval: Duration,
}

impl Default for PortSettings {
    fn default() -> Self {
        Self {
            baudrate: 9600,
            timeout: Duration::from_secs(2),
            min_interval: MIN_COMMAND_INTERVAL,
        }
    }
}

pub struct Discovered {
    pub port_name: String,
    pub transport: Transport,
}

/// Keeps the port names that carry the platform's adapter prefix.
pub fn filter_candidates<I>(names: I, prefix: &str) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    names
        .into_iter()
        .filter(|name| name.contains(prefix))
        .collect()
}

/// Serial ports that may host a pump and are not held by another process.
pub fn candidate_ports() -> Result<Vec<String>> {
    let names = serialport::available_ports()?
        .into_iter()
        .map(|info| info.port_name);

    Ok(filter_candidates(names, PORT_PREFIX)
        .into_iter()
        .filter(|name| !is_port_open(name))
        .collect())
}

pub fn open_port(port_name: &str, settings: &PortSettings, force: bool) -> Result<Transport> {
    if !force && is_port_open(port_name) {
        return Err(DiscoveryError::PortBusy {
            port_name: port_name.to_string(),
        }
        .into());
    }

    let stream = tokio_serial::new(port_name, settings.baudrate)
        .timeout(settings.timeout)
        .open_native_async()?;

    debug!("open_port OK: {} @ {} baud", port_name, settings.baudrate);
    Ok(Transport::new(
        Box::new(SerialLink::new(stream, settings.timeout)),
        settings.min_interval,
    ))
}

/// Sends the identification query and returns the pump id in the answer.
pub async fn probe(transport: &Transport, address: u8) -> Option<u8> {
    match transport.exchange(&protocol::query_identity(address)).await {
        Ok(raw) if !raw.is_empty() => {
            debug!("probe: full reply {:02X?}", raw);
            parse_pump_id(&raw)
        }
        Ok(_) => None,
        Err(e) => {
            debug!("probe failed: {:#}", e);
            None
        }
    }
}

/// Probes `candidates` in order with transports produced by `open`. The first
/// port answering with `pump_id` is returned open, every other one is closed.
pub async fn select_pump<F>(
    candidates: &[String],
    pump_id: u8,
    address: u8,
    mut open: F,
) -> Result<Discovered>
where
    F: FnMut(&str) -> Result<Transport>,
{
    for port_name in candidates {
        debug!("trying port {}...", port_name);
        let transport = match open(port_name) {
            Ok(transport) => transport,
            Err(e) => {
                debug!("{}: open failed: {:#}", port_name, e);
                continue;
            }
        };

        let received = probe(&transport, address).await;
        debug!("{}: pump id {:?}", port_name, received);

        if received == Some(pump_id) {
            info!("port {}: found pump {}", port_name, pump_id);
            return Ok(Discovered {
                port_name: port_name.clone(),
                transport,
            });
        }

        transport.close().await;
        debug!("{}: closing the serial connection", port_name);
    }

    Err(DiscoveryError::NotFound {
        pump_id,
        candidates: candidates.len(),
    }
    .into())
}

pub async fn discover(pump_id: u8, address: u8, settings: &PortSettings) -> Result<Discovered> {
    let candidates = candidate_ports()?;
    debug!("available ports {:?}", candidates);

    select_pump(&candidates, pump_id, address, |name| {
        open_port(name, settings, true)
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{FakePump, MockBus};
    use std::sync::{Arc, Mutex};

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn candidates_follow_platform_prefix() {
        let all = names(&["/dev/ttyUSB0", "/dev/ttyS0", "/dev/ttyUSB1", "/dev/ttyACM0"]);
        assert_eq!(
            filter_candidates(all.clone(), "/dev/ttyUSB"),
            names(&["/dev/ttyUSB0", "/dev/ttyUSB1"])
        );
        assert_eq!(filter_candidates(all.clone(), "").len(), all.len());
        assert_eq!(
            filter_candidates(names(&["COM3", "/dev/cu.usbserial2"]), "cu.usbserial"),
            names(&["/dev/cu.usbserial2"])
        );
    }

    fn buses(ids: &[Option<u8>]) -> Vec<Arc<Mutex<MockBus>>> {
        ids.iter()
            .map(|id| {
                let bus = MockBus::shared();
                if let Some(id) = id {
                    FakePump {
                        pump_id: *id,
                        ..FakePump::default()
                    }
                    .attach(&bus);
                }
                bus
            })
            .collect()
    }

    #[tokio::test]
    async fn first_matching_port_wins_and_rejects_are_closed() {
        let ports = names(&["/dev/ttyUSB0", "/dev/ttyUSB1", "/dev/ttyUSB2"]);
        let buses = buses(&[None, Some(2), Some(3)]);

        let found = select_pump(&ports, 3, 1, |name| {
            let index = ports.iter().position(|p| p == name).unwrap();
            Ok(MockBus::transport(&buses[index]))
        })
        .await
        .unwrap();

        assert_eq!(found.port_name, "/dev/ttyUSB2");
        assert!(found.transport.is_open().await);
        assert!(buses[0].lock().unwrap().dropped);
        assert!(buses[1].lock().unwrap().dropped);
        assert!(!buses[2].lock().unwrap().dropped);
        assert_eq!(buses[1].lock().unwrap().sent_text(), vec!["/1?80\r"]);
    }

    #[tokio::test]
    async fn no_match_is_not_found() {
        let ports = names(&["/dev/ttyUSB0", "/dev/ttyUSB1"]);
        let buses = buses(&[Some(1), Some(2)]);

        let err = select_pump(&ports, 4, 1, |name| {
            let index = ports.iter().position(|p| p == name).unwrap();
            Ok(MockBus::transport(&buses[index]))
        })
        .await
        .err()
        .unwrap();

        match err.downcast_ref::<DiscoveryError>() {
            Some(DiscoveryError::NotFound {
                pump_id,
                candidates,
            }) => {
                assert_eq!(*pump_id, 4);
                assert_eq!(*candidates, 2);
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert!(buses.iter().all(|bus| bus.lock().unwrap().dropped));
    }

    #[tokio::test]
    async fn ports_failing_to_open_are_skipped() {
        let ports = names(&["/dev/ttyUSB0", "/dev/ttyUSB1"]);
        let buses = buses(&[None, Some(1)]);

        let found = select_pump(&ports, 1, 1, |name| {
            if name == "/dev/ttyUSB0" {
                return Err(anyhow::anyhow!("permission denied"));
            }
            Ok(MockBus::transport(&buses[1]))
        })
        .await
        .unwrap();

        assert_eq!(found.port_name, "/dev/ttyUSB1");
    }
}
