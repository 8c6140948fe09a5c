//! Host-port allocation utilities.
//!
//! The sandbox maps a host port onto the container's fixed internal
//! service port. Before creating a container, the lifecycle manager
//! checks whether the desired host port can actually be bound and scans
//! forward for an alternative when it cannot.

use crate::cli::ContainerCli;

/// Default cap on the forward scan in [`find_available_port`].
pub const DEFAULT_SCAN_ATTEMPTS: u16 = 50;

/// No bindable port was found within the scan window.
#[derive(Debug, thiserror::Error)]
#[error("no available port found starting from {start} after {attempts} attempts")]
pub struct PortScanError {
    pub start: u16,
    pub attempts: u16,
}

/// Check whether `port` can be bound on all interfaces right now.
///
/// The probe listener is dropped immediately; a positive answer is a
/// snapshot, not a reservation.
pub fn is_port_available(port: u16) -> bool {
    std::net::TcpListener::bind(("0.0.0.0", port)).is_ok()
}

/// Scan forward from `start` for a bindable port.
pub fn find_available_port(start: u16, max_attempts: u16) -> Result<u16, PortScanError> {
    for offset in 0..max_attempts {
        let Some(port) = start.checked_add(offset) else {
            break;
        };
        if is_port_available(port) {
            return Ok(port);
        }
    }
    Err(PortScanError {
        start,
        attempts: max_attempts,
    })
}

/// Best-effort lookup of the running container currently publishing
/// `port` on the host. Used purely for diagnostics when a configured
/// port turns out to be taken; every failure maps to `None`.
pub async fn find_container_using_port(cli: &dyn ContainerCli, port: u16) -> Option<String> {
    let names = cli.list_running().await.ok()?;
    for name in names {
        if let Ok(Some(mapping)) = cli.port_mappings(&name).await {
            if mapping.host_port == port {
                return Some(name);
            }
        }
    }
    None
}
