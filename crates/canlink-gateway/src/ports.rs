//! Serial port discovery

use canlink_core::{AdapterResult, PortInfo};

/// Source of the host's serial port list
pub trait PortLister: Send + Sync {
    fn list(&self) -> AdapterResult<Vec<PortInfo>>;
}

/// Enumerates real serial ports
#[derive(Debug, Default, Clone, Copy)]
pub struct SerialPorts;

impl PortLister for SerialPorts {
    fn list(&self) -> AdapterResult<Vec<PortInfo>> {
        canlink_adapters::available_ports()
    }
}

/// Fixed list, for tests and hosts without serial hardware
#[derive(Debug, Default, Clone)]
pub struct FixedPorts(pub Vec<PortInfo>);

impl PortLister for FixedPorts {
    fn list(&self) -> AdapterResult<Vec<PortInfo>> {
        Ok(self.0.clone())
    }
}
