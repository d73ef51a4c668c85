//! Static adapter discovery metadata

use serde::{Deserialize, Serialize};

/// Bus types an adapter can reach
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// High-speed CAN
    #[serde(rename = "HSCAN")]
    pub hscan: bool,
    /// K-Line
    #[serde(rename = "KLine")]
    pub kline: bool,
    /// Single-wire CAN
    #[serde(rename = "SWCAN")]
    pub swcan: bool,
}

impl Capabilities {
    pub fn hscan() -> Self {
        Self {
            hscan: true,
            ..Default::default()
        }
    }
}

/// Registry entry metadata, independent of any live connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterInfo {
    pub name: String,
    pub description: String,
    pub capabilities: Capabilities,
    pub requires_serial_port: bool,
}

impl AdapterInfo {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            capabilities: Capabilities::hscan(),
            requires_serial_port: false,
        }
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn serial(mut self) -> Self {
        self.requires_serial_port = true;
        self
    }
}

/// One serial port found on the host
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortInfo {
    pub name: String,
    /// `usb`, `pci`, `bluetooth` or `unknown`
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vid: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,
}
