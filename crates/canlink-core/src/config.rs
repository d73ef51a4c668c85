//! Per-connection adapter configuration

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::error::AdapterError;

/// Callback receiving faults the error channel could not take
pub type ErrorCallback = Arc<dyn Fn(&AdapterError) + Send + Sync>;

/// Callback receiving informational adapter text
pub type MessageCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// `[]` and `[0]` both mean "accept every identifier"
pub fn is_accept_all(ids: &[u32]) -> bool {
    ids.is_empty() || ids == [0]
}

/// Configuration supplied once at adapter construction
#[derive(Clone)]
pub struct Config {
    /// Serial port path, interface name or device address
    pub port: String,
    /// Serial link baud rate (target rate for AT adapters)
    pub port_baudrate: u32,
    /// CAN bus rate in kbit/s
    pub can_rate: f64,
    /// Acceptance filter identifiers
    pub can_filter: Vec<u32>,
    pub use_extended_id: bool,
    pub debug: bool,
    /// Lowest acceptable adapter firmware version
    pub minimum_firmware_version: Option<String>,
    /// Report the adapter's firmware version through `on_message`
    pub print_version: bool,
    on_error: Option<ErrorCallback>,
    on_message: Option<MessageCallback>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: String::new(),
            port_baudrate: 115_200,
            can_rate: 500.0,
            can_filter: Vec::new(),
            use_extended_id: false,
            debug: false,
            minimum_firmware_version: None,
            print_version: false,
            on_error: None,
            on_message: None,
        }
    }
}

impl Config {
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            ..Default::default()
        }
    }

    pub fn with_port_baudrate(mut self, baud: u32) -> Self {
        self.port_baudrate = baud;
        self
    }

    pub fn with_can_rate(mut self, kbit: f64) -> Self {
        self.can_rate = kbit;
        self
    }

    pub fn with_can_filter(mut self, ids: impl Into<Vec<u32>>) -> Self {
        self.can_filter = ids.into();
        self
    }

    pub fn with_extended_id(mut self, extended: bool) -> Self {
        self.use_extended_id = extended;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_minimum_firmware_version(mut self, version: impl Into<String>) -> Self {
        self.minimum_firmware_version = Some(version.into());
        self
    }

    pub fn with_print_version(mut self, print: bool) -> Self {
        self.print_version = print;
        self
    }

    pub fn on_error(mut self, callback: impl Fn(&AdapterError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(callback));
        self
    }

    pub fn on_message(mut self, callback: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_message = Some(Arc::new(callback));
        self
    }

    /// Surface a fault synchronously. Falls back to the log when no callback is set.
    pub fn emit_error(&self, err: &AdapterError) {
        match &self.on_error {
            Some(cb) => cb(err),
            None => tracing::error!(error = %err, "Unhandled adapter error"),
        }
    }

    /// Surface informational text. Falls back to the log when no callback is set.
    pub fn emit_message(&self, text: &str) {
        match &self.on_message {
            Some(cb) => cb(text),
            None => tracing::info!(message = %text, "Adapter message"),
        }
    }

    pub fn accepts_all(&self) -> bool {
        is_accept_all(&self.can_filter)
    }

    /// Key/value form carried in a gateway session hello. Callbacks stay local.
    pub fn to_metadata(&self) -> BTreeMap<String, String> {
        let mut meta = BTreeMap::new();
        meta.insert("port".to_string(), self.port.clone());
        meta.insert("port_baudrate".to_string(), self.port_baudrate.to_string());
        meta.insert("canrate".to_string(), self.can_rate.to_string());
        meta.insert(
            "canfilter".to_string(),
            self.can_filter
                .iter()
                .map(|id| format!("0x{:X}", id))
                .collect::<Vec<_>>()
                .join(","),
        );
        meta.insert("extended_id".to_string(), self.use_extended_id.to_string());
        meta.insert("print_version".to_string(), self.print_version.to_string());
        meta.insert("debug".to_string(), self.debug.to_string());
        if let Some(min) = &self.minimum_firmware_version {
            meta.insert("min_firmware".to_string(), min.clone());
        }
        meta
    }

    /// Rebuild a config from session metadata; absent keys keep their defaults
    pub fn from_metadata(meta: &BTreeMap<String, String>) -> Result<Self, AdapterError> {
        let mut config = Config::default();
        for (key, value) in meta {
            let value = value.trim();
            match key.as_str() {
                "port" => config.port = value.to_string(),
                "port_baudrate" => config.port_baudrate = parse_field(key, value)?,
                "canrate" => config.can_rate = parse_field(key, value)?,
                "canfilter" => config.can_filter = parse_filter(value)?,
                "extended_id" => config.use_extended_id = parse_flag(key, value)?,
                "print_version" => config.print_version = parse_flag(key, value)?,
                "debug" => config.debug = parse_flag(key, value)?,
                "min_firmware" if !value.is_empty() => {
                    config.minimum_firmware_version = Some(value.to_string())
                }
                _ => {}
            }
        }
        Ok(config)
    }
}

fn parse_field<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, AdapterError> {
    value
        .parse()
        .map_err(|_| AdapterError::InvalidConfig(format!("{}: cannot parse '{}'", key, value)))
}

fn parse_flag(key: &str, value: &str) -> Result<bool, AdapterError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "" | "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(AdapterError::InvalidConfig(format!(
            "{}: expected a boolean, got '{}'",
            key, value
        ))),
    }
}

/// Comma separated ids, decimal or `0x` hex
pub fn parse_filter(value: &str) -> Result<Vec<u32>, AdapterError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
                Some(hex) => u32::from_str_radix(hex, 16),
                None => s.parse(),
            };
            parsed.map_err(|_| AdapterError::InvalidConfig(format!("canfilter: bad id '{}'", s)))
        })
        .collect()
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("port", &self.port)
            .field("port_baudrate", &self.port_baudrate)
            .field("can_rate", &self.can_rate)
            .field("can_filter", &self.can_filter)
            .field("use_extended_id", &self.use_extended_id)
            .field("debug", &self.debug)
            .field("minimum_firmware_version", &self.minimum_firmware_version)
            .field("print_version", &self.print_version)
            .field("on_error", &self.on_error.is_some())
            .field("on_message", &self.on_message.is_some())
            .finish()
    }
}
