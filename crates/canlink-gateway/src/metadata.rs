//! Session hello metadata

use std::collections::BTreeMap;

use canlink_core::Config;

use crate::error::{GatewayError, GatewayResult};

/// Metadata key naming the registry adapter to open
pub const ADAPTER_KEY: &str = "adapter";

/// Hello metadata for opening `adapter` with `config`
pub fn hello(adapter: &str, config: &Config) -> BTreeMap<String, String> {
    let mut meta = config.to_metadata();
    meta.insert(ADAPTER_KEY.to_string(), adapter.to_string());
    meta
}

/// Adapter name and configuration requested by a session hello
pub fn session_config(meta: &BTreeMap<String, String>) -> GatewayResult<(String, Config)> {
    let adapter = meta
        .get(ADAPTER_KEY)
        .map(|name| name.trim())
        .filter(|name| !name.is_empty())
        .ok_or_else(|| GatewayError::Metadata("missing 'adapter' key".to_string()))?;
    let config = Config::from_metadata(meta).map_err(|e| GatewayError::Metadata(e.to_string()))?;
    Ok((adapter.to_string(), config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_hello_round_trip() {
        let config = Config::new("/dev/ttyUSB0")
            .with_port_baudrate(500_000)
            .with_can_rate(250.0)
            .with_can_filter(vec![0x7E8, 0x7E9])
            .with_extended_id(true)
            .with_minimum_firmware_version("1.3");
        let meta = hello("ELM327", &config);

        let (adapter, parsed) = session_config(&meta).unwrap();
        assert_eq!(adapter, "ELM327");
        assert_eq!(parsed.port, "/dev/ttyUSB0");
        assert_eq!(parsed.port_baudrate, 500_000);
        assert_eq!(parsed.can_rate, 250.0);
        assert_eq!(parsed.can_filter, vec![0x7E8, 0x7E9]);
        assert!(parsed.use_extended_id);
        assert_eq!(parsed.minimum_firmware_version.as_deref(), Some("1.3"));
    }

    #[test]
    fn test_missing_adapter() {
        let meta = Config::default().to_metadata();
        assert!(matches!(session_config(&meta), Err(GatewayError::Metadata(_))));
    }

    #[test]
    fn test_bad_value() {
        let mut meta = hello("Loopback", &Config::default());
        meta.insert("port_baudrate".to_string(), "fast".to_string());
        assert!(matches!(session_config(&meta), Err(GatewayError::Metadata(_))));
    }
}
