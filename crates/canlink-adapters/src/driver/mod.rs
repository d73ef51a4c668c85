//! Concrete adapter drivers and their registration

pub mod bridge;
pub mod elm;
pub mod lawicel;
pub mod loopback;
#[cfg(all(target_os = "linux", feature = "socketcan"))]
pub mod socketcan;

use std::sync::Arc;

use canlink_core::{Registry, RegistryBuilder, RegistryError};

use crate::transport::{SerialOpener, TransportOpener};

/// Register every built-in driver, opening real serial ports
pub fn register_all(builder: &mut RegistryBuilder) -> Result<(), RegistryError> {
    register_with(builder, Arc::new(SerialOpener))
}

/// Register every built-in driver; serial drivers open their transport
/// through `opener`
pub fn register_with(
    builder: &mut RegistryBuilder,
    opener: Arc<dyn TransportOpener>,
) -> Result<(), RegistryError> {
    lawicel::register(builder, opener.clone())?;
    elm::register(builder, opener.clone())?;
    bridge::register(builder, opener)?;
    loopback::register(builder)?;
    #[cfg(all(target_os = "linux", feature = "socketcan"))]
    socketcan::register(builder)?;
    Ok(())
}

/// Registry holding every built-in driver
pub fn default_registry() -> Result<Registry, RegistryError> {
    let mut builder = RegistryBuilder::new();
    register_all(&mut builder)?;
    Ok(builder.build())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_names() {
        let registry = default_registry().unwrap();
        for name in ["CANUSB", "SLCAN", "ELM327", "OBDLink SX", "CANBridge", "Loopback"] {
            assert!(registry.contains(name), "{} missing", name);
        }
        assert!(registry.describe("CANUSB").unwrap().requires_serial_port);
        assert!(!registry.describe("Loopback").unwrap().requires_serial_port);
    }

    #[test]
    fn test_registering_twice_fails() {
        let mut builder = RegistryBuilder::new();
        register_all(&mut builder).unwrap();
        assert!(matches!(
            register_all(&mut builder),
            Err(RegistryError::Duplicate(_))
        ));
    }
}
