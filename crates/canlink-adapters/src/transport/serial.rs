//! Serial port transport

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use canlink_core::{AdapterError, AdapterResult, PortInfo};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_serial::{ClearBuffer, SerialPort, SerialPortBuilderExt, SerialPortType, SerialStream};
use tracing::debug;

use super::{Transport, TransportOpener};

/// USB-serial or native UART
pub struct SerialTransport {
    stream: SerialStream,
    baud: u32,
}

impl SerialTransport {
    pub fn open(port: &str, baud: u32) -> AdapterResult<Self> {
        let stream = tokio_serial::new(port, baud)
            .timeout(Duration::from_millis(10))
            .open_native_async()
            .map_err(|e| AdapterError::TransportIo(format!("Failed to open {}: {}", port, e)))?;
        debug!(port = %port, baud, "Serial port opened");
        Ok(Self { stream, baud })
    }
}

impl AsyncRead for SerialTransport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for SerialTransport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().stream).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}

impl Transport for SerialTransport {
    fn set_baud_rate(&mut self, baud: u32) -> AdapterResult<()> {
        self.stream
            .set_baud_rate(baud)
            .map_err(|e| AdapterError::TransportIo(format!("Failed to set {} baud: {}", baud, e)))?;
        self.baud = baud;
        Ok(())
    }

    fn baud_rate(&self) -> u32 {
        self.baud
    }

    fn clear_input(&mut self) -> AdapterResult<()> {
        self.stream
            .clear(ClearBuffer::Input)
            .map_err(|e| AdapterError::TransportIo(format!("Failed to clear input: {}", e)))
    }
}

/// Opens real serial ports
#[derive(Debug, Default, Clone, Copy)]
pub struct SerialOpener;

impl TransportOpener for SerialOpener {
    fn open(&self, port: &str, baud: u32) -> AdapterResult<Box<dyn Transport>> {
        if port.is_empty() {
            return Err(AdapterError::InvalidConfig("no serial port configured".to_string()));
        }
        Ok(Box::new(SerialTransport::open(port, baud)?))
    }
}

/// Serial ports present on this host
pub fn available_ports() -> AdapterResult<Vec<PortInfo>> {
    let ports = tokio_serial::available_ports()
        .map_err(|e| AdapterError::TransportIo(format!("Failed to enumerate ports: {}", e)))?;
    Ok(ports
        .into_iter()
        .map(|port| {
            let mut info = PortInfo {
                name: port.port_name,
                ..Default::default()
            };
            match port.port_type {
                SerialPortType::UsbPort(usb) => {
                    info.kind = "usb".to_string();
                    info.vid = Some(usb.vid);
                    info.pid = Some(usb.pid);
                    info.serial_number = usb.serial_number;
                    info.description = usb.product.or(usb.manufacturer);
                }
                SerialPortType::PciPort => info.kind = "pci".to_string(),
                SerialPortType::BluetoothPort => info.kind = "bluetooth".to_string(),
                SerialPortType::Unknown => info.kind = "unknown".to_string(),
            }
            info
        })
        .collect())
}
