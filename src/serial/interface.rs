use std::io::{Read, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serialport::{ClearBuffer, SerialPort, SerialPortType};

use super::{ConnectionInfo, LineTransport, Result, SerialError};
use crate::config::{PortSignatures, SerialSettings};

pub const LINE_TERMINATOR: &str = "\r\n";

/// Host platform, used to pick which description signatures apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HostPlatform {
    Windows,
    Linux,
    MacOs,
    Other,
}

impl HostPlatform {
    pub fn current() -> Self {
        if cfg!(target_os = "windows") {
            HostPlatform::Windows
        } else if cfg!(target_os = "linux") {
            HostPlatform::Linux
        } else if cfg!(target_os = "macos") {
            HostPlatform::MacOs
        } else {
            HostPlatform::Other
        }
    }

    fn signatures<'a>(&self, signatures: &'a PortSignatures) -> &'a [String] {
        match self {
            HostPlatform::Windows => &signatures.windows,
            HostPlatform::Linux => &signatures.linux,
            HostPlatform::MacOs => &signatures.macos,
            HostPlatform::Other => &[],
        }
    }
}

/// An enumerated serial port and the human-readable description the OS reports.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PortCandidate {
    pub port_name: String,
    pub description: String,
}

impl From<&serialport::SerialPortInfo> for PortCandidate {
    fn from(info: &serialport::SerialPortInfo) -> Self {
        let description = match &info.port_type {
            SerialPortType::UsbPort(usb) => usb
                .product
                .clone()
                .or_else(|| usb.manufacturer.clone())
                .unwrap_or_else(|| format!("USB {:04X}:{:04X}", usb.vid, usb.pid)),
            SerialPortType::PciPort => "PCI serial port".to_string(),
            SerialPortType::BluetoothPort => "Bluetooth serial port".to_string(),
            SerialPortType::Unknown => String::new(),
        };
        Self {
            port_name: info.port_name.clone(),
            description,
        }
    }
}

/// Pick the controller port out of an enumeration result.
///
/// `ports` is `None` when enumeration itself failed. The configured default is
/// used when nothing matches.
pub fn select_port(
    ports: Option<&[PortCandidate]>,
    platform: HostPlatform,
    signatures: &PortSignatures,
    default_port: Option<&str>,
) -> Result<String> {
    let wanted = platform.signatures(signatures);

    if let Some(ports) = ports {
        let matched = ports.iter().find(|candidate| {
            wanted
                .iter()
                .any(|signature| candidate.description.contains(signature.as_str()))
        });
        if let Some(candidate) = matched {
            log::info!(
                "Found controller on {} ({})",
                candidate.port_name,
                candidate.description
            );
            return Ok(candidate.port_name.clone());
        }
    }

    match default_port {
        Some(port) => {
            log::warn!("No controller matched on {:?}, falling back to {}", platform, port);
            Ok(port.to_string())
        }
        None => Err(SerialError::PortNotFound(format!(
            "no port description matches {:?} on {:?}",
            wanted, platform
        ))),
    }
}

struct PortState {
    port: Box<dyn SerialPort>,
    pending: Vec<u8>,
}

/// The hardware connection handle. Blocking port calls run on the blocking pool.
pub struct SerialInterface {
    info: ConnectionInfo,
    reset_settle: Duration,
    state: Arc<Mutex<PortState>>,
}

impl SerialInterface {
    /// List every serial port the OS reports.
    pub fn list_ports() -> Result<Vec<PortCandidate>> {
        let ports = serialport::available_ports()?;
        Ok(ports.iter().map(PortCandidate::from).collect())
    }

    /// Find the controller port for this host.
    pub fn discover_port(platform: HostPlatform, settings: &SerialSettings) -> Result<String> {
        let ports = match Self::list_ports() {
            Ok(ports) => Some(ports),
            Err(e) => {
                log::warn!("Serial port enumeration failed: {}", e);
                None
            }
        };
        select_port(
            ports.as_deref(),
            platform,
            &settings.signatures,
            settings.default_port.as_deref(),
        )
    }

    /// Open the link. Nothing is kept on failure.
    pub fn open(port_name: &str, baud_rate: u32, read_timeout: Duration) -> Result<Self> {
        let port = serialport::new(port_name, baud_rate)
            .timeout(read_timeout)
            .open()
            .map_err(|e| SerialError::ConnectionFailed(format!("{}: {}", port_name, e)))?;

        log::info!("Opened {} at {} baud", port_name, baud_rate);
        Ok(Self {
            info: ConnectionInfo {
                port_name: port_name.to_string(),
                baud_rate,
                read_timeout,
            },
            reset_settle: Duration::from_millis(100),
            state: Arc::new(Mutex::new(PortState {
                port,
                pending: Vec::new(),
            })),
        })
    }

    pub fn with_reset_settle(mut self, settle: Duration) -> Self {
        self.reset_settle = settle;
        self
    }

    async fn with_port<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut PortState) -> Result<T> + Send + 'static,
    {
        let state = Arc::clone(&self.state);
        tokio::task::spawn_blocking(move || {
            let mut guard = state
                .lock()
                .map_err(|_| SerialError::ProtocolError("Port lock poisoned".to_string()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| SerialError::ProtocolError(format!("Blocking port task failed: {}", e)))?
    }
}

#[async_trait::async_trait]
impl LineTransport for SerialInterface {
    async fn write_line(&mut self, text: &str) -> Result<()> {
        let framed = frame_line(text);
        self.with_port(move |state| {
            state.port.write_all(framed.as_bytes())?;
            state.port.flush()?;
            Ok(())
        })
        .await
    }

    async fn read_line(&mut self) -> Result<Option<String>> {
        self.with_port(|state| {
            let PortState { port, pending } = state;
            read_line_from(port, pending)
        })
        .await
    }

    async fn reset_buffers(&mut self) -> Result<()> {
        let settle = self.reset_settle;
        let port_name = self.info.port_name.clone();
        self.with_port(move |state| {
            state.port.write_data_terminal_ready(false)?;
            std::thread::sleep(settle);
            state.port.clear(ClearBuffer::All)?;
            state.pending.clear();
            state.port.write_data_terminal_ready(true)?;
            log::debug!("Reset handshake complete on {}", port_name);
            Ok(())
        })
        .await
    }

    fn info(&self) -> &ConnectionInfo {
        &self.info
    }
}

/// Append the wire terminator.
pub fn frame_line(text: &str) -> String {
    format!("{}{}", text, LINE_TERMINATOR)
}

/// Pull one LF-terminated line out of `reader`, buffering partial data in
/// `pending` across calls.
///
/// A read timeout (or a zero-length read) ends the attempt. Whatever partial
/// text was buffered is returned as a line then; with nothing buffered the
/// result is `None`.
pub fn read_line_from<R: Read + ?Sized>(reader: &mut R, pending: &mut Vec<u8>) -> Result<Option<String>> {
    let mut buf = [0u8; 256];
    loop {
        if let Some(pos) = pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = pending.drain(..=pos).collect();
            return Ok(Some(decode_line(&line)));
        }

        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => pending.extend_from_slice(&buf[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => break,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(SerialError::IoError(e)),
        }
    }

    if pending.is_empty() {
        Ok(None)
    } else {
        let line = std::mem::take(pending);
        Ok(Some(decode_line(&line)))
    }
}

fn decode_line(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw)
        .trim_end_matches(['\r', '\n'])
        .to_string()
}
