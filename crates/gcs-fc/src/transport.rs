//! Transport boundary: the core only needs send, receive-with-timeout and close.

use mavlink::{common::MavMessage, error::MessageReadError, MavConnection, MavHeader};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, info, warn};

use crate::error::TransportError;

/// Decoded frame with the header of the sender.
pub type Frame = (MavHeader, MavMessage);

pub trait Transport: Send + Sync {
    fn send(&self, msg: &MavMessage) -> Result<(), TransportError>;

    /// Waits up to `timeout` for the next frame. `Ok(None)` when nothing arrived.
    fn recv_timeout(&self, timeout: Duration) -> Result<Option<Frame>, TransportError>;

    /// Idempotent.
    fn close(&self);
}

/// Opens transports for an endpoint. Reconnection goes through this too.
pub trait Connector: Send + Sync {
    fn open(&self, endpoint: &Endpoint, sys_id: u8, comp_id: u8) -> Result<Arc<dyn Transport>, TransportError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// Any address understood by `mavlink::connect` (udpin/udpout/tcpout/...).
    Network(String),
    Serial { path: String, baud: u32 },
}

impl Endpoint {
    pub fn parse(endpoint: &str, baud: u32) -> Result<Self, TransportError> {
        let endpoint = endpoint.trim();
        const NETWORK: &[&str] = &["udpin:", "udpout:", "udpbcast:", "tcpin:", "tcpout:"];
        if NETWORK.iter().any(|p| endpoint.starts_with(p)) {
            return Ok(Endpoint::Network(endpoint.to_string()));
        }
        if let Some(rest) = endpoint.strip_prefix("serial:") {
            // serial:/dev/ttyUSB0:57600, baud suffix optional
            return match rest.rsplit_once(':') {
                Some((path, b)) if !path.is_empty() => {
                    let baud = b
                        .parse()
                        .map_err(|_| TransportError::Io(format!("bad baud rate in {}", endpoint)))?;
                    Ok(Endpoint::Serial { path: path.to_string(), baud })
                }
                _ if !rest.is_empty() => Ok(Endpoint::Serial { path: rest.to_string(), baud }),
                _ => Err(TransportError::Io(format!("missing serial device in {}", endpoint))),
            };
        }
        if endpoint.starts_with('/') || endpoint.to_ascii_uppercase().starts_with("COM") {
            return Ok(Endpoint::Serial { path: endpoint.to_string(), baud });
        }
        Err(TransportError::Io(format!("unsupported endpoint: {}", endpoint)))
    }

    pub fn url(&self) -> String {
        match self {
            Endpoint::Network(url) => url.clone(),
            Endpoint::Serial { path, baud } => format!("serial:{}:{}", path, baud),
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.url())
    }
}

type SharedConn = Arc<dyn MavConnection<MavMessage> + Send + Sync>;

/// MAVLink connection with a dedicated reader thread.
///
/// `mavlink` receive calls block without a timeout, so a reader thread feeds a
/// bounded queue that `recv_timeout` drains.
pub struct MavTransport {
    conn: SharedConn,
    hdr: Mutex<MavHeader>,
    inbound: Mutex<mpsc::Receiver<Result<Frame, TransportError>>>,
    closed: Arc<AtomicBool>,
    url: String,
}

impl MavTransport {
    pub fn open(endpoint: &Endpoint, sys_id: u8, comp_id: u8) -> Result<Self, TransportError> {
        if let Endpoint::Serial { path, baud } = endpoint {
            // quick validate device
            let _ = tokio_serial::new(path, *baud)
                .open_native_async()
                .map_err(|e| TransportError::Io(format!("open serial device {}: {}", path, e)))?;
        }

        let url = endpoint.url();
        let conn: SharedConn = Arc::from(
            mavlink::connect::<MavMessage>(&url)
                .map_err(|e| TransportError::Io(format!("mavlink connect {}: {}", url, e)))?,
        );

        let closed = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::sync_channel(256);
        let reader_conn = conn.clone();
        let reader_closed = closed.clone();
        std::thread::Builder::new()
            .name("mav-reader".into())
            .spawn(move || reader_loop(reader_conn, reader_closed, tx))
            .map_err(|e| TransportError::Io(format!("spawn reader: {}", e)))?;

        info!("transport: opened {}", url);
        Ok(Self {
            conn,
            hdr: Mutex::new(MavHeader { system_id: sys_id, component_id: comp_id, sequence: 0 }),
            inbound: Mutex::new(rx),
            closed,
            url,
        })
    }
}

fn reader_loop(conn: SharedConn, closed: Arc<AtomicBool>, tx: mpsc::SyncSender<Result<Frame, TransportError>>) {
    while !closed.load(Ordering::Acquire) {
        let item = match conn.recv() {
            Ok(frame) => Ok(frame),
            Err(MessageReadError::Io(e))
                if matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut) =>
            {
                continue;
            }
            Err(MessageReadError::Io(e)) => {
                // Avoid spinning on a dead socket/port.
                std::thread::sleep(Duration::from_millis(10));
                Err(TransportError::Io(e.to_string()))
            }
            Err(MessageReadError::Parse(e)) => Err(TransportError::Decode(format!("{:?}", e))),
        };
        if tx.send(item).is_err() {
            break;
        }
    }
    debug!("transport: reader thread exiting");
}

impl Transport for MavTransport {
    fn send(&self, msg: &MavMessage) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let hdr = {
            let mut hdr = self.hdr.lock().unwrap_or_else(|e| e.into_inner());
            hdr.sequence = hdr.sequence.wrapping_add(1);
            *hdr
        };
        self.conn
            .send(&hdr, msg)
            .map_err(|e| TransportError::Io(format!("mavlink send: {:?}", e)))?;
        Ok(())
    }

    fn recv_timeout(&self, timeout: Duration) -> Result<Option<Frame>, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let rx = self.inbound.lock().unwrap_or_else(|e| e.into_inner());
        match rx.recv_timeout(timeout) {
            Ok(Ok(frame)) => Ok(Some(frame)),
            Ok(Err(e)) => Err(e),
            Err(mpsc::RecvTimeoutError::Timeout) => Ok(None),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(TransportError::Closed),
        }
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            // The reader thread notices on its next receive and drops the connection.
            info!("transport: closed {}", self.url);
        }
    }
}

impl Drop for MavTransport {
    fn drop(&mut self) {
        self.close();
    }
}

/// Production connector backed by the `mavlink` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct MavConnector;

impl Connector for MavConnector {
    fn open(&self, endpoint: &Endpoint, sys_id: u8, comp_id: u8) -> Result<Arc<dyn Transport>, TransportError> {
        match MavTransport::open(endpoint, sys_id, comp_id) {
            Ok(t) => Ok(Arc::new(t)),
            Err(e) => {
                warn!("transport: open {} failed: {}", endpoint, e);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_network_endpoints() {
        assert_eq!(
            Endpoint::parse("udpin:0.0.0.0:14550", 57600).unwrap(),
            Endpoint::Network("udpin:0.0.0.0:14550".into())
        );
        assert_eq!(
            Endpoint::parse(" tcpout:127.0.0.1:5760 ", 57600).unwrap().url(),
            "tcpout:127.0.0.1:5760"
        );
    }

    #[test]
    fn parses_serial_endpoints() {
        assert_eq!(
            Endpoint::parse("serial:/dev/ttyUSB0:115200", 57600).unwrap(),
            Endpoint::Serial { path: "/dev/ttyUSB0".into(), baud: 115200 }
        );
        assert_eq!(
            Endpoint::parse("/dev/ttyACM0", 57600).unwrap(),
            Endpoint::Serial { path: "/dev/ttyACM0".into(), baud: 57600 }
        );
        assert_eq!(
            Endpoint::parse("COM3", 921600).unwrap().url(),
            "serial:COM3:921600"
        );
    }

    #[test]
    fn rejects_unknown_endpoint() {
        assert!(Endpoint::parse("http://example", 57600).is_err());
        assert!(Endpoint::parse("serial:/dev/ttyUSB0:fast", 57600).is_err());
    }
}
