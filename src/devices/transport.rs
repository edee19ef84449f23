use std::io::{self, Read, Write};
use std::net::UdpSocket;
use std::time::Duration;
use serialport::SerialPort;
use tracing::{debug, info};

/// How long a single `recv` blocks before reporting that nothing arrived.
const POLL_TIMEOUT: Duration = Duration::from_millis(50);

/// Blocking byte pipe to a device.
pub trait Transport {
    fn send(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Reads whatever has arrived, returning `Ok(0)` if nothing did within the poll timeout.
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn describe(&self) -> String;
}

fn timed_out(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
    )
}

pub struct SerialTransport {
    port: Box<dyn SerialPort>,
    path: String,
}

impl SerialTransport {
    pub fn open(path: &str, baudrate: u32) -> serialport::Result<Self> {
        info!("Opening serial port {} at {} baud", path, baudrate);
        let port = serialport::new(path, baudrate)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .timeout(POLL_TIMEOUT)
            .open()?;
        Ok(SerialTransport {
            port,
            path: path.to_string(),
        })
    }
}

impl Transport for SerialTransport {
    fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        debug!("Serial write to {}: {} bytes", self.path, bytes.len());
        self.port.write_all(bytes)?;
        self.port.flush()
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if timed_out(&e) => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn describe(&self) -> String {
        format!("serial {}", self.path)
    }
}

pub struct UdpTransport {
    socket: UdpSocket,
    peer: String,
}

impl UdpTransport {
    pub fn connect(host: &str, port: u16) -> io::Result<Self> {
        let peer = format!("{}:{}", host, port);
        info!("Connecting to UDP device at {}", peer);
        let socket = UdpSocket::bind(("0.0.0.0", 0))?;
        socket.connect((host, port))?;
        socket.set_read_timeout(Some(POLL_TIMEOUT))?;
        Ok(UdpTransport { socket, peer })
    }
}

impl Transport for UdpTransport {
    fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        debug!("UDP send to {}: {} bytes", self.peer, bytes.len());
        self.socket.send(bytes)?;
        Ok(())
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.socket.recv(buf) {
            Ok(n) => Ok(n),
            Err(e) if timed_out(&e) => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn describe(&self) -> String {
        format!("udp {}", self.peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn udp_transport_exchanges_datagrams() {
        let device = UdpSocket::bind(("127.0.0.1", 0)).unwrap();
        let port = device.local_addr().unwrap().port();
        let mut transport = UdpTransport::connect("127.0.0.1", port).unwrap();

        transport.send(b"BR").unwrap();
        let mut buf = [0u8; 16];
        let (n, from) = device.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"BR");

        device.send_to(b"ok", from).unwrap();
        let n = transport.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ok");
    }

    #[test]
    fn udp_recv_without_data_reports_zero_bytes() {
        let device = UdpSocket::bind(("127.0.0.1", 0)).unwrap();
        let port = device.local_addr().unwrap().port();
        let mut transport = UdpTransport::connect("127.0.0.1", port).unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(transport.recv(&mut buf).unwrap(), 0);
        assert_eq!(transport.describe(), format!("udp 127.0.0.1:{}", port));
    }
}
