//! The byte-stream collaborators the session drives (C6). Neither variant
//! knows anything about frames; they only hand back something that is
//! `AsyncRead + AsyncWrite`, exactly as `Broker` did in the teacher crate.

use std::io;
use std::path::Path;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio_serial::{DataBits, FlowControl, Parity, Serial, SerialPortSettings, StopBits};

use crate::constants::{DEFAULT_BAUD_RATE, DEFAULT_TCP_PORT};

/// Connect to a PLM exposed over TCP. `host` may be `host:port`; if no
/// port is given, [`DEFAULT_TCP_PORT`] (9761) is used.
pub async fn connect_tcp(host: &str) -> io::Result<TcpStream> {
    let addr = if host.contains(':') {
        host.to_string()
    } else {
        format!("{}:{}", host, DEFAULT_TCP_PORT)
    };
    TcpStream::connect(addr).await
}

/// Open a serial port with the PLM's required line settings: 19200 baud,
/// 8 data bits, 1 stop bit, no parity, no flow control.
pub fn connect_serial(path: impl AsRef<Path>) -> io::Result<Serial> {
    let settings = SerialPortSettings {
        baud_rate: DEFAULT_BAUD_RATE,
        data_bits: DataBits::Eight,
        flow_control: FlowControl::None,
        parity: Parity::None,
        stop_bits: StopBits::One,
        timeout: Duration::from_millis(100),
    };

    Serial::from_path(path.as_ref(), &settings)
}
