/*!
 * Transport boundary between the command hub and the physical line.
 *
 * The hub only needs three primitives: write a command line, read one
 * terminated answer, and drain whatever is sitting in the receive buffer.
 * Timeouts belong to the transport; a read that gives up must report
 * `io::ErrorKind::TimedOut`.
 */
use std::fmt::Debug;
use std::io;

/// A byte line to the stand
pub trait Transport: Send + Debug {
    /// Write `command` followed by `terminator`
    fn send_command(&mut self, command: &str, terminator: &str) -> io::Result<()>;

    /// Read one answer up to `terminator`, returned without the terminator
    ///
    /// Fails with `io::ErrorKind::TimedOut` when no terminated answer of at
    /// most `max_len` bytes arrives in time.
    fn read_answer(&mut self, terminator: &str, max_len: usize) -> io::Result<String>;

    /// Copy already-received bytes into `buf` without waiting; returns the count
    fn read_pending(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Opens transports by port name (the host's serial port manager)
pub trait PortProvider: Send + Sync + Debug {
    /// Open the named port
    fn open(&self, port: &str) -> io::Result<Box<dyn Transport>>;
}

#[cfg(feature = "serial")]
pub use self::serial::{SerialPortProvider, SerialTransport};

#[cfg(feature = "serial")]
mod serial {
    use std::io::{self, Read, Write};
    use std::time::{Duration, Instant};

    use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};
    use tracing::debug;

    use super::{PortProvider, Transport};

    /// Transport over an RS-232 port (8N1, no flow control)
    pub struct SerialTransport {
        port: Box<dyn SerialPort>,
        timeout: Duration,
    }

    impl std::fmt::Debug for SerialTransport {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("SerialTransport")
                .field("port", &self.port.name())
                .field("timeout", &self.timeout)
                .finish()
        }
    }

    impl SerialTransport {
        /// Open `path` at `baud_rate`; `timeout` bounds each answer
        pub fn open(path: &str, baud_rate: u32, timeout: Duration) -> io::Result<Self> {
            let port = serialport::new(path, baud_rate)
                .data_bits(DataBits::Eight)
                .parity(Parity::None)
                .stop_bits(StopBits::One)
                .flow_control(FlowControl::None)
                .timeout(timeout)
                .open()?;

            debug!("Serial port '{}' opened at {} baud", path, baud_rate);
            Ok(Self { port, timeout })
        }
    }

    impl Transport for SerialTransport {
        fn send_command(&mut self, command: &str, terminator: &str) -> io::Result<()> {
            self.port.write_all(command.as_bytes())?;
            self.port.write_all(terminator.as_bytes())?;
            self.port.flush()
        }

        fn read_answer(&mut self, terminator: &str, max_len: usize) -> io::Result<String> {
            let deadline = Instant::now() + self.timeout;
            let terminator = terminator.as_bytes();
            let mut answer = Vec::with_capacity(32);
            let mut byte = [0u8; 1];

            while Instant::now() < deadline {
                match self.port.read(&mut byte) {
                    Ok(1) => {
                        answer.push(byte[0]);
                        if answer.ends_with(terminator) {
                            answer.truncate(answer.len() - terminator.len());
                            return String::from_utf8(answer)
                                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e));
                        }
                        if answer.len() > max_len {
                            return Err(io::Error::new(
                                io::ErrorKind::InvalidData,
                                "answer exceeds receive buffer",
                            ));
                        }
                    }
                    Ok(_) => {}
                    Err(e) if e.kind() == io::ErrorKind::TimedOut => break,
                    Err(e) => return Err(e),
                }
            }

            Err(io::Error::new(io::ErrorKind::TimedOut, "no answer from stand"))
        }

        fn read_pending(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let available = self.port.bytes_to_read()? as usize;
            if available == 0 {
                return Ok(0);
            }
            let n = available.min(buf.len());
            self.port.read(&mut buf[..n])
        }
    }

    /// Opens [`SerialTransport`]s with fixed line settings
    #[derive(Debug, Clone)]
    pub struct SerialPortProvider {
        baud_rate: u32,
        timeout: Duration,
    }

    impl SerialPortProvider {
        /// Create a provider for the given baud rate and answer timeout
        pub fn new(baud_rate: u32, timeout: Duration) -> Self {
            Self { baud_rate, timeout }
        }

        /// Create a provider from the serial section of the configuration
        pub fn from_config(config: &scopeflow_core::config::SerialConfig) -> Self {
            Self::new(config.baud_rate, config.timeout())
        }
    }

    impl PortProvider for SerialPortProvider {
        fn open(&self, port: &str) -> io::Result<Box<dyn Transport>> {
            Ok(Box::new(SerialTransport::open(port, self.baud_rate, self.timeout)?))
        }
    }
}
