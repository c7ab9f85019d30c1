//! Self-healing serial link
//!
//! [`SerialLink`] owns one open connection, produced by a [`Connector`].
//! Any I/O failure closes the connection, reopens it (retrying forever),
//! and retries the failed operation once. Only a failure of that retry
//! reaches the caller, as a [`LinkError`].

use std::io;
use std::time::Duration;

use serialport::{ClearBuffer, SerialPort};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, info, warn};

use crate::config::LinkConfig;
use crate::error::LinkError;

/// A byte stream onto a PAM console
pub trait PamPort: AsyncRead + AsyncWrite + Unpin + Send {
    /// Discard anything waiting in the receive buffer
    fn clear_input(&mut self) -> io::Result<()>;

    /// Number of bytes waiting in the receive buffer
    fn bytes_to_read(&mut self) -> io::Result<u32>;
}

impl PamPort for SerialStream {
    fn clear_input(&mut self) -> io::Result<()> {
        <SerialStream as SerialPort>::clear(self, ClearBuffer::Input).map_err(io::Error::from)
    }

    fn bytes_to_read(&mut self) -> io::Result<u32> {
        <SerialStream as SerialPort>::bytes_to_read(self).map_err(io::Error::from)
    }
}

/// Opens connections for a [`SerialLink`]
pub trait Connector: Send + Sync {
    /// Open a fresh connection
    fn open(&self) -> io::Result<Box<dyn PamPort>>;

    /// Human-readable endpoint (port path or simulator id)
    fn endpoint(&self) -> String;
}

/// Connects to a physical serial port
#[derive(Debug, Clone)]
pub struct SerialConnector {
    port: String,
    baud_rate: u32,
    timeout: Duration,
}

impl SerialConnector {
    pub fn new(port: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port: port.into(),
            baud_rate,
            timeout: Duration::from_millis(150),
        }
    }

    pub fn from_config(config: &LinkConfig) -> Self {
        Self {
            port: config.port.clone(),
            baud_rate: config.baud_rate,
            timeout: config.timeout(),
        }
    }
}

impl Connector for SerialConnector {
    fn open(&self) -> io::Result<Box<dyn PamPort>> {
        let stream = tokio_serial::new(&self.port, self.baud_rate)
            .timeout(self.timeout)
            .open_native_async()
            .map_err(io::Error::from)?;
        Ok(Box::new(stream))
    }

    fn endpoint(&self) -> String {
        format!("{} @ {}", self.port, self.baud_rate)
    }
}

enum Op<'a> {
    Write(&'a [u8]),
    Read { max: usize, wait: Duration },
    ReadAvailable { wait: Duration },
    ResetInput,
    Flush,
}

impl Op<'_> {
    fn name(&self) -> &'static str {
        match self {
            Op::Write(_) => "write",
            Op::Read { .. } => "read",
            Op::ReadAvailable { .. } => "read_available",
            Op::ResetInput => "reset_input_buffer",
            Op::Flush => "flush",
        }
    }

    async fn run(&self, port: &mut Box<dyn PamPort>) -> io::Result<Vec<u8>> {
        match self {
            Op::Write(data) => {
                port.write_all(data).await?;
                Ok(Vec::new())
            }
            Op::Read { max, wait } => read_within(port, *max, *wait).await,
            Op::ReadAvailable { wait } => {
                let waiting = port.bytes_to_read()? as usize;
                read_within(port, waiting.max(1), *wait).await
            }
            Op::ResetInput => {
                port.clear_input()?;
                Ok(Vec::new())
            }
            Op::Flush => {
                port.flush().await?;
                Ok(Vec::new())
            }
        }
    }
}

/// Read up to `max` bytes, returning whatever arrived when `wait` expires
async fn read_within(port: &mut Box<dyn PamPort>, max: usize, wait: Duration) -> io::Result<Vec<u8>> {
    let mut buf = vec![0u8; max];
    match timeout(wait, port.read(&mut buf)).await {
        Ok(Ok(n)) => {
            buf.truncate(n);
            Ok(buf)
        }
        Ok(Err(e)) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) => {
            Ok(Vec::new())
        }
        Ok(Err(e)) => Err(e),
        Err(_) => Ok(Vec::new()),
    }
}

/// Serial connection that reconnects on failure
pub struct SerialLink {
    name: String,
    connector: Box<dyn Connector>,
    config: LinkConfig,
    port: Mutex<Option<Box<dyn PamPort>>>,
}

impl std::fmt::Debug for SerialLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialLink")
            .field("name", &self.name)
            .field("endpoint", &self.connector.endpoint())
            .finish()
    }
}

impl SerialLink {
    /// Open the link, retrying until the endpoint is available
    pub async fn connect(
        name: impl Into<String>,
        connector: Box<dyn Connector>,
        config: LinkConfig,
    ) -> Self {
        let link = Self {
            name: name.into(),
            connector,
            config,
            port: Mutex::new(None),
        };
        let port = link.open_with_retry().await;
        *link.port.lock().await = Some(port);
        link
    }

    /// Link name used in log messages
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Endpoint description from the connector
    pub fn endpoint(&self) -> String {
        self.connector.endpoint()
    }

    pub async fn write(&self, data: &[u8]) -> Result<(), LinkError> {
        self.execute(Op::Write(data)).await.map(|_| ())
    }

    /// Read up to `max` bytes within the configured timeout
    pub async fn read(&self, max: usize) -> Result<Vec<u8>, LinkError> {
        self.read_for(max, self.config.timeout()).await
    }

    /// Read up to `max` bytes, waiting at most `wait` for the first byte
    pub async fn read_for(&self, max: usize, wait: Duration) -> Result<Vec<u8>, LinkError> {
        self.execute(Op::Read { max, wait }).await
    }

    /// Read everything currently buffered (or one byte within the timeout)
    pub async fn read_available(&self) -> Result<Vec<u8>, LinkError> {
        self.execute(Op::ReadAvailable {
            wait: self.config.timeout(),
        })
        .await
    }

    pub async fn reset_input_buffer(&self) -> Result<(), LinkError> {
        self.execute(Op::ResetInput).await.map(|_| ())
    }

    pub async fn flush(&self) -> Result<(), LinkError> {
        self.execute(Op::Flush).await.map(|_| ())
    }

    /// Bytes waiting in the receive buffer; 0 on error or when disconnected
    pub async fn bytes_available(&self) -> usize {
        match self.port.lock().await.as_mut() {
            Some(port) => port.bytes_to_read().map(|n| n as usize).unwrap_or(0),
            None => 0,
        }
    }

    async fn execute(&self, op: Op<'_>) -> Result<Vec<u8>, LinkError> {
        let mut slot = self.port.lock().await;

        let port = self.ensure_open(&mut slot).await;
        let err = match op.run(port).await {
            Ok(out) => return Ok(out),
            Err(e) => e,
        };

        warn!("{} {} error: {}; reconnecting", self.name, op.name(), err);
        slot.take();
        let port = self.ensure_open(&mut slot).await;
        let retry = op.run(port).await;
        if retry.is_err() {
            slot.take();
        }
        retry.map_err(|source| LinkError::Transport {
            endpoint: self.connector.endpoint(),
            operation: op.name(),
            source,
        })
    }

    async fn ensure_open<'s>(
        &self,
        slot: &'s mut Option<Box<dyn PamPort>>,
    ) -> &'s mut Box<dyn PamPort> {
        let port = match slot.take() {
            Some(port) => port,
            None => self.open_with_retry().await,
        };
        slot.insert(port)
    }

    async fn open_with_retry(&self) -> Box<dyn PamPort> {
        let endpoint = self.connector.endpoint();
        let log_every = u64::from(self.config.log_every.max(1));
        let mut attempt: u64 = 0;

        loop {
            attempt += 1;
            match self.connector.open() {
                Ok(port) => {
                    sleep(self.config.open_settle()).await;
                    if attempt > 1 {
                        info!(
                            "{} reconnected to {} after {} attempts",
                            self.name, endpoint, attempt
                        );
                    } else {
                        info!("{} connected to {}", self.name, endpoint);
                    }
                    return port;
                }
                Err(e) => {
                    if attempt == 1 || attempt % log_every == 0 {
                        warn!(
                            "{} cannot open {} (attempt {}): {}",
                            self.name, endpoint, attempt, e
                        );
                    } else {
                        debug!("{} open attempt {} failed: {}", self.name, attempt, e);
                    }
                    sleep(self.config.reconnect_delay()).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimConnector;
    use pam_sim::{SharedPam, VirtualPam};

    async fn sim_link(pam: &SharedPam) -> SerialLink {
        SerialLink::connect(
            "test",
            Box::new(SimConnector::new(pam.clone())),
            LinkConfig::default(),
        )
        .await
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_then_read() {
        let pam = VirtualPam::new("link").shared();
        let link = sim_link(&pam).await;

        link.write(b"FUNCTION\r\n").await.unwrap();
        assert_eq!(link.bytes_available().await, 6);
        let reply = link.read_available().await.unwrap();
        assert_eq!(reply, b"195\r\n>".to_vec());
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_times_out_empty() {
        let pam = VirtualPam::new("link").shared();
        let link = sim_link(&pam).await;

        let reply = link.read(16).await.unwrap();
        assert!(reply.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_input_buffer() {
        let pam = VirtualPam::new("link").shared();
        let link = sim_link(&pam).await;

        link.write(b"FUNCTION\r\n").await.unwrap();
        link.reset_input_buffer().await.unwrap();
        assert_eq!(link.bytes_available().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_retries_until_available() {
        let pam = VirtualPam::new("link").shared();
        pam.lock().unwrap().fail_next_opens(3);

        let link = sim_link(&pam).await;
        assert_eq!(pam.lock().unwrap().opens(), 1);
        link.write(b"SAVE\r\n").await.unwrap();
        assert_eq!(pam.lock().unwrap().count_received("SAVE"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fault_reconnects_and_retries_once() {
        let pam = VirtualPam::new("link").shared();
        let link = sim_link(&pam).await;

        pam.lock().unwrap().fail_next_io(1);
        link.write(b"SAVE\r\n").await.unwrap();

        let pam = pam.lock().unwrap();
        assert_eq!(pam.opens(), 2);
        assert_eq!(pam.count_received("SAVE"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_failure_reaches_caller() {
        let pam = VirtualPam::new("link").shared();
        let link = sim_link(&pam).await;

        pam.lock().unwrap().fail_next_io(2);
        let err = link.write(b"SAVE\r\n").await.unwrap_err();
        assert!(matches!(
            err,
            LinkError::Transport {
                operation: "write",
                ..
            }
        ));

        // Handle was dropped; the next operation reconnects.
        link.write(b"SAVE\r\n").await.unwrap();
        assert_eq!(pam.lock().unwrap().opens(), 3);
    }
}
