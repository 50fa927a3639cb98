use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use log::debug;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::time::{sleep_until, timeout_at, Instant};
use tokio_serial::{ClearBuffer, SerialPort, SerialStream};

use crate::protocol::CommandFrame;

/// Minimum spacing between two commands the pump will accept.
pub const MIN_COMMAND_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("transport already closed")]
    Closed,
}

/// Byte-level access to one pump connection.
#[async_trait]
pub trait Link: Send {
    /// Drops anything pending in the input and output buffers.
    async fn clear(&mut self) -> Result<()>;
    async fn send(&mut self, data: &[u8]) -> Result<()>;
    /// Reads up to and including `\n`. Returns what arrived before the line
    /// timeout, possibly nothing.
    async fn read_line(&mut self) -> Result<Vec<u8>>;
}

pub struct SerialLink {
    stream: SerialStream,
    timeout: Duration,
}

impl SerialLink {
    pub fn new(stream: SerialStream, timeout: Duration) -> Self {
        Self { stream, timeout }
    }
}

#[async_trait]
impl Link for SerialLink {
    async fn clear(&mut self) -> Result<()> {
        self.stream.clear(ClearBuffer::All)?;
        Ok(())
    }

    async fn send(&mut self, data: &[u8]) -> Result<()> {
        self.stream.write_all(data).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn read_line(&mut self) -> Result<Vec<u8>> {
        let deadline = Instant::now() + self.timeout;
        let mut line = Vec::new();
        let mut byte = [0u8; 1];

        loop {
            match timeout_at(deadline, self.stream.read(&mut byte)).await {
                Ok(Ok(0)) => break,
                Ok(Ok(_)) => {
                    line.push(byte[0]);
                    if byte[0] == b'\n' {
                        break;
                    }
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => {
                    debug!("read_line timeout after {} bytes", line.len());
                    break;
                }
            }
        }
        Ok(line)
    }
}

struct Connection {
    link: Option<Box<dyn Link>>,
    /// When the previous exchange finished.
    last: Option<Instant>,
}

/// One pump connection. Exchanges are serialized and spaced at least
/// `min_interval` apart, measured from the end of one exchange to the next
/// write.
pub struct Transport {
    conn: Mutex<Connection>,
    min_interval: Duration,
}

impl Transport {
    pub fn new(link: Box<dyn Link>, min_interval: Duration) -> Self {
        Self {
            conn: Mutex::new(Connection {
                link: Some(link),
                last: None,
            }),
            min_interval,
        }
    }

    /// Writes `frame` and reads one reply line. Never retries.
    pub async fn exchange(&self, frame: &CommandFrame) -> Result<Vec<u8>> {
        let mut conn = self.conn.lock().await;
        if conn.link.is_none() {
            return Err(TransportError::Closed.into());
        }

        // spacing is measured under the lock
        if let Some(last) = conn.last {
            sleep_until(last + self.min_interval).await;
        }

        let result = match conn.link.as_mut() {
            Some(link) => Self::exchange_on(&mut **link, frame).await,
            None => Err(TransportError::Closed.into()),
        };
        conn.last = Some(Instant::now());
        result
    }

    async fn exchange_on(link: &mut dyn Link, frame: &CommandFrame) -> Result<Vec<u8>> {
        link.clear().await?;
        debug!("send {:02X?}", frame.as_bytes());
        link.send(frame.as_bytes()).await?;
        let reply = link.read_line().await?;
        debug!("recv {:02X?}", reply);
        Ok(reply)
    }

    /// Releases the link. Returns `false` if it was already closed.
    pub async fn close(&self) -> bool {
        self.conn.lock().await.link.take().is_some()
    }

    pub async fn is_open(&self) -> bool {
        self.conn.lock().await.link.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockBus;
    use crate::protocol::{self, encode_reply};

    #[tokio::test(start_paused = true)]
    async fn exchange_writes_frame_and_returns_line() {
        let bus = MockBus::shared();
        bus.lock().unwrap().replies.push_back(encode_reply(b'`', "0.0"));
        let transport = Transport::new(MockBus::link(&bus), MIN_COMMAND_INTERVAL);

        let raw = transport
            .exchange(&protocol::query_position(1))
            .await
            .unwrap();

        assert_eq!(raw, encode_reply(b'`', "0.0"));
        let bus = bus.lock().unwrap();
        assert_eq!(bus.sent, vec![b"/1?18\r".to_vec()]);
        assert_eq!(bus.clears, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_pump_yields_empty_reply() {
        let bus = MockBus::shared();
        let transport = Transport::new(MockBus::link(&bus), MIN_COMMAND_INTERVAL);

        let raw = transport.exchange(&protocol::query_busy(1)).await.unwrap();
        assert!(raw.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn exchanges_are_spaced_by_min_interval() {
        let bus = MockBus::shared();
        let transport = Transport::new(MockBus::link(&bus), MIN_COMMAND_INTERVAL);

        for _ in 0..3 {
            transport.exchange(&protocol::query_busy(1)).await.unwrap();
        }

        let bus = bus.lock().unwrap();
        assert_eq!(bus.sent_at.len(), 3);
        for pair in bus.sent_at.windows(2) {
            assert!(pair[1] - pair[0] >= MIN_COMMAND_INTERVAL);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn first_exchange_is_not_delayed() {
        let bus = MockBus::shared();
        let transport = Transport::new(MockBus::link(&bus), MIN_COMMAND_INTERVAL);

        let started = Instant::now();
        transport.exchange(&protocol::query_busy(1)).await.unwrap();
        assert_eq!(bus.lock().unwrap().sent_at, vec![started]);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_do_not_interleave() {
        let bus = MockBus::shared();
        let transport = std::sync::Arc::new(Transport::new(
            MockBus::link(&bus),
            MIN_COMMAND_INTERVAL,
        ));

        let tasks: Vec<_> = (0..3)
            .map(|_| {
                let transport = transport.clone();
                tokio::spawn(async move { transport.exchange(&protocol::query_busy(1)).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let bus = bus.lock().unwrap();
        assert_eq!(bus.sent.len(), 3);
        assert_eq!(bus.max_in_flight, 1);
        for pair in bus.sent_at.windows(2) {
            assert!(pair[1] - pair[0] >= MIN_COMMAND_INTERVAL);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn close_is_idempotent() {
        let bus = MockBus::shared();
        let transport = Transport::new(MockBus::link(&bus), MIN_COMMAND_INTERVAL);

        assert!(transport.close().await);
        assert!(!transport.close().await);
        assert!(!transport.is_open().await);
        assert!(bus.lock().unwrap().dropped);
        assert!(transport
            .exchange(&protocol::query_busy(1))
            .await
            .is_err());
    }
}
