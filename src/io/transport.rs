//! Transport layer
//!
//! Raw bidirectional byte exchange with the server. Knows nothing about
//! message framing, text encoding or the process behind the pipes.

use async_trait::async_trait;
use std::io;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, ChildStdout};
use tokio::sync::mpsc;
use tracing::{error, trace};

/// Size of the read buffer for stdout reads
const READ_BUFFER_SIZE: usize = 4096;

/// Bidirectional byte exchange
///
/// `receive` yields whatever chunk arrived next; chunk boundaries carry no
/// meaning and may split a message or a UTF-8 sequence.
#[async_trait]
pub trait Transport: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    async fn send(&mut self, data: &[u8]) -> Result<(), Self::Error>;

    async fn receive(&mut self) -> Result<Vec<u8>, Self::Error>;

    async fn close(&mut self) -> Result<(), Self::Error>;

    fn is_connected(&self) -> bool;
}

// ============================================================================
// Stdio Transport
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum StdioTransportError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Transport is disconnected")]
    Disconnected,

    #[error("Channel error: {0}")]
    Channel(String),
}

/// Transport over a child's stdin/stdout, pumped by two background tasks
///
/// Closing drops the stdin channel; the writer task flushes what is already
/// queued before it closes the pipe.
#[derive(Debug)]
pub struct StdioTransport {
    stdin_sender: Option<mpsc::UnboundedSender<Vec<u8>>>,
    stdout_receiver: Option<mpsc::UnboundedReceiver<Vec<u8>>>,
    connected: bool,
}

impl StdioTransport {
    pub fn new(stdin: ChildStdin, stdout: ChildStdout) -> Self {
        let (stdin_sender, stdin_receiver) = mpsc::unbounded_channel();
        let (stdout_sender, stdout_receiver) = mpsc::unbounded_channel();

        tokio::spawn(Self::stdin_writer_task(stdin, stdin_receiver));
        tokio::spawn(Self::stdout_reader_task(stdout, stdout_sender));

        Self {
            stdin_sender: Some(stdin_sender),
            stdout_receiver: Some(stdout_receiver),
            connected: true,
        }
    }

    async fn stdin_writer_task(
        mut stdin: ChildStdin,
        mut receiver: mpsc::UnboundedReceiver<Vec<u8>>,
    ) {
        while let Some(data) = receiver.recv().await {
            trace!("StdioTransport: writing {} bytes", data.len());

            if let Err(e) = stdin.write_all(&data).await {
                error!("Failed to write to server stdin: {}", e);
                break;
            }
            if let Err(e) = stdin.flush().await {
                error!("Failed to flush server stdin: {}", e);
                break;
            }
        }

        trace!("StdioTransport: stdin writer finished");
    }

    async fn stdout_reader_task(stdout: ChildStdout, sender: mpsc::UnboundedSender<Vec<u8>>) {
        let mut reader = BufReader::new(stdout);
        let mut buffer = vec![0u8; READ_BUFFER_SIZE];

        loop {
            match reader.read(&mut buffer).await {
                Ok(0) => break,
                Ok(n) => {
                    if sender.send(buffer[..n].to_vec()).is_err() {
                        trace!("StdioTransport: receiver dropped, stopping reader");
                        return;
                    }
                }
                Err(e) => {
                    error!("Failed to read from server stdout: {}", e);
                    break;
                }
            }
        }

        trace!("StdioTransport: stdout reader finished");
    }
}

#[async_trait]
impl Transport for StdioTransport {
    type Error = StdioTransportError;

    async fn send(&mut self, data: &[u8]) -> Result<(), Self::Error> {
        if !self.connected {
            return Err(StdioTransportError::Disconnected);
        }

        self.stdin_sender
            .as_ref()
            .ok_or(StdioTransportError::Disconnected)?
            .send(data.to_vec())
            .map_err(|e| StdioTransportError::Channel(e.to_string()))
    }

    async fn receive(&mut self) -> Result<Vec<u8>, Self::Error> {
        if !self.connected {
            return Err(StdioTransportError::Disconnected);
        }

        self.stdout_receiver
            .as_mut()
            .ok_or(StdioTransportError::Disconnected)?
            .recv()
            .await
            .ok_or(StdioTransportError::Disconnected)
    }

    async fn close(&mut self) -> Result<(), Self::Error> {
        self.connected = false;
        self.stdin_sender.take();
        self.stdout_receiver.take();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

// ============================================================================
// Mock Transport
// ============================================================================

#[cfg(test)]
pub use mock::{MockTransport, MockTransportError};
