//! LSP base-protocol framing
//!
//! Wraps a raw byte transport and speaks `Content-Length: <n>\r\n\r\n<body>`.
//! The length counts bytes, so bodies are cut from the byte stream before any
//! text decoding happens.

use crate::io::transport::Transport;
use std::collections::VecDeque;
use tracing::{trace, warn};

#[derive(Debug, thiserror::Error)]
pub enum LspFramingError<T: std::error::Error + Send + Sync + 'static> {
    #[error("Transport error: {0}")]
    Transport(T),

    #[error("Invalid LSP message format: {0}")]
    InvalidFormat(String),

    #[error("Invalid content length: {0}")]
    InvalidContentLength(String),

    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },
}

/// Upper bound on a single message body
const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

const HEADER_SEPARATOR: &[u8] = b"\r\n\r\n";

pub struct LspFraming<T: Transport> {
    transport: T,
    receive_buffer: Vec<u8>,
    message_queue: VecDeque<String>,
}

impl<T: Transport> LspFraming<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            receive_buffer: Vec::new(),
            message_queue: VecDeque::new(),
        }
    }

    #[cfg(test)]
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Encode a message body with its header
    pub fn frame(message: &str) -> String {
        format!("Content-Length: {}\r\n\r\n{}", message.len(), message)
    }

    pub async fn send(&mut self, message: &str) -> Result<(), LspFramingError<T::Error>> {
        self.transport
            .send(Self::frame(message).as_bytes())
            .await
            .map_err(LspFramingError::Transport)
    }

    /// Next complete message body
    ///
    /// Bytes that are not valid UTF-8 are replaced with U+FFFD; the frame
    /// boundaries are unaffected since they were found on the raw bytes.
    pub async fn receive(&mut self) -> Result<String, LspFramingError<T::Error>> {
        loop {
            if let Some(message) = self.message_queue.pop_front() {
                return Ok(message);
            }

            let data = self
                .transport
                .receive()
                .await
                .map_err(LspFramingError::Transport)?;
            self.receive_buffer.extend_from_slice(&data);

            while let Some(message) = self.try_parse_message()? {
                self.message_queue.push_back(message);
            }
        }
    }

    pub async fn close(&mut self) -> Result<(), LspFramingError<T::Error>> {
        self.transport
            .close()
            .await
            .map_err(LspFramingError::Transport)
    }

    /// Pop one complete message off the receive buffer, if there is one
    fn try_parse_message(&mut self) -> Result<Option<String>, LspFramingError<T::Error>> {
        let Some(header_end) = self
            .receive_buffer
            .windows(HEADER_SEPARATOR.len())
            .position(|window| window == HEADER_SEPARATOR)
        else {
            return Ok(None);
        };

        let header = String::from_utf8_lossy(&self.receive_buffer[..header_end]);
        let content_length = Self::parse_content_length(&header)?;
        let content_start = header_end + HEADER_SEPARATOR.len();
        let available = self.receive_buffer.len() - content_start;

        if available < content_length {
            trace!(
                "LspFraming: waiting for {} more bytes",
                content_length - available
            );
            return Ok(None);
        }

        let content_end = content_start + content_length;
        let body = &self.receive_buffer[content_start..content_end];
        let message = match std::str::from_utf8(body) {
            Ok(text) => text.to_string(),
            Err(e) => {
                warn!(
                    "LspFraming: invalid UTF-8 at byte {} of a {} byte message, replacing",
                    e.valid_up_to(),
                    content_length
                );
                String::from_utf8_lossy(body).into_owned()
            }
        };
        self.receive_buffer.drain(..content_end);

        Ok(Some(message))
    }

    /// Read Content-Length from the header block; other headers are ignored
    fn parse_content_length(header: &str) -> Result<usize, LspFramingError<T::Error>> {
        for line in header.lines() {
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };
            if !name.trim().eq_ignore_ascii_case("content-length") {
                continue;
            }

            let value = value.trim();
            let length = value
                .parse::<usize>()
                .map_err(|_| LspFramingError::InvalidContentLength(value.to_string()))?;
            if length > MAX_MESSAGE_SIZE {
                return Err(LspFramingError::MessageTooLarge {
                    size: length,
                    max: MAX_MESSAGE_SIZE,
                });
            }
            return Ok(length);
        }

        Err(LspFramingError::InvalidFormat(
            "Missing Content-Length header".to_string(),
        ))
    }
}
