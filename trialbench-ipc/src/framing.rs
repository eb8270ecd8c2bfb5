//! Line-Delimited Frame Encoding
//!
//! The controller/worker channel is line oriented. Protocol frames are single
//! lines starting with [`PROTOCOL_PREFIX`] followed by a JSON payload; any
//! other line a worker prints is a pass-through log line.

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use thiserror::Error;

/// Maximum line length (16 MB) to prevent memory exhaustion
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Marker opening every protocol frame
pub const PROTOCOL_PREFIX: &str = "@@trialbench ";

/// Errors that can occur during frame encoding/decoding
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Frame too large: more than {max} bytes")]
    FrameTooLarge { max: usize },

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("End of stream")]
    EndOfStream,
}

/// One line received from the peer.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame<T> {
    /// Decoded protocol message
    Message(T),
    /// Pass-through text
    Log(String),
}

/// Write a single line, rejecting embedded line breaks.
pub fn write_line<W: Write>(writer: &mut BufWriter<W>, line: &str) -> Result<(), FrameError> {
    if line.contains(['\n', '\r']) {
        return Err(FrameError::InvalidFrame(
            "line contains a line break".to_string(),
        ));
    }
    if line.len() > MAX_FRAME_SIZE {
        return Err(FrameError::FrameTooLarge {
            max: MAX_FRAME_SIZE,
        });
    }
    writer.write_all(line.as_bytes())?;
    writer.write_all(b"\n")?;
    writer.flush()?;
    Ok(())
}

/// Read one line without its terminator.
pub fn read_line<R: Read>(reader: &mut BufReader<R>) -> Result<String, FrameError> {
    let mut line = String::new();
    let read = reader
        .by_ref()
        .take(MAX_FRAME_SIZE as u64 + 1)
        .read_line(&mut line)?;
    if read == 0 {
        return Err(FrameError::EndOfStream);
    }
    if !line.ends_with('\n') {
        if read > MAX_FRAME_SIZE {
            return Err(FrameError::FrameTooLarge {
                max: MAX_FRAME_SIZE,
            });
        }
        // last line without terminator: peer closed mid-line
        return Err(FrameError::EndOfStream);
    }
    line.pop();
    if line.ends_with('\r') {
        line.pop();
    }
    Ok(line)
}

/// Frame writer wrapper for convenient message sending
pub struct FrameWriter<W: Write> {
    writer: BufWriter<W>,
}

impl<W: Write> FrameWriter<W> {
    /// Create a new frame writer
    pub fn new(writer: W) -> Self {
        Self {
            writer: BufWriter::with_capacity(64 * 1024, writer), // 64KB buffer
        }
    }

    /// Write a raw line (records, commands, log text)
    pub fn write_line(&mut self, line: &str) -> Result<(), FrameError> {
        write_line(&mut self.writer, line)
    }

    /// Write a protocol frame
    pub fn write<T: Serialize>(&mut self, message: &T) -> Result<(), FrameError> {
        let json =
            serde_json::to_string(message).map_err(|e| FrameError::Serialization(e.to_string()))?;
        write_line(&mut self.writer, &format!("{PROTOCOL_PREFIX}{json}"))
    }

    /// Flush the underlying writer
    pub fn flush(&mut self) -> Result<(), FrameError> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Frame reader wrapper for convenient message receiving
pub struct FrameReader<R: Read> {
    reader: BufReader<R>,
}

impl<R: Read> FrameReader<R> {
    /// Create a new frame reader
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::with_capacity(64 * 1024, reader), // 64KB buffer
        }
    }

    /// Read a raw line
    pub fn read_line(&mut self) -> Result<String, FrameError> {
        read_line(&mut self.reader)
    }

    /// Read a line and classify it as protocol frame or log text
    pub fn read<T: DeserializeOwned>(&mut self) -> Result<Frame<T>, FrameError> {
        let line = self.read_line()?;
        match line.strip_prefix(PROTOCOL_PREFIX) {
            Some(payload) => serde_json::from_str(payload)
                .map(Frame::Message)
                .map_err(|e| FrameError::Deserialization(e.to_string())),
            None => Ok(Frame::Log(line)),
        }
    }

    /// Check if the buffer has any data available
    pub fn has_buffered_data(&self) -> bool {
        !self.reader.buffer().is_empty()
    }

    /// Check if a complete line is already buffered, so the next read
    /// cannot block
    pub fn has_buffered_line(&self) -> bool {
        self.reader.buffer().contains(&b'\n')
    }
}
