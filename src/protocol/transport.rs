use std::{
    io::{self, ErrorKind, Read, Write},
    net::TcpStream,
    time::Duration,
};

use log::trace;
use thiserror::Error;

use super::{
    BackendMessage, FrontendMessage,
    wire::{self, DecodeError, EncodeError, LENGTH_SIZE},
};

const READ_CHUNK: usize = 8192;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to decode message: {0}")]
    Decode(#[from] DecodeError),
    #[error("failed to encode message: {0}")]
    Encode(#[from] EncodeError),
    #[error("connection closed by peer")]
    Closed,
    #[error("write cancelled")]
    Cancelled,
    #[error("Transport IO Error: {0}")]
    Io(#[from] io::Error),
}

impl TransportError {
    /// True when a read gave up because of the stream's read timeout.
    pub fn is_timeout(&self) -> bool {
        match self {
            TransportError::Io(e) => is_timeout(e),
            _ => false,
        }
    }
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
}

/// A duplex byte stream that can hand out a second handle to itself.
///
/// One handle is read by the receiver while the other is written by the
/// driver of a story run.
pub trait Duplex: Read + Write + Send + Sized {
    fn try_split(&self) -> io::Result<Self>;

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;

    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;
}

impl Duplex for TcpStream {
    fn try_split(&self) -> io::Result<Self> {
        self.try_clone()
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_read_timeout(self, timeout)
    }

    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_write_timeout(self, timeout)
    }
}

#[cfg(unix)]
impl Duplex for std::os::unix::net::UnixStream {
    fn try_split(&self) -> io::Result<Self> {
        self.try_clone()
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        std::os::unix::net::UnixStream::set_read_timeout(self, timeout)
    }

    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        std::os::unix::net::UnixStream::set_write_timeout(self, timeout)
    }
}

/// Framed message reader/writer over a byte stream.
///
/// Bytes of an incomplete frame are kept between reads, so a read that
/// times out can simply be retried.
pub struct ProtocolTransport<T: Read + Write> {
    stream: T,
    pending: Vec<u8>,
}

impl<T: Read + Write> ProtocolTransport<T> {
    pub fn new(stream: T) -> Self {
        Self::with_pending(stream, Vec::new())
    }

    /// Resumes reading with bytes left over by an earlier transport.
    pub fn with_pending(stream: T, pending: Vec<u8>) -> Self {
        Self { stream, pending }
    }

    pub fn get_ref(&self) -> &T {
        &self.stream
    }

    /// Bytes read off the stream that do not yet form a whole frame.
    pub fn into_pending(self) -> Vec<u8> {
        self.pending
    }

    pub fn write_frontend(&mut self, msg: &FrontendMessage) -> Result<(), TransportError> {
        self.stream.write_all(&msg.encode()?)?;
        self.stream.flush()?;
        Ok(())
    }

    /// Writes a frontend message on a stream with a write timeout.
    ///
    /// Each time a write times out `proceed` is asked whether to keep going; the
    /// write resumes where it stopped, or fails with [`TransportError::Cancelled`].
    pub fn write_frontend_while<F>(
        &mut self,
        msg: &FrontendMessage,
        mut proceed: F,
    ) -> Result<(), TransportError>
    where
        F: FnMut() -> bool,
    {
        let buf = msg.encode()?;
        let mut written = 0;
        while written < buf.len() {
            match self.stream.write(&buf[written..]) {
                Ok(0) => return Err(io::Error::from(ErrorKind::WriteZero).into()),
                Ok(n) => written += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) if is_timeout(&e) => {
                    if !proceed() {
                        return Err(TransportError::Cancelled);
                    }
                    trace!("write stalled, {written} of {} bytes sent", buf.len());
                }
                Err(e) => return Err(e.into()),
            }
        }
        self.stream.flush()?;
        Ok(())
    }

    pub fn write_backend(&mut self, msg: &BackendMessage) -> Result<(), TransportError> {
        self.stream.write_all(&msg.encode()?)?;
        self.stream.flush()?;
        Ok(())
    }

    pub fn read_backend(&mut self) -> Result<BackendMessage, TransportError> {
        let (tag, body) = self.read_frame()?;
        Ok(BackendMessage::decode(tag, &body)?)
    }

    pub fn read_frontend(&mut self) -> Result<FrontendMessage, TransportError> {
        let (tag, body) = self.read_frame()?;
        Ok(FrontendMessage::decode(tag, &body)?)
    }

    /// Reads the untagged startup message that opens a connection.
    pub fn read_startup(&mut self) -> Result<FrontendMessage, TransportError> {
        loop {
            if self.pending.len() >= LENGTH_SIZE {
                let len = wire::body_len(read_i32(&self.pending))?;
                if self.pending.len() >= LENGTH_SIZE + len {
                    let frame: Vec<u8> = self.pending.drain(..LENGTH_SIZE + len).collect();
                    return Ok(FrontendMessage::decode_startup(&frame[LENGTH_SIZE..])?);
                }
            }
            self.fill()?;
        }
    }

    fn read_frame(&mut self) -> Result<(u8, Vec<u8>), TransportError> {
        loop {
            if let Some(frame) = self.take_frame()? {
                return Ok(frame);
            }
            self.fill()?;
        }
    }

    /// Splits one complete frame off the pending bytes, if there is one.
    fn take_frame(&mut self) -> Result<Option<(u8, Vec<u8>)>, TransportError> {
        if self.pending.len() < 1 + LENGTH_SIZE {
            return Ok(None);
        }
        let len = wire::body_len(read_i32(&self.pending[1..]))?;
        if self.pending.len() < 1 + LENGTH_SIZE + len {
            return Ok(None);
        }
        let tag = self.pending[0];
        let body = self.pending[1 + LENGTH_SIZE..1 + LENGTH_SIZE + len].to_vec();
        self.pending.drain(..1 + LENGTH_SIZE + len);
        Ok(Some((tag, body)))
    }

    fn fill(&mut self) -> Result<(), TransportError> {
        let mut chunk = [0; READ_CHUNK];
        let n = self.stream.read(&mut chunk)?;
        if n == 0 {
            return Err(TransportError::Closed);
        }
        trace!("read {n} bytes, {} pending", self.pending.len() + n);
        self.pending.extend_from_slice(&chunk[..n]);
        Ok(())
    }
}

fn read_i32(bytes: &[u8]) -> i32 {
    i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}
