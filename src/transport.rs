use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::debug;

/// Longest line accepted from the server, terminator included.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("Timed out connecting to {addr} after {timeout:?}")]
    ConnectTimeout { addr: String, timeout: Duration },
    #[error("Timed out during {op} after {timeout:?}")]
    Timeout { op: &'static str, timeout: Duration },
    #[error("Connection closed by peer")]
    Eof,
    #[error("Line exceeds {0} bytes")]
    LineTooLong(usize),
    #[error("Connection already closed")]
    Closed,
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl TransportError {
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            TransportError::ConnectTimeout { .. } | TransportError::Timeout { .. }
        )
    }

    pub fn is_eof(&self) -> bool {
        matches!(self, TransportError::Eof)
    }
}

/// One line-delimited byte stream with per-operation deadlines.
///
/// Every send and read gets its own `io_timeout` measured from the moment
/// the operation starts. Dropping the connection releases the socket, so
/// every exit path of the owner closes it.
pub struct Connection<S> {
    stream: Option<BufReader<S>>,
    peer: String,
    io_timeout: Duration,
}

impl Connection<TcpStream> {
    /// Open a TCP connection, giving up after `connect_timeout`.
    pub async fn open(
        addr: &str,
        connect_timeout: Duration,
        io_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::ConnectTimeout {
                addr: addr.to_string(),
                timeout: connect_timeout,
            })?
            .map_err(|source| TransportError::Connect {
                addr: addr.to_string(),
                source,
            })?;

        stream.set_nodelay(true)?;
        debug!("Connected to {}", addr);

        Ok(Self::from_stream(stream, addr, io_timeout))
    }
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn from_stream(stream: S, peer: impl Into<String>, io_timeout: Duration) -> Self {
        Self {
            stream: Some(BufReader::new(stream)),
            peer: peer.into(),
            io_timeout,
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    /// Write `line` followed by a newline terminator.
    pub async fn send_line(&mut self, line: &str) -> Result<(), TransportError> {
        let io_timeout = self.io_timeout;
        let stream = self.stream.as_mut().ok_or(TransportError::Closed)?;

        let write = async {
            stream.write_all(line.as_bytes()).await?;
            stream.write_all(b"\n").await?;
            stream.flush().await
        };
        tokio::time::timeout(io_timeout, write)
            .await
            .map_err(|_| TransportError::Timeout {
                op: "write",
                timeout: io_timeout,
            })??;

        Ok(())
    }

    /// Read one line, terminator included.
    ///
    /// A stream that ends before the terminator is reported as EOF, even
    /// when a partial line was received.
    pub async fn read_line(&mut self) -> Result<String, TransportError> {
        let io_timeout = self.io_timeout;
        let stream = self.stream.as_mut().ok_or(TransportError::Closed)?;

        let mut line = String::new();
        let mut limited = (&mut *stream).take(MAX_LINE_BYTES as u64);
        let n = tokio::time::timeout(io_timeout, limited.read_line(&mut line))
            .await
            .map_err(|_| TransportError::Timeout {
                op: "read",
                timeout: io_timeout,
            })??;

        if line.ends_with('\n') {
            return Ok(line);
        }
        if n >= MAX_LINE_BYTES {
            return Err(TransportError::LineTooLong(MAX_LINE_BYTES));
        }
        Err(TransportError::Eof)
    }

    /// Shut the stream down. Safe to call any number of times.
    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
            debug!("Closed connection to {}", self.peer);
        }
    }
}
