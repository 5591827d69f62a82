//! Line-oriented session over a channel byte stream
//!
//! Application code talks to a connected client through [`LineSession`]:
//! plain, formatted and newline-terminated writes, plus one-line-per-call
//! reads.

use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;

use thiserror::Error;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf,
};

/// Any duplex byte stream a session can run over
pub trait DuplexStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> DuplexStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

type BoxedStream = Box<dyn DuplexStream>;

/// Who is on the other end of a session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionContext {
    /// Name the client authenticated as
    pub user: String,
    /// Remote address, when the transport knows it
    pub peer: Option<SocketAddr>,
}

/// Failure of [`LineSession::read_line`]
///
/// Carries whatever bytes were read before the stream ended or failed, so a
/// caller never silently loses input.
#[derive(Debug, Error)]
pub enum ReadLineError {
    #[error("stream closed before end of line ({} bytes pending)", partial.len())]
    Eof { partial: String },
    #[error("channel read failed: {source}")]
    Io {
        partial: String,
        #[source]
        source: io::Error,
    },
}

impl ReadLineError {
    /// Bytes accumulated before the failure
    pub fn partial(&self) -> &str {
        match self {
            Self::Eof { partial } | Self::Io { partial, .. } => partial,
        }
    }

    pub fn is_eof(&self) -> bool {
        matches!(self, Self::Eof { .. })
    }
}

/// Line-buffered reader/writer over one channel
pub struct LineSession {
    reader: BufReader<ReadHalf<BoxedStream>>,
    writer: WriteHalf<BoxedStream>,
    /// Bytes of the line currently being assembled
    line: Vec<u8>,
    context: SessionContext,
}

impl LineSession {
    pub fn new<S>(stream: S) -> Self
    where
        S: DuplexStream + 'static,
    {
        Self::with_context(stream, SessionContext::default())
    }

    pub fn with_context<S>(stream: S, context: SessionContext) -> Self
    where
        S: DuplexStream + 'static,
    {
        let boxed: BoxedStream = Box::new(stream);
        let (read_half, writer) = tokio::io::split(boxed);
        Self {
            reader: BufReader::new(read_half),
            writer,
            line: Vec::with_capacity(128),
            context,
        }
    }

    /// Authenticated user name
    pub fn user(&self) -> &str {
        &self.context.user
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.context.peer
    }

    /// Write the display form of `value`
    pub fn write(
        &mut self,
        value: impl fmt::Display,
    ) -> impl Future<Output = io::Result<()>> + Send + '_ {
        let text = value.to_string();
        self.send(text.into_bytes())
    }

    /// Write the display form of `value` followed by `\n`
    pub fn write_line(
        &mut self,
        value: impl fmt::Display,
    ) -> impl Future<Output = io::Result<()>> + Send + '_ {
        let mut text = value.to_string();
        text.push('\n');
        self.send(text.into_bytes())
    }

    /// Write pre-built format arguments
    ///
    /// Formatting happens before the returned future is created, so bind the
    /// future first when the caller must stay `Send`:
    ///
    /// ```ignore
    /// let pending = session.write_formatted(format_args!("{} items\r\n", count));
    /// pending.await?;
    /// ```
    pub fn write_formatted(
        &mut self,
        args: fmt::Arguments<'_>,
    ) -> impl Future<Output = io::Result<()>> + Send + '_ {
        let text = fmt::format(args);
        self.send(text.into_bytes())
    }

    /// Write bytes as-is
    pub fn write_raw(
        &mut self,
        bytes: &[u8],
    ) -> impl Future<Output = io::Result<()>> + Send + '_ {
        self.send(bytes.to_vec())
    }

    async fn send(&mut self, bytes: Vec<u8>) -> io::Result<()> {
        self.writer.write_all(&bytes).await?;
        self.writer.flush().await
    }

    /// Read one `\n`-terminated line
    ///
    /// On success the newline is dropped and surrounding whitespace trimmed.
    /// Bytes after the newline stay buffered for the next call.
    pub async fn read_line(&mut self) -> Result<String, ReadLineError> {
        self.line.clear();
        let result = self.reader.read_until(b'\n', &mut self.line).await;
        let text = String::from_utf8_lossy(&self.line).into_owned();

        match result {
            Ok(_) if self.line.last() == Some(&b'\n') => Ok(text.trim().to_string()),
            Ok(_) => Err(ReadLineError::Eof { partial: text }),
            Err(source) => Err(ReadLineError::Io {
                partial: text,
                source,
            }),
        }
    }

    /// Flush pending output and signal end of stream to the peer
    pub async fn close(mut self) -> io::Result<()> {
        self.writer.flush().await?;
        self.writer.shutdown().await
    }
}

impl fmt::Debug for LineSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LineSession")
            .field("context", &self.context)
            .field("pending", &self.line.len())
            .finish_non_exhaustive()
    }
}
