//! Byte-stream socket with line reads, chunked writes and in-place TLS.

use super::stream::{BoxedIo, SmtpStream, TlsOptions, TlsVersion};
use crate::error::{Error, Result};
use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpStream, lookup_host};

/// Default number of bytes handed to the transport per write.
pub const DEFAULT_CHUNK_SIZE: usize = 2048;

/// Parameters of the current (or last) connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionState {
    /// Address as given to [`Socket::connect`], scheme prefix included.
    pub address: String,
    /// Remote port; 0 for Unix sockets and attached streams.
    pub port: u16,
    /// Whether reads wait for data.
    pub blocking: bool,
    /// Whether the owner keeps the connection across transactions.
    pub persistent: bool,
    /// Per-iteration read and write timeout.
    pub timeout: Option<Duration>,
    /// Write block size.
    pub chunk_size: usize,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            address: String::new(),
            port: 0,
            blocking: true,
            persistent: false,
            timeout: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

/// Transport socket.
///
/// Wraps a plaintext or TLS stream behind a read buffer. Every operation on
/// a socket that is not open fails with [`Error::NotConnected`].
#[derive(Debug, Default)]
pub struct Socket {
    reader: Option<BufReader<SmtpStream>>,
    state: ConnectionState,
    tls: TlsOptions,
    eof: bool,
    timed_out: bool,
}

impl Socket {
    /// Creates a closed socket.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a connection, closing any previous one first.
    ///
    /// `address` may be a host name, an IP literal, a Unix socket path
    /// (starting with `/`), or either of those behind an `ssl://` or
    /// `tls://` prefix to negotiate TLS right after connecting.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connection`] if resolution or connection fails,
    /// [`Error::Timeout`] if it does not finish in time, or a TLS error for
    /// implicit TLS connections.
    pub async fn connect(
        &mut self,
        address: &str,
        port: u16,
        persistent: bool,
        timeout: Option<Duration>,
        tls: Option<TlsOptions>,
    ) -> Result<()> {
        if self.is_connected() {
            tracing::debug!(address = %self.state.address, "Closing previous connection");
            if let Err(e) = self.disconnect().await {
                tracing::debug!(?e, "Closing previous connection failed");
            }
        }

        let (implicit_tls, host) = split_scheme(address);
        let io = open(host, port, timeout).await?;
        let mut stream = SmtpStream::Plain(io);
        self.tls = tls.unwrap_or_default();
        if implicit_tls {
            stream = within(timeout, stream.upgrade_to_tls(&self.tls, host, TlsVersion::Any))
                .await??;
        }

        tracing::info!(address, port, tls = implicit_tls, "Connected");
        self.install(
            stream,
            ConnectionState {
                address: address.to_string(),
                port,
                persistent,
                timeout,
                ..ConnectionState::default()
            },
        );
        Ok(())
    }

    /// Adopts an already-established plaintext stream.
    pub fn attach<S>(&mut self, io: S, address: &str, port: u16)
    where
        S: super::stream::Io + 'static,
    {
        self.install(
            SmtpStream::plain(io),
            ConnectionState {
                address: address.to_string(),
                port,
                ..ConnectionState::default()
            },
        );
    }

    fn install(&mut self, stream: SmtpStream, state: ConnectionState) {
        self.reader = Some(BufReader::new(stream));
        self.state = state;
        self.eof = false;
        self.timed_out = false;
    }

    /// Closes the connection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotConnected`] if the socket is not open.
    pub async fn disconnect(&mut self) -> Result<()> {
        let mut reader = self.reader.take().ok_or(Error::NotConnected)?;
        self.eof = true;
        match within(self.state.timeout, reader.get_mut().shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!(?e, "Shutdown failed"),
            Err(e) => tracing::debug!(?e, "Shutdown timed out"),
        }
        tracing::debug!(address = %self.state.address, "Disconnected");
        Ok(())
    }

    /// Switches reads between waiting (`true`) and returning only what is
    /// immediately available (`false`).
    pub const fn set_blocking(&mut self, blocking: bool) {
        self.state.blocking = blocking;
    }

    /// Sets the timeout applied to each read iteration and each write.
    pub const fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.state.timeout = timeout;
    }

    /// Sets the TLS settings used by [`Socket::enable_crypto`].
    pub fn set_tls_options(&mut self, tls: TlsOptions) {
        self.tls = tls;
    }

    /// Returns the connection parameters.
    #[must_use]
    pub const fn state(&self) -> &ConnectionState {
        &self.state
    }

    /// Returns the host part of the address, without any scheme prefix.
    #[must_use]
    pub fn host(&self) -> &str {
        split_scheme(&self.state.address).1
    }

    /// Reads one line, terminator included.
    ///
    /// Stops after a `\n`, after `max` bytes, at end of stream, or when a
    /// single wait for more data exceeds the timeout. The timeout restarts
    /// for every chunk received. Whatever was read so far is returned; see
    /// [`Socket::eof`] and [`Socket::timed_out`] for why a line is short.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotConnected`] or the underlying I/O error.
    pub async fn read_line(&mut self, max: usize) -> Result<Vec<u8>> {
        let wait = self.read_wait();
        let reader = self.reader.as_mut().ok_or(Error::NotConnected)?;
        self.timed_out = false;

        let mut line = Vec::new();
        while line.len() < max {
            let available = match within(wait, reader.fill_buf()).await {
                Ok(result) => result?,
                Err(_) => {
                    self.timed_out = true;
                    break;
                }
            };
            if available.is_empty() {
                self.eof = true;
                break;
            }

            let room = max - line.len();
            let window = &available[..available.len().min(room)];
            let (take, complete) = window
                .iter()
                .position(|&b| b == b'\n')
                .map_or((window.len(), false), |pos| (pos + 1, true));
            line.extend_from_slice(&window[..take]);
            reader.consume(take);
            if complete {
                break;
            }
        }
        Ok(line)
    }

    /// Reads up to `size` bytes in one go.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotConnected`] or the underlying I/O error.
    pub async fn read(&mut self, size: usize) -> Result<Vec<u8>> {
        let wait = self.read_wait();
        let reader = self.reader.as_mut().ok_or(Error::NotConnected)?;
        self.timed_out = false;

        let mut buf = vec![0; size];
        let n = match within(wait, reader.read(&mut buf)).await {
            Ok(result) => result?,
            Err(_) => {
                self.timed_out = true;
                0
            }
        };
        if n == 0 && size > 0 && !self.timed_out {
            self.eof = true;
        }
        buf.truncate(n);
        Ok(buf)
    }

    /// Writes all of `data` in blocks of `block_size` bytes (or the
    /// configured chunk size), then flushes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotConnected`], [`Error::Timeout`] if a block
    /// stalls, or the underlying I/O error.
    pub async fn write(&mut self, data: &[u8], block_size: Option<usize>) -> Result<usize> {
        let limit = self.state.timeout;
        let block_size = block_size.unwrap_or(self.state.chunk_size).max(1);
        let stream = self.reader.as_mut().ok_or(Error::NotConnected)?.get_mut();

        let mut sent = 0;
        for block in data.chunks(block_size) {
            within(limit, stream.write_all(block)).await??;
            sent += block.len();
        }
        within(limit, stream.flush()).await??;
        Ok(sent)
    }

    /// Returns true once the peer closed the stream or the socket is closed.
    #[must_use]
    pub const fn eof(&self) -> bool {
        self.reader.is_none() || self.eof
    }

    /// Returns true if the last read stopped because of the timeout.
    #[must_use]
    pub const fn timed_out(&self) -> bool {
        self.timed_out
    }

    /// Reports whether a read would return without waiting, giving the
    /// peer up to `timeout` to send something. End of stream counts as
    /// readable.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotConnected`] or the underlying I/O error.
    pub async fn poll_readable(&mut self, timeout: Duration) -> Result<bool> {
        let reader = self.reader.as_mut().ok_or(Error::NotConnected)?;
        if !reader.buffer().is_empty() {
            return Ok(true);
        }
        match tokio::time::timeout(timeout, reader.fill_buf()).await {
            Ok(Ok(available)) => {
                if available.is_empty() {
                    self.eof = true;
                }
                Ok(true)
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Ok(false),
        }
    }

    /// Turns TLS on or off on the open descriptor.
    ///
    /// Enabling runs a client handshake; disabling sends `close_notify` and
    /// continues in plaintext. Asking for the current mode is a no-op. If
    /// the switch fails the socket is left closed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotConnected`], [`Error::InvalidState`] if unread
    /// plaintext is buffered, or the handshake error.
    pub async fn enable_crypto(&mut self, enable: bool, version: TlsVersion) -> Result<()> {
        let reader = self.reader.as_ref().ok_or(Error::NotConnected)?;
        if reader.get_ref().is_tls() == enable {
            return Ok(());
        }
        if !reader.buffer().is_empty() {
            // Anything already buffered arrived outside the TLS session.
            return Err(Error::InvalidState(
                "unread data buffered before TLS switch".into(),
            ));
        }

        let stream = self
            .reader
            .take()
            .ok_or(Error::NotConnected)?
            .into_inner();
        let host = self.host().to_string();
        let switched = if enable {
            within(
                self.state.timeout,
                stream.upgrade_to_tls(&self.tls, &host, version),
            )
            .await
        } else {
            within(self.state.timeout, stream.downgrade()).await
        };

        match switched {
            Ok(Ok(stream)) => {
                tracing::debug!(host, tls = enable, "Switched transport encryption");
                self.reader = Some(BufReader::new(stream));
                Ok(())
            }
            Ok(Err(e)) | Err(e) => {
                tracing::warn!(?e, host, "TLS switch failed, connection closed");
                self.eof = true;
                Err(e)
            }
        }
    }

    /// Returns true if the socket is open.
    #[must_use]
    pub const fn is_connected(&self) -> bool {
        self.reader.is_some()
    }

    /// Returns true if the socket is open and encrypted.
    #[must_use]
    pub fn is_encrypted(&self) -> bool {
        self.reader
            .as_ref()
            .is_some_and(|reader| reader.get_ref().is_tls())
    }

    fn read_wait(&self) -> Option<Duration> {
        if self.state.blocking {
            self.state.timeout
        } else {
            Some(Duration::ZERO)
        }
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        if self.reader.is_some() {
            tracing::debug!(address = %self.state.address, "Closing connection on drop");
        }
    }
}

/// Runs `fut`, giving up with [`Error::Timeout`] after `limit`.
async fn within<F: Future>(limit: Option<Duration>, fut: F) -> Result<F::Output> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| Error::Timeout(limit)),
        None => Ok(fut.await),
    }
}

fn split_scheme(address: &str) -> (bool, &str) {
    ["ssl://", "tls://"]
        .iter()
        .find_map(|scheme| address.strip_prefix(scheme))
        .map_or((false, address), |host| (true, host))
}

async fn open(host: &str, port: u16, timeout: Option<Duration>) -> Result<BoxedIo> {
    let failed = |e: io::Error| Error::Connection(format!("{host}:{port}: {e}"));

    #[cfg(unix)]
    if host.starts_with('/') {
        let stream = within(timeout, tokio::net::UnixStream::connect(host))
            .await?
            .map_err(|e| Error::Connection(format!("{host}: {e}")))?;
        return Ok(Box::new(stream));
    }

    let literal = host.trim_start_matches('[').trim_end_matches(']');
    let addrs: Vec<SocketAddr> = match literal.parse::<IpAddr>() {
        Ok(ip) => vec![SocketAddr::new(ip, port)],
        Err(_) => within(timeout, lookup_host((host, port)))
            .await?
            .map_err(failed)?
            .collect(),
    };
    if addrs.is_empty() {
        return Err(Error::Connection(format!("{host}: no addresses found")));
    }

    let stream = within(timeout, TcpStream::connect(addrs.as_slice()))
        .await?
        .map_err(failed)?;
    stream.set_nodelay(true)?;
    Ok(Box::new(stream))
}
