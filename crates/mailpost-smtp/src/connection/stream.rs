//! Low-level SMTP stream handling.

use crate::error::{Error, Result};
use rustls::SupportedProtocolVersion;
use rustls::pki_types::ServerName;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio_rustls::{
    TlsConnector,
    client::TlsStream,
    rustls::{ClientConfig, RootCertStore},
};

/// Byte stream an SMTP session can run over.
///
/// Implemented for every `AsyncRead + AsyncWrite` type, so TCP sockets,
/// Unix sockets and in-memory test streams are all accepted.
pub trait Io: AsyncRead + AsyncWrite + Unpin + Send + Sync {}

impl<T> Io for T where T: AsyncRead + AsyncWrite + Unpin + Send + Sync {}

/// Boxed transport stream.
pub type BoxedIo = Box<dyn Io>;

static TLS12_ONLY: &[&SupportedProtocolVersion] = &[&rustls::version::TLS12];
static TLS13_ONLY: &[&SupportedProtocolVersion] = &[&rustls::version::TLS13];

/// TLS protocol versions offered during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsVersion {
    /// TLS 1.2 or 1.3, negotiated.
    #[default]
    Any,
    /// TLS 1.2 only.
    Tls12,
    /// TLS 1.3 only.
    Tls13,
}

impl TlsVersion {
    fn protocol_versions(self) -> &'static [&'static SupportedProtocolVersion] {
        match self {
            Self::Any => rustls::ALL_VERSIONS,
            Self::Tls12 => TLS12_ONLY,
            Self::Tls13 => TLS13_ONLY,
        }
    }
}

/// TLS settings used for implicit TLS and STARTTLS.
#[derive(Clone, Default)]
pub struct TlsOptions {
    /// Name to verify the certificate against; defaults to the host connected to.
    pub server_name: Option<String>,
    /// Complete rustls configuration; overrides the built-in webpki roots.
    pub client_config: Option<Arc<ClientConfig>>,
}

impl TlsOptions {
    /// Creates options that verify against `server_name`.
    #[must_use]
    pub fn with_server_name(server_name: impl Into<String>) -> Self {
        Self {
            server_name: Some(server_name.into()),
            client_config: None,
        }
    }

    /// Builds a connector for the requested protocol version.
    #[must_use]
    pub fn connector(&self, version: TlsVersion) -> TlsConnector {
        match &self.client_config {
            Some(config) => TlsConnector::from(Arc::clone(config)),
            None => create_tls_connector(version),
        }
    }
}

impl fmt::Debug for TlsOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsOptions")
            .field("server_name", &self.server_name)
            .field("custom_config", &self.client_config.is_some())
            .finish()
    }
}

/// SMTP stream (plaintext or TLS).
pub enum SmtpStream {
    /// Plaintext connection.
    Plain(BoxedIo),
    /// TLS-encrypted connection.
    Tls(Box<TlsStream<BoxedIo>>),
}

impl SmtpStream {
    /// Wraps an established plaintext stream.
    pub fn plain<S: Io + 'static>(stream: S) -> Self {
        Self::Plain(Box::new(stream))
    }

    /// Returns true if the stream is TLS-encrypted.
    #[must_use]
    pub const fn is_tls(&self) -> bool {
        matches!(self, Self::Tls(_))
    }

    /// Upgrades a plaintext stream to TLS on the same descriptor.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream is already encrypted, the host name is
    /// not a valid DNS name, or the handshake fails.
    pub async fn upgrade_to_tls(
        self,
        options: &TlsOptions,
        host: &str,
        version: TlsVersion,
    ) -> Result<Self> {
        let io = match self {
            Self::Plain(io) => io,
            Self::Tls(_) => return Err(Error::InvalidState("Stream is already TLS".into())),
        };

        let name = options.server_name.as_deref().unwrap_or(host);
        let server_name = ServerName::try_from(name.to_string())?;
        let tls = options.connector(version).connect(server_name, io).await?;
        Ok(Self::Tls(Box::new(tls)))
    }

    /// Ends the TLS session with `close_notify` and hands back the
    /// plaintext stream underneath.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream is not encrypted or the alert cannot
    /// be written.
    pub async fn downgrade(self) -> Result<Self> {
        let tls = match self {
            Self::Tls(tls) => tls,
            Self::Plain(_) => return Err(Error::InvalidState("Stream is not TLS".into())),
        };

        let (mut io, mut session) = (*tls).into_inner();
        session.send_close_notify();
        let mut pending = Vec::new();
        while session.wants_write() {
            session.write_tls(&mut pending)?;
        }
        io.write_all(&pending).await?;
        io.flush().await?;
        Ok(Self::Plain(io))
    }
}

impl fmt::Debug for SmtpStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Plain(_) => f.write_str("SmtpStream::Plain"),
            Self::Tls(_) => f.write_str("SmtpStream::Tls"),
        }
    }
}

impl AsyncRead for SmtpStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            Self::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for SmtpStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            Self::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_flush(cx),
            Self::Tls(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            Self::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

/// Creates a TLS connector with the webpki root certificates.
#[must_use]
pub fn create_tls_connector(version: TlsVersion) -> TlsConnector {
    let root_store = RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };

    let config = ClientConfig::builder_with_protocol_versions(version.protocol_versions())
        .with_root_certificates(root_store)
        .with_no_client_auth();

    TlsConnector::from(Arc::new(config))
}
