//! SMTP protocol engine.

use super::socket::Socket;
use super::stream::{Io, TlsOptions, TlsVersion};
use crate::command::Command;
use crate::error::{Error, Result};
use crate::parser::{parse_line, parse_reply};
use crate::types::{Capabilities, Reply, ReplyCode};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Longest reply line accepted before the server is considered broken.
pub const MAX_REPLY_LINE: usize = 8192;

/// Block size used when writing message data.
pub const DATA_BLOCK_SIZE: usize = 8192;

/// Direction of a traced protocol line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client to server.
    Sent,
    /// Server to client.
    Received,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sent => f.write_str("C"),
            Self::Received => f.write_str("S"),
        }
    }
}

/// Callback receiving every traced protocol line while debug mode is on.
pub type DebugHandler = Arc<dyn Fn(Direction, &str) + Send + Sync>;

/// Protocol engine settings.
#[derive(Clone)]
pub struct ClientOptions {
    /// Name sent with EHLO/HELO.
    pub local_name: String,
    /// Use PIPELINING when the server offers it.
    pub pipelining: bool,
    /// Per-read and per-write timeout.
    pub timeout: Option<Duration>,
    /// Trace every line sent and received.
    pub debug: bool,
    /// Extra sink for traced lines.
    pub debug_handler: Option<DebugHandler>,
    /// TLS settings for implicit TLS and STARTTLS.
    pub tls: Option<TlsOptions>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            local_name: "localhost".to_string(),
            pipelining: false,
            timeout: None,
            debug: false,
            debug_handler: None,
            tls: None,
        }
    }
}

impl fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientOptions")
            .field("local_name", &self.local_name)
            .field("pipelining", &self.pipelining)
            .field("timeout", &self.timeout)
            .field("debug", &self.debug)
            .field("debug_handler", &self.debug_handler.is_some())
            .field("tls", &self.tls)
            .finish()
    }
}

/// Command written but not yet answered or deferred.
#[derive(Debug)]
struct Awaiting {
    verb: &'static str,
    target: String,
    pipelinable: bool,
}

/// Deferred command whose reply is read with the next synchronous one.
#[derive(Debug)]
struct Pending {
    verb: &'static str,
    argument: String,
    expected: Vec<ReplyCode>,
}

/// SMTP client over a single connection.
///
/// Every command is written with [`Client::send_command`] and answered
/// with [`Client::get_response`]. With pipelining active, replies to
/// MAIL, RCPT, RSET and SEND/SOML/SAML may be deferred; they are read, in
/// order, ahead of the next reply read synchronously.
#[derive(Debug)]
pub struct Client {
    socket: Socket,
    options: ClientOptions,
    capabilities: Capabilities,
    greeting: Option<Reply>,
    last_reply: Option<Reply>,
    pipelining: bool,
    pending: Vec<Pending>,
    awaiting: Option<Awaiting>,
}

impl Client {
    fn with_socket(socket: Socket, options: ClientOptions) -> Self {
        Self {
            socket,
            options,
            capabilities: Capabilities::default(),
            greeting: None,
            last_reply: None,
            pipelining: false,
            pending: Vec::new(),
            awaiting: None,
        }
    }

    /// Connects, reads the greeting and negotiates with EHLO (or HELO).
    ///
    /// # Errors
    ///
    /// Returns a connection error, or a protocol error if the greeting is
    /// not 220 or both EHLO and HELO are refused.
    pub async fn connect(
        host: &str,
        port: u16,
        options: ClientOptions,
        persistent: bool,
    ) -> Result<Self> {
        let mut socket = Socket::new();
        socket
            .connect(host, port, persistent, options.timeout, options.tls.clone())
            .await?;
        let mut client = Self::with_socket(socket, options);
        client.handshake().await?;
        Ok(client)
    }

    /// Runs the session over an established stream.
    ///
    /// # Errors
    ///
    /// Same as [`Client::connect`], minus connection setup.
    pub async fn from_stream<S: Io + 'static>(stream: S, options: ClientOptions) -> Result<Self> {
        let mut socket = Socket::new();
        socket.attach(stream, "localhost", 0);
        socket.set_timeout(options.timeout);
        if let Some(tls) = &options.tls {
            socket.set_tls_options(tls.clone());
        }
        let mut client = Self::with_socket(socket, options);
        client.handshake().await?;
        Ok(client)
    }

    async fn handshake(&mut self) -> Result<()> {
        let greeting = self.read_expected(&[ReplyCode::SERVICE_READY]).await?;
        tracing::debug!(greeting = %greeting, "Server greeting");
        self.greeting = Some(greeting);
        self.negotiate().await
    }

    /// Sends EHLO and records the advertised capabilities.
    ///
    /// A 503 reply means the session is already past this point and counts
    /// as success with no capabilities. Any other rejection falls back to
    /// HELO, whose failure is final. Pipelining is switched on only if it
    /// was requested and the server offers it.
    ///
    /// # Errors
    ///
    /// Returns the HELO error, or a connection error.
    pub async fn negotiate(&mut self) -> Result<()> {
        self.capabilities = Capabilities::default();
        self.pipelining = false;
        let hostname = self.options.local_name.clone();

        self.send_command(&Command::Ehlo {
            hostname: hostname.clone(),
        })
        .await?;
        match self.response(&[ReplyCode::OK]).await {
            Ok(reply) => self.capabilities = Capabilities::from_lines(&reply.message),
            Err(e) if e.reply_code() == Some(ReplyCode::BAD_SEQUENCE.as_u16()) => {
                tracing::debug!("EHLO answered 503, treating session as authenticated");
                return Ok(());
            }
            Err(e @ Error::Protocol { .. }) => {
                tracing::debug!(?e, "EHLO refused, falling back to HELO");
                self.send_command(&Command::Helo { hostname }).await?;
                self.response(&[ReplyCode::OK]).await?;
            }
            Err(e) => return Err(e),
        }

        self.pipelining = self.options.pipelining && self.capabilities.supports_pipelining();
        tracing::debug!(
            pipelining = self.pipelining,
            capabilities = self.capabilities.iter().count(),
            "Negotiated"
        );
        Ok(())
    }

    /// Upgrades the connection with STARTTLS and negotiates again.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if the server does not answer 220, or the
    /// TLS error; a failed handshake leaves the connection closed.
    pub async fn starttls(&mut self, version: TlsVersion) -> Result<()> {
        self.send_command(&Command::StartTls).await?;
        self.response(&[ReplyCode::SERVICE_READY]).await?;
        self.socket.enable_crypto(true, version).await?;
        tracing::info!(host = self.socket.host(), "STARTTLS established");
        self.negotiate().await
    }

    /// Writes one command.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if the previous command's reply was
    /// neither read nor deferred, [`Error::Format`] for a command with a
    /// line break, or a connection error.
    pub async fn send_command(&mut self, command: &Command) -> Result<()> {
        if let Some(previous) = &self.awaiting {
            return Err(Error::InvalidState(format!(
                "reply to {} has not been read",
                previous.verb
            )));
        }
        if !self.socket.is_connected() {
            return Err(Error::NotConnected);
        }

        let bytes = command.serialize()?;
        if command.is_sensitive() {
            self.trace(Direction::Sent, "[credentials redacted]");
        } else {
            self.trace(Direction::Sent, String::from_utf8_lossy(&bytes).trim_end());
        }

        if let Err(e) = self.socket.write(&bytes, None).await {
            self.connection_lost().await;
            return Err(e);
        }
        self.awaiting = Some(Awaiting {
            verb: command.verb(),
            target: command.target().to_string(),
            pipelinable: command.is_pipelinable(),
        });
        Ok(())
    }

    /// Reads the reply to the last command and checks it against `accepted`.
    ///
    /// With `later` set, pipelining active and a command that may be
    /// pipelined, nothing is read and `None` is returned; the reply is
    /// checked when the next reply is read synchronously.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Pipelined`] for the first deferred command that was
    /// refused, [`Error::Protocol`] if the reply code is not accepted, or a
    /// connection error.
    pub async fn get_response(
        &mut self,
        accepted: &[ReplyCode],
        later: bool,
    ) -> Result<Option<Reply>> {
        let deferrable = self.awaiting.as_ref().is_some_and(|a| a.pipelinable);
        if later && self.pipelining && deferrable {
            if let Some(awaiting) = self.awaiting.take() {
                self.pending.push(Pending {
                    verb: awaiting.verb,
                    argument: awaiting.target,
                    expected: accepted.to_vec(),
                });
            }
            return Ok(None);
        }
        self.response(accepted).await.map(Some)
    }

    async fn response(&mut self, accepted: &[ReplyCode]) -> Result<Reply> {
        if self.awaiting.take().is_none() {
            return Err(Error::InvalidState("no command awaiting a reply".into()));
        }
        if let Err(e) = self.drain_pending().await {
            if self.socket.is_connected() {
                // This command's reply is still owed; read it to stay in step.
                tracing::debug!(?e, "Pipelined command refused");
                let _ = self.read_reply().await;
            }
            return Err(e);
        }
        self.read_expected(accepted).await
    }

    /// Reads one reply per deferred command, reporting the first refusal
    /// after the whole batch has been consumed.
    async fn drain_pending(&mut self) -> Result<()> {
        let mut first_failure = None;
        for pending in std::mem::take(&mut self.pending) {
            let reply = match self.read_reply().await {
                Ok(reply) => reply,
                Err(e) => {
                    // The rest of the batch can no longer be matched up.
                    self.connection_lost().await;
                    return Err(e);
                }
            };
            if !reply.is_one_of(&pending.expected) && first_failure.is_none() {
                first_failure = Some(Error::Pipelined {
                    verb: pending.verb.to_string(),
                    argument: pending.argument,
                    source: Box::new(mismatch(&pending.expected, &reply)),
                });
            }
        }
        first_failure.map_or(Ok(()), Err)
    }

    async fn read_expected(&mut self, accepted: &[ReplyCode]) -> Result<Reply> {
        let reply = self
            .read_reply()
            .await
            .map_err(|e| e.with_expected(&codes(accepted)))?;
        if reply.is_one_of(accepted) {
            Ok(reply)
        } else {
            Err(mismatch(accepted, &reply))
        }
    }

    async fn read_reply(&mut self) -> Result<Reply> {
        if !self.socket.is_connected() {
            return Err(Error::NotConnected);
        }

        let mut lines = Vec::new();
        loop {
            let raw = match self.socket.read_line(MAX_REPLY_LINE).await {
                Ok(raw) => raw,
                Err(e) => {
                    self.connection_lost().await;
                    return Err(e);
                }
            };
            let timed_out = self.socket.timed_out();
            let text = String::from_utf8_lossy(&raw);
            let line = text.trim_end_matches(['\r', '\n']);

            if line.trim().is_empty() || timed_out {
                let timeout = self.socket.state().timeout.unwrap_or_default();
                self.connection_lost().await;
                return Err(if timed_out {
                    Error::Timeout(timeout)
                } else {
                    Error::protocol(&[], None, "Connection closed unexpectedly")
                });
            }
            if !raw.ends_with(b"\n") && !self.socket.eof() {
                self.connection_lost().await;
                return Err(Error::protocol(&[], None, "Reply line too long"));
            }

            self.trace(Direction::Received, line);
            let parsed = parse_line(line);
            if parsed.code.is_none() {
                return Err(Error::protocol(&[], None, line));
            }
            lines.push(line.to_string());
            if parsed.last {
                break;
            }
        }

        let reply = parse_reply(&lines)?;
        self.last_reply = Some(reply.clone());
        Ok(reply)
    }

    /// Closes the socket after a fatal error and forgets queued replies.
    async fn connection_lost(&mut self) {
        self.pending.clear();
        self.awaiting = None;
        if self.socket.is_connected() {
            tracing::warn!(host = self.socket.host(), "Connection lost");
            let _ = self.socket.disconnect().await;
        }
    }

    /// Starts a transaction; the reply may be deferred.
    ///
    /// # Errors
    ///
    /// Returns an error if the command cannot be sent or is refused.
    pub async fn mail_from(&mut self, from: &str, params: Option<&str>) -> Result<()> {
        self.send_command(&Command::MailFrom {
            from: from.to_string(),
            params: params.map(str::to_string),
        })
        .await?;
        self.get_response(&[ReplyCode::OK], true).await.map(drop)
    }

    /// Adds a recipient; the reply may be deferred.
    ///
    /// # Errors
    ///
    /// Returns an error if the command cannot be sent or is refused.
    pub async fn rcpt_to(&mut self, to: &str, params: Option<&str>) -> Result<()> {
        self.send_command(&Command::RcptTo {
            to: to.to_string(),
            params: params.map(str::to_string),
        })
        .await?;
        self.get_response(&[ReplyCode::OK, ReplyCode::FORWARD], true)
            .await
            .map(drop)
    }

    /// Sends DATA, the payload and the end-of-data marker.
    ///
    /// `payload` must already be CRLF-normalized and dot-stuffed. The
    /// marker is `.\r\n` when the payload is empty or ends in CRLF and
    /// `\r\n.\r\n` otherwise.
    ///
    /// # Errors
    ///
    /// Returns an error if DATA is not answered with 354 or the message is
    /// not accepted with 250. Deferred refusals surface here first.
    pub async fn data(&mut self, payload: &[u8]) -> Result<Reply> {
        self.send_command(&Command::Data).await?;
        if let Err(e) = self.response(&[ReplyCode::START_DATA]).await {
            let in_data = self
                .last_reply
                .as_ref()
                .is_some_and(|reply| reply.code == ReplyCode::START_DATA);
            if matches!(e, Error::Pipelined { .. }) && in_data {
                // Only closing the connection aborts a DATA phase without delivery.
                self.connection_lost().await;
            }
            return Err(e);
        }

        self.trace(Direction::Sent, &String::from_utf8_lossy(payload));
        let terminator: &[u8] = if payload.is_empty() || payload.ends_with(b"\r\n") {
            b".\r\n"
        } else {
            b"\r\n.\r\n"
        };
        let written = async {
            self.socket.write(payload, Some(DATA_BLOCK_SIZE)).await?;
            self.socket.write(terminator, None).await
        }
        .await;
        if let Err(e) = written {
            self.connection_lost().await;
            return Err(e);
        }
        self.trace(Direction::Sent, ".");

        self.awaiting = Some(Awaiting {
            verb: "DATA",
            target: String::new(),
            pipelinable: false,
        });
        self.response(&[ReplyCode::OK]).await
    }

    /// Resets the transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the server does not answer 250.
    pub async fn rset(&mut self) -> Result<()> {
        self.send_command(&Command::Rset).await?;
        self.response(&[ReplyCode::OK]).await.map(drop)
    }

    /// Sends NOOP.
    ///
    /// # Errors
    ///
    /// Returns an error if the server does not answer 250.
    pub async fn noop(&mut self) -> Result<()> {
        self.send_command(&Command::Noop).await?;
        self.response(&[ReplyCode::OK]).await.map(drop)
    }

    /// Asks the server to verify an address; 250 and 252 are accepted.
    ///
    /// # Errors
    ///
    /// Returns an error if the server answers anything else.
    pub async fn vrfy(&mut self, address: &str) -> Result<Reply> {
        self.send_command(&Command::Vrfy {
            address: address.to_string(),
        })
        .await?;
        self.response(&[ReplyCode::OK, ReplyCode::CANNOT_VERIFY])
            .await
    }

    /// Sends the deprecated `SEND FROM` command.
    ///
    /// # Errors
    ///
    /// Returns an error if the command cannot be sent or is refused.
    pub async fn send_from(&mut self, from: &str) -> Result<()> {
        self.deferrable(Command::SendFrom {
            from: from.to_string(),
        })
        .await
    }

    /// Sends the deprecated `SOML FROM` command.
    ///
    /// # Errors
    ///
    /// Returns an error if the command cannot be sent or is refused.
    pub async fn soml_from(&mut self, from: &str) -> Result<()> {
        self.deferrable(Command::SomlFrom {
            from: from.to_string(),
        })
        .await
    }

    /// Sends the deprecated `SAML FROM` command.
    ///
    /// # Errors
    ///
    /// Returns an error if the command cannot be sent or is refused.
    pub async fn saml_from(&mut self, from: &str) -> Result<()> {
        self.deferrable(Command::SamlFrom {
            from: from.to_string(),
        })
        .await
    }

    async fn deferrable(&mut self, command: Command) -> Result<()> {
        self.send_command(&command).await?;
        self.get_response(&[ReplyCode::OK], true).await.map(drop)
    }

    /// Sends QUIT and closes the connection, even if QUIT is refused.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotConnected`] if there is no connection, or the
    /// QUIT error.
    pub async fn disconnect(&mut self) -> Result<()> {
        let quit = self.quit().await;
        self.pending.clear();
        self.awaiting = None;
        if self.socket.is_connected() {
            self.socket.disconnect().await?;
        }
        quit
    }

    async fn quit(&mut self) -> Result<()> {
        self.send_command(&Command::Quit).await?;
        self.response(&[ReplyCode::CLOSING]).await.map(drop)
    }

    fn trace(&self, direction: Direction, line: &str) {
        if !self.options.debug {
            return;
        }
        tracing::debug!(target: "mailpost_smtp::wire", %direction, "{line}");
        if let Some(handler) = &self.options.debug_handler {
            handler(direction, line);
        }
    }

    /// Returns the capabilities from the last successful EHLO.
    #[must_use]
    pub const fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    /// Returns the server greeting.
    #[must_use]
    pub const fn greeting(&self) -> Option<&Reply> {
        self.greeting.as_ref()
    }

    /// Returns the last reply read.
    #[must_use]
    pub const fn last_reply(&self) -> Option<&Reply> {
        self.last_reply.as_ref()
    }

    /// Returns true if replies may currently be deferred.
    #[must_use]
    pub const fn pipelining(&self) -> bool {
        self.pipelining
    }

    /// Returns the number of deferred replies not read yet.
    #[must_use]
    pub fn pipelined_commands(&self) -> usize {
        self.pending.len()
    }

    /// Returns true while the connection is open.
    #[must_use]
    pub const fn is_connected(&self) -> bool {
        self.socket.is_connected()
    }

    /// Returns true if the connection is encrypted.
    #[must_use]
    pub fn is_encrypted(&self) -> bool {
        self.socket.is_encrypted()
    }

    /// Returns the host this client is connected to.
    #[must_use]
    pub fn server_name(&self) -> &str {
        self.socket.host()
    }

    /// Changes the timeout for subsequent reads and writes.
    pub const fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.options.timeout = timeout;
        self.socket.set_timeout(timeout);
    }

    /// Turns line tracing on or off.
    pub const fn set_debug(&mut self, debug: bool) {
        self.options.debug = debug;
    }

    /// Installs a sink for traced lines.
    pub fn set_debug_handler(&mut self, handler: Option<DebugHandler>) {
        self.options.debug_handler = handler;
    }

    /// Returns the engine settings.
    #[must_use]
    pub const fn options(&self) -> &ClientOptions {
        &self.options
    }
}

fn codes(accepted: &[ReplyCode]) -> Vec<u16> {
    accepted.iter().map(|code| code.as_u16()).collect()
}

fn mismatch(accepted: &[ReplyCode], reply: &Reply) -> Error {
    Error::protocol(
        &codes(accepted),
        Some(reply.code.as_u16()),
        reply.message_text(),
    )
}
