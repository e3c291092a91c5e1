//! Mail transactions: envelope, rollback and connection lifecycle.

mod headers;

pub use headers::{
    HeaderValue, Headers, PreparedHeaders, prepare_headers, return_path, sanitize_headers,
    sanitize_value,
};

use crate::auth::{Authenticator, SaslProvider};
use crate::codec::quote_data;
use crate::config::Config;
use crate::connection::{Client, DebugHandler};
use crate::error::{Error, SendError};
use crate::types::{AddressListParser, SimpleAddressParser};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

/// Something that delivers messages.
pub trait MailSender {
    /// Delivers `body` with `headers` to every address in `recipients`.
    ///
    /// Each entry of `recipients` is an address list such as
    /// `"a@example.com, Bob <b@example.com>"`.
    fn send(
        &mut self,
        recipients: &[String],
        headers: &Headers,
        body: &[u8],
    ) -> impl Future<Output = Result<(), SendError>> + Send;
}

/// Renders MAIL FROM parameters as `KEY` or `KEY=VALUE` tokens.
#[must_use]
pub fn render_params(params: &BTreeMap<String, Option<String>>) -> Option<String> {
    let rendered = params
        .iter()
        .map(|(key, value)| match value {
            Some(value) => format!("{key}={value}"),
            None => key.clone(),
        })
        .collect::<Vec<_>>()
        .join(" ");
    (!rendered.is_empty()).then_some(rendered)
}

/// Joins headers and body with the separating blank line and encodes the
/// result for DATA.
#[must_use]
pub fn encode_payload(header_text: &str, body: &[u8]) -> Vec<u8> {
    let mut message = Vec::with_capacity(header_text.len() + body.len() + 4);
    message.extend_from_slice(header_text.as_bytes());
    message.extend_from_slice(if header_text.is_empty() { b"\r\n" } else { b"\r\n\r\n" });
    message.extend_from_slice(body);
    quote_data(&message)
}

/// SMTP implementation of [`MailSender`].
///
/// Connects lazily on the first message. With `persist` set the connection
/// is kept for later messages; it is closed when the mailer is dropped.
pub struct SmtpMailer {
    config: Config,
    authenticator: Authenticator,
    parser: Arc<dyn AddressListParser>,
    client: Option<Client>,
    debug_handler: Option<DebugHandler>,
    ready: bool,
    greeting: Option<String>,
    queued_as: Option<String>,
}

impl SmtpMailer {
    /// Creates a mailer offering LOGIN and PLAIN authentication.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            config,
            authenticator: Authenticator::new(),
            parser: Arc::new(SimpleAddressParser::default()),
            client: None,
            debug_handler: None,
            ready: false,
            greeting: None,
            queued_as: None,
        }
    }

    /// Adds the mechanisms answered by `provider` (CRAM-MD5, DIGEST-MD5).
    #[must_use]
    pub fn with_sasl_provider(mut self, provider: Arc<dyn SaslProvider>) -> Self {
        self.authenticator = Authenticator::with_provider(provider);
        self
    }

    /// Replaces the address-list parser.
    #[must_use]
    pub fn with_address_parser(mut self, parser: Arc<dyn AddressListParser>) -> Self {
        self.parser = parser;
        self
    }

    /// Installs a sink for the traced conversation (requires `debug`).
    #[must_use]
    pub fn with_debug_handler(mut self, handler: DebugHandler) -> Self {
        self.debug_handler = Some(handler);
        self
    }

    /// Uses an already-connected client instead of connecting.
    ///
    /// Authentication, if configured, still runs before the first message.
    #[must_use]
    pub fn with_client(mut self, client: Client) -> Self {
        self.client = Some(client);
        self.ready = false;
        self
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Returns the greeting of the server the last message went to.
    #[must_use]
    pub fn greeting(&self) -> Option<&str> {
        self.greeting.as_deref()
    }

    /// Returns the queue id the server reported for the last message.
    #[must_use]
    pub fn queued_as(&self) -> Option<&str> {
        self.queued_as.as_deref()
    }

    /// Returns true while a connection is open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.client.as_ref().is_some_and(Client::is_connected)
    }

    /// Sends QUIT and drops the connection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotConnected`] if there is no connection, or the
    /// QUIT error; the connection is dropped either way.
    pub async fn disconnect(&mut self) -> crate::Result<()> {
        let mut client = self.client.take().ok_or(Error::NotConnected)?;
        client.disconnect().await
    }

    /// Returns a connected, authenticated client, creating it if needed.
    ///
    /// Debug and authentication settings are applied once per connection.
    async fn session(&mut self) -> Result<&mut Client, SendError> {
        if self.client.as_ref().is_some_and(|c| !c.is_connected()) {
            tracing::debug!("Discarding closed connection");
            self.client = None;
        }

        let mut client = match self.client.take() {
            Some(client) => client,
            None => {
                self.ready = false;
                self.open().await?
            }
        };
        if !self.ready {
            client.set_debug(self.config.debug);
            client.set_debug_handler(self.debug_handler.clone());
            if self.config.auth.is_enabled() {
                self.login(&mut client).await?;
            }
            self.ready = true;
        }
        Ok(self.client.insert(client))
    }

    async fn open(&self) -> Result<Client, SendError> {
        let mut options = self.config.client_options();
        options.debug_handler.clone_from(&self.debug_handler);

        Client::connect(
            &self.config.host,
            self.config.port,
            options,
            self.config.persist,
        )
        .await
        .map_err(|e| {
            SendError::new(
                format!(
                    "Failed to connect to {}:{}",
                    self.config.host, self.config.port
                ),
                Error::Create(Box::new(e)),
            )
        })
    }

    async fn login(&self, client: &mut Client) -> Result<(), SendError> {
        let credentials = self.config.credentials();
        let result = self
            .authenticator
            .authenticate(
                client,
                &credentials,
                self.config.auth.mechanism(),
                self.config.starttls,
            )
            .await;
        if let Err(e) = result {
            let error = failure(client, "Failed to authenticate", e);
            if client.is_connected() {
                let _ = client.disconnect().await;
            }
            return Err(error);
        }
        Ok(())
    }

    async fn transact(
        &mut self,
        recipients: &[String],
        headers: &Headers,
        body: &[u8],
    ) -> Result<(), SendError> {
        let parser = Arc::clone(&self.parser);
        let params = render_params(&self.config.extension_params);
        let client = self.session().await?;

        let headers = sanitize_headers(headers);
        let prepared = prepare_headers(&headers, parser.as_ref())
            .map_err(|e| failure(client, "Failed to prepare headers", e))?;
        let sender = return_path(&headers)
            .or(prepared.from)
            .ok_or_else(|| failure(client, "Failed to determine sender", Error::MissingSender))?;

        if let Err(e) = client.mail_from(&sender, params.as_deref()).await {
            return Err(failure(client, format!("Failed to set sender: {sender}"), e));
        }

        let mut addresses = Vec::new();
        for list in recipients {
            let parsed = parser
                .parse(list)
                .map_err(|e| failure(client, "Failed to parse recipients", e))?;
            addresses.extend(parsed.iter().map(crate::Mailbox::address));
        }
        if addresses.is_empty() {
            return Err(failure(
                client,
                "Failed to parse recipients",
                Error::Address("no recipients".into()),
            ));
        }

        for address in &addresses {
            if let Err(e) = client.rcpt_to(address, None).await {
                let error = Error::Recipient {
                    address: address.clone(),
                    source: Box::new(e),
                };
                return Err(failure(
                    client,
                    format!("Failed to add recipient: {address}"),
                    error,
                ));
            }
        }

        let payload = encode_payload(&prepared.text, body);
        if let Some(limit) = client.capabilities().max_message_size()
            && payload.len() >= limit
        {
            let error = failure(
                client,
                "Message size exceeds server limit",
                Error::SizeLimitExceeded {
                    size: payload.len(),
                    limit,
                },
            );
            let _ = client.disconnect().await;
            return Err(error);
        }

        let accepted = match client.data(&payload).await {
            Ok(reply) => (
                reply.queued_as(),
                client.greeting().map(|greeting| greeting.message_text()),
            ),
            Err(Error::Pipelined {
                verb,
                argument,
                source,
            }) => {
                let (context, error) = if verb == "RCPT" {
                    (
                        format!("Failed to add recipient: {argument}"),
                        Error::Recipient {
                            address: argument,
                            source,
                        },
                    )
                } else {
                    (format!("Failed to set sender: {argument}"), *source)
                };
                return Err(failure(client, context, error));
            }
            Err(e) => {
                return Err(failure(
                    client,
                    "Failed to send data",
                    Error::DataTransfer(Box::new(e)),
                ));
            }
        };

        (self.queued_as, self.greeting) = accepted;
        tracing::info!(
            recipients = addresses.len(),
            size = payload.len(),
            queued_as = self.queued_as.as_deref().unwrap_or("-"),
            "Message accepted"
        );
        Ok(())
    }

    /// Resets the transaction after a failure; errors here are only logged.
    async fn rollback(&mut self) {
        let Some(client) = self.client.as_mut().filter(|c| c.is_connected()) else {
            return;
        };
        if let Err(e) = client.rset().await {
            tracing::warn!(?e, "RSET after failed transaction failed");
        }
    }
}

impl MailSender for SmtpMailer {
    async fn send(
        &mut self,
        recipients: &[String],
        headers: &Headers,
        body: &[u8],
    ) -> Result<(), SendError> {
        self.queued_as = None;
        if let Err(e) = self.transact(recipients, headers, body).await {
            tracing::debug!(error = %e, "Transaction failed");
            if !e.kind().is_connection_error() {
                self.rollback().await;
            }
            return Err(e);
        }

        if !self.config.persist {
            if let Err(e) = self.disconnect().await {
                tracing::debug!(?e, "QUIT after delivery failed");
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for SmtpMailer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpMailer")
            .field("config", &self.config)
            .field("authenticator", &self.authenticator)
            .field("connected", &self.is_connected())
            .field("queued_as", &self.queued_as)
            .finish_non_exhaustive()
    }
}

/// Wraps `error` with the last reply seen on `client`.
///
/// Errors raised locally, before or instead of a server reply, carry no
/// reply context.
fn failure(client: &Client, context: impl Into<String>, error: Error) -> SendError {
    let local = is_local(&error);
    let mut failure = SendError::new(context, error);
    if !local && let Some(reply) = client.last_reply() {
        failure.code = Some(reply.code.as_u16());
        failure.response = reply.message_text();
    }
    failure
}

fn is_local(error: &Error) -> bool {
    match error {
        Error::Format(_)
        | Error::SizeLimitExceeded { .. }
        | Error::MissingSender
        | Error::Address(_)
        | Error::Config(_)
        | Error::InvalidState(_) => true,
        Error::Recipient { source, .. } | Error::DataTransfer(source) => is_local(source),
        _ => false,
    }
}
