//! SMTP authentication (RFC 4954) with opportunistic STARTTLS.

mod sasl;

pub use sasl::{
    Md5SaslProvider, SaslProvider, SaslRequest, cram_md5_response, digest_md5_response,
    plain_response,
};

use crate::command::Command;
use crate::connection::{Client, TlsVersion};
use crate::error::{Error, Result};
use crate::types::{AuthMechanism, ReplyCode};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use std::fmt;
use std::sync::Arc;

/// Service name used for DIGEST-MD5 digest URIs.
pub const SERVICE_NAME: &str = "smtp";

/// Login credentials.
#[derive(Clone, Default)]
pub struct Credentials {
    /// Authentication identity.
    pub username: String,
    /// Password.
    pub password: String,
    /// Identity to act as (PLAIN and DIGEST-MD5); empty for none.
    pub authorization_id: String,
}

impl Credentials {
    /// Creates credentials without an authorization identity.
    #[must_use]
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            authorization_id: String::new(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("authorization_id", &self.authorization_id)
            .finish()
    }
}

/// Picks a SASL mechanism and runs its exchange over a [`Client`].
#[derive(Clone, Default)]
pub struct Authenticator {
    provider: Option<Arc<dyn SaslProvider>>,
}

impl Authenticator {
    /// Creates an authenticator offering only LOGIN and PLAIN.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an authenticator that also offers the mechanisms `provider` answers.
    #[must_use]
    pub fn with_provider(provider: Arc<dyn SaslProvider>) -> Self {
        Self {
            provider: Some(provider),
        }
    }

    /// Returns the locally usable mechanisms in preference order.
    #[must_use]
    pub fn supported(&self) -> Vec<AuthMechanism> {
        AuthMechanism::PREFERENCE
            .into_iter()
            .filter(|mechanism| {
                !mechanism.needs_provider()
                    || self
                        .provider
                        .as_ref()
                        .is_some_and(|provider| provider.supports(*mechanism))
            })
            .collect()
    }

    /// Chooses the mechanism to use against the server's AUTH tokens.
    ///
    /// An explicitly requested mechanism only has to be supported locally;
    /// otherwise the first supported mechanism the server lists wins.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Auth`] if nothing matches.
    pub fn select(
        &self,
        advertised: &[String],
        requested: Option<AuthMechanism>,
    ) -> Result<AuthMechanism> {
        let supported = self.supported();
        let offered = |mechanism: &AuthMechanism| {
            advertised
                .iter()
                .any(|token| token.eq_ignore_ascii_case(mechanism.as_str()))
        };

        match requested {
            Some(mechanism) if !supported.contains(&mechanism) => Err(Error::Auth(format!(
                "{mechanism} is not supported by this client"
            ))),
            Some(mechanism) => Ok(mechanism),
            None => supported
                .into_iter()
                .find(offered)
                .ok_or_else(|| Error::Auth("no supported authentication method".into())),
        }
    }

    /// Authenticates the session.
    ///
    /// With `starttls` set and the server offering STARTTLS on a plaintext
    /// connection, the connection is upgraded and renegotiated first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Auth`] if the server offers no usable mechanism or
    /// rejects the credentials, or the STARTTLS / connection error.
    pub async fn authenticate(
        &self,
        client: &mut Client,
        credentials: &Credentials,
        requested: Option<AuthMechanism>,
        starttls: bool,
    ) -> Result<AuthMechanism> {
        if starttls && !client.is_encrypted() && client.capabilities().supports_starttls() {
            client.starttls(TlsVersion::Any).await?;
        }

        let advertised = client.capabilities().auth_tokens();
        if advertised.is_empty() {
            return Err(Error::Auth("server does not offer AUTH".into()));
        }
        let mechanism = self.select(&advertised, requested)?;
        tracing::debug!(%mechanism, "Selected authentication mechanism");

        if !start(client, mechanism).await? {
            tracing::debug!(%mechanism, "AUTH answered 503, already authenticated");
            return Ok(mechanism);
        }

        let result = match mechanism {
            AuthMechanism::Plain => plain(client, credentials).await,
            AuthMechanism::Login => login(client, credentials).await,
            AuthMechanism::CramMd5 => self.cram_md5(client, credentials).await,
            AuthMechanism::DigestMd5 => self.digest_md5(client, credentials).await,
        };
        result.map_err(|e| match e {
            Error::Protocol { code, text, .. } => Error::Auth(format!(
                "{mechanism} rejected ({}): {text}",
                code.map_or_else(|| "invalid".to_string(), |code| code.to_string())
            )),
            other => other,
        })?;

        tracing::info!(%mechanism, user = %credentials.username, "Authenticated");
        Ok(mechanism)
    }

    async fn cram_md5(&self, client: &mut Client, credentials: &Credentials) -> Result<()> {
        let challenge = challenge(client)?;
        let response = self.compute(client, AuthMechanism::CramMd5, credentials, &challenge)?;
        respond(client, STANDARD.encode(response), ReplyCode::AUTH_SUCCESS).await
    }

    async fn digest_md5(&self, client: &mut Client, credentials: &Credentials) -> Result<()> {
        let challenge = challenge(client)?;
        let response = self.compute(client, AuthMechanism::DigestMd5, credentials, &challenge)?;
        respond(client, STANDARD.encode(response), ReplyCode::AUTH_CONTINUE).await?;
        // The rspauth step carries nothing this client checks.
        respond(client, String::new(), ReplyCode::AUTH_SUCCESS).await
    }

    fn compute(
        &self,
        client: &Client,
        mechanism: AuthMechanism,
        credentials: &Credentials,
        challenge: &[u8],
    ) -> Result<Vec<u8>> {
        let provider = self
            .provider
            .as_ref()
            .ok_or_else(|| Error::Auth(format!("{mechanism} needs a SASL provider")))?;
        provider.respond(
            mechanism,
            &SaslRequest {
                username: &credentials.username,
                password: &credentials.password,
                challenge,
                server_name: client.server_name(),
                service: SERVICE_NAME,
                authorization_id: &credentials.authorization_id,
            },
        )
    }
}

impl fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Authenticator")
            .field("supported", &self.supported())
            .finish()
    }
}

/// Sends `AUTH <mechanism>` and reads the first challenge.
///
/// Returns false when the server answers 503, which is taken to mean the
/// session is already authenticated.
// TODO: report 503 as an error; it means "bad sequence of commands".
async fn start(client: &mut Client, mechanism: AuthMechanism) -> Result<bool> {
    client.send_command(&Command::Auth { mechanism }).await?;
    match client
        .get_response(&[ReplyCode::AUTH_CONTINUE], false)
        .await
    {
        Ok(_) => Ok(true),
        Err(e) if e.reply_code() == Some(ReplyCode::BAD_SEQUENCE.as_u16()) => Ok(false),
        Err(Error::Protocol { code, text, .. }) => Err(Error::Auth(format!(
            "AUTH {mechanism} refused ({}): {text}",
            code.map_or_else(|| "invalid".to_string(), |code| code.to_string())
        ))),
        Err(e) => Err(e),
    }
}

async fn plain(client: &mut Client, credentials: &Credentials) -> Result<()> {
    let response = plain_response(
        &credentials.authorization_id,
        &credentials.username,
        &credentials.password,
    );
    respond(client, response, ReplyCode::AUTH_SUCCESS).await
}

async fn login(client: &mut Client, credentials: &Credentials) -> Result<()> {
    let username = STANDARD.encode(credentials.username.as_bytes());
    respond(client, username, ReplyCode::AUTH_CONTINUE).await?;
    let password = STANDARD.encode(credentials.password.as_bytes());
    respond(client, password, ReplyCode::AUTH_SUCCESS).await
}

async fn respond(client: &mut Client, line: String, expected: ReplyCode) -> Result<()> {
    client.send_command(&Command::AuthResponse(line)).await?;
    client.get_response(&[expected], false).await.map(drop)
}

/// Decodes the base64 challenge carried by the last 334 reply.
fn challenge(client: &Client) -> Result<Vec<u8>> {
    let text = client
        .last_reply()
        .map(|reply| reply.message_text())
        .unwrap_or_default();
    STANDARD
        .decode(text.trim())
        .map_err(|e| Error::Auth(format!("invalid challenge: {e}")))
}
