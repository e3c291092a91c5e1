//! SASL responses.
//!
//! Implements:
//! - PLAIN (RFC 4616) - authorization identity, username and password
//! - CRAM-MD5 (RFC 2195) - HMAC-MD5 keyed with the password
//! - DIGEST-MD5 (RFC 2831) - `qop=auth` only

use crate::error::{Error, Result};
use crate::types::AuthMechanism;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use rand::RngCore;

type HmacMd5 = Hmac<Md5>;

/// Inputs for computing a challenge response.
#[derive(Debug, Clone, Copy)]
pub struct SaslRequest<'a> {
    /// Authentication identity.
    pub username: &'a str,
    /// Password.
    pub password: &'a str,
    /// Decoded server challenge.
    pub challenge: &'a [u8],
    /// Host name of the server.
    pub server_name: &'a str,
    /// Service name, `smtp` for mail submission.
    pub service: &'a str,
    /// Identity to act as; empty for the authentication identity.
    pub authorization_id: &'a str,
}

/// Computes challenge responses for the MD5-based mechanisms.
///
/// Whichever mechanisms a provider supports become available to the
/// negotiator; without a provider, CRAM-MD5 and DIGEST-MD5 are never
/// selected.
pub trait SaslProvider: Send + Sync {
    /// Returns true if this provider answers challenges for `mechanism`.
    fn supports(&self, mechanism: AuthMechanism) -> bool;

    /// Computes the raw (not base64-encoded) response to a challenge.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Auth`] if the challenge cannot be answered.
    fn respond(&self, mechanism: AuthMechanism, request: &SaslRequest<'_>) -> Result<Vec<u8>>;
}

/// [`SaslProvider`] for CRAM-MD5 and DIGEST-MD5.
#[derive(Debug, Clone, Copy, Default)]
pub struct Md5SaslProvider;

impl SaslProvider for Md5SaslProvider {
    fn supports(&self, mechanism: AuthMechanism) -> bool {
        mechanism.needs_provider()
    }

    fn respond(&self, mechanism: AuthMechanism, request: &SaslRequest<'_>) -> Result<Vec<u8>> {
        match mechanism {
            AuthMechanism::CramMd5 => {
                Ok(cram_md5_response(request.username, request.password, request.challenge)
                    .into_bytes())
            }
            AuthMechanism::DigestMd5 => {
                digest_md5_response(request, &client_nonce()).map(String::into_bytes)
            }
            other => Err(Error::Auth(format!("{other} does not use a challenge"))),
        }
    }
}

/// Generates the base64 PLAIN response.
///
/// Format: `<authzid>\0<username>\0<password>`; an empty authorization
/// identity means "same as the username".
#[must_use]
pub fn plain_response(authorization_id: &str, username: &str, password: &str) -> String {
    let auth_string = format!("{authorization_id}\0{username}\0{password}");
    STANDARD.encode(auth_string.as_bytes())
}

/// Generates the CRAM-MD5 response: `<username> <hex hmac-md5(password, challenge)>`.
#[must_use]
pub fn cram_md5_response(username: &str, password: &str, challenge: &[u8]) -> String {
    let digest = hmac_md5(password.as_bytes(), challenge);
    format!("{username} {}", hex::encode(digest))
}

fn hmac_md5(key: &[u8], data: &[u8]) -> Vec<u8> {
    // HMAC accepts keys of any length.
    let Ok(mut mac) = HmacMd5::new_from_slice(key) else {
        return Vec::new();
    };
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// Generates the DIGEST-MD5 response to the server's first challenge.
///
/// # Errors
///
/// Returns [`Error::Auth`] if the challenge has no nonce or does not offer
/// `qop=auth`.
pub fn digest_md5_response(request: &SaslRequest<'_>, cnonce: &str) -> Result<String> {
    let challenge = String::from_utf8_lossy(request.challenge);
    let directives = parse_directives(&challenge);
    let lookup = |key: &str| {
        directives
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(key))
            .map(|(_, value)| value.as_str())
    };

    let nonce = lookup("nonce")
        .ok_or_else(|| Error::Auth("DIGEST-MD5 challenge has no nonce".into()))?;
    if let Some(qop) = lookup("qop")
        && !qop.split(',').any(|q| q.trim() == "auth")
    {
        return Err(Error::Auth(format!("DIGEST-MD5 qop not supported: {qop}")));
    }
    let realm = lookup("realm").unwrap_or(request.server_name);
    let digest_uri = format!("{}/{}", request.service, request.server_name);
    let nc = "00000001";

    let mut a1 = Md5::digest(format!("{}:{realm}:{}", request.username, request.password))
        .to_vec();
    a1.extend_from_slice(format!(":{nonce}:{cnonce}").as_bytes());
    if !request.authorization_id.is_empty() {
        a1.extend_from_slice(format!(":{}", request.authorization_id).as_bytes());
    }
    let a2 = format!("AUTHENTICATE:{digest_uri}");
    let response = hex::encode(Md5::digest(format!(
        "{}:{nonce}:{nc}:{cnonce}:auth:{}",
        hex::encode(Md5::digest(&a1)),
        hex::encode(Md5::digest(a2))
    )));

    let mut out = format!(
        "charset=utf-8,username=\"{}\",realm=\"{realm}\",nonce=\"{nonce}\",nc={nc},\
         cnonce=\"{cnonce}\",digest-uri=\"{digest_uri}\",response={response},qop=auth",
        request.username
    );
    if !request.authorization_id.is_empty() {
        out.push_str(&format!(",authzid=\"{}\"", request.authorization_id));
    }
    Ok(out)
}

/// Splits `key=value,key="quoted, value"` into pairs.
fn parse_directives(text: &str) -> Vec<(String, String)> {
    let mut directives = Vec::new();
    let mut chars = text.chars().peekable();

    loop {
        while chars.next_if(|c| c.is_whitespace() || *c == ',').is_some() {}
        let key: String = chars.by_ref().take_while(|c| *c != '=').collect();
        let key = key.trim().to_string();
        if key.is_empty() {
            break;
        }

        let mut value = String::new();
        if chars.next_if_eq(&'"').is_some() {
            while let Some(c) = chars.next() {
                match c {
                    '\\' => value.extend(chars.next()),
                    '"' => break,
                    _ => value.push(c),
                }
            }
        } else {
            while let Some(c) = chars.next_if(|c| *c != ',') {
                value.push(c);
            }
        }
        directives.push((key, value.trim().to_string()));
    }
    directives
}

fn client_nonce() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    STANDARD.encode(bytes)
}
