//! End-to-end tests for the mailer.
//!
//! A mock stream replays a scripted server conversation and captures
//! everything the client writes, so each test can check the exact bytes
//! that went over the wire.

use std::io::{self, Cursor};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use mailpost_smtp::{
    AddressListParser, AuthSetting, Client, Config, Direction, Error, Headers, MailSender,
    Mailbox, SimpleAddressParser, SmtpMailer,
};

/// Mock stream that returns predefined responses.
struct MockStream {
    /// Server side of the conversation.
    responses: Cursor<Vec<u8>>,
    /// Everything the client wrote.
    sent: Arc<Mutex<Vec<u8>>>,
}

impl AsyncRead for MockStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let data = self.responses.get_ref();
        let pos = self.responses.position() as usize;

        if pos >= data.len() {
            return Poll::Ready(Ok(()));
        }

        let remaining = &data[pos..];
        let to_read = remaining.len().min(buf.remaining());
        buf.put_slice(&remaining[..to_read]);
        self.responses.set_position((pos + to_read) as u64);

        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for MockStream {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.sent.lock().unwrap().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Connects a mailer to a scripted server.
async fn mailer(config: Config, script: &[&str]) -> (SmtpMailer, Arc<Mutex<Vec<u8>>>) {
    let sent = Arc::new(Mutex::new(Vec::new()));
    let stream = MockStream {
        responses: Cursor::new(script.concat().into_bytes()),
        sent: Arc::clone(&sent),
    };
    let client = Client::from_stream(stream, config.client_options())
        .await
        .unwrap();
    (SmtpMailer::new(config).with_client(client), sent)
}

fn written(sent: &Arc<Mutex<Vec<u8>>>) -> String {
    String::from_utf8(sent.lock().unwrap().clone()).unwrap()
}

fn headers() -> Headers {
    let mut headers = Headers::new();
    headers.append("From", "Alice <alice@example.com>");
    headers.append("To", "bob@example.com");
    headers.append("Subject", "Hello");
    headers
}

fn recipients(list: &str) -> Vec<String> {
    vec![list.to_string()]
}

const GREETING: &str = "220 mx.example.com ESMTP\r\n";
const EHLO_PLAIN: &str = "250 mx.example.com\r\n";
const OK: &str = "250 ok\r\n";
const GO_AHEAD: &str = "354 go ahead\r\n";
const QUEUED: &str = "250 2.0.0 Ok: queued as ABC123\r\n";
const BYE: &str = "221 bye\r\n";

const MESSAGE: &str = "From: Alice <alice@example.com>\r\nTo: bob@example.com\r\n\
                       Subject: Hello\r\n\r\nHi Bob!\r\n.\r\n";

#[tokio::test]
async fn test_send_delivers_and_quits() {
    let config = Config::builder("localhost").build();
    let (mut mailer, sent) = mailer(
        config,
        &[GREETING, EHLO_PLAIN, OK, OK, GO_AHEAD, QUEUED, BYE],
    )
    .await;

    mailer
        .send(&recipients("bob@example.com"), &headers(), b"Hi Bob!\n")
        .await
        .unwrap();

    assert_eq!(
        written(&sent),
        format!(
            "EHLO localhost\r\nMAIL FROM:<alice@example.com>\r\nRCPT TO:<bob@example.com>\r\n\
             DATA\r\n{MESSAGE}QUIT\r\n"
        )
    );
    assert_eq!(mailer.queued_as(), Some("ABC123"));
    assert_eq!(mailer.greeting(), Some("mx.example.com ESMTP"));
    assert!(!mailer.is_connected());
}

#[tokio::test]
async fn test_send_uses_return_path_and_scrubs_headers() {
    let config = Config::builder("localhost").build();
    let (mut mailer, sent) = mailer(
        config,
        &[GREETING, EHLO_PLAIN, OK, OK, GO_AHEAD, QUEUED, BYE],
    )
    .await;

    let mut headers = headers();
    headers.set("Subject", "Hello\r\nBcc: eve@example.com");
    headers.append("Return-Path", "<bounces@example.com>");

    mailer
        .send(&recipients("Bob <bob@example.com>"), &headers, b"Hi")
        .await
        .unwrap();

    let wire = written(&sent);
    assert!(wire.contains("MAIL FROM:<bounces@example.com>\r\n"));
    assert!(wire.contains("Subject: Hello\r\n"));
    assert!(!wire.contains("eve@example.com"));
    assert!(wire.contains("\r\n\r\nHi\r\n.\r\nQUIT\r\n"));
}

#[tokio::test]
async fn test_send_adds_extension_params() {
    let config = Config::builder("localhost")
        .extension_param("XVERP", None)
        .extension_param("BODY", Some("8BITMIME".to_string()))
        .build();
    let (mut mailer, sent) = mailer(
        config,
        &[GREETING, EHLO_PLAIN, OK, OK, GO_AHEAD, QUEUED, BYE],
    )
    .await;

    mailer
        .send(&recipients("bob@example.com"), &headers(), b"Hi")
        .await
        .unwrap();

    assert!(written(&sent).contains("MAIL FROM:<alice@example.com> BODY=8BITMIME XVERP\r\n"));
}

#[tokio::test]
async fn test_refused_recipient_rolls_back() {
    let config = Config::builder("localhost").build();
    let (mut mailer, sent) = mailer(
        config,
        &[GREETING, EHLO_PLAIN, OK, "550 5.1.1 no such user\r\n", OK],
    )
    .await;

    let err = mailer
        .send(&recipients("nobody@example.com"), &headers(), b"Hi")
        .await
        .unwrap_err();

    assert_eq!(err.context, "Failed to add recipient: nobody@example.com");
    assert_eq!(err.code, Some(550));
    assert_eq!(err.response, "5.1.1 no such user");
    assert!(matches!(
        err.kind(),
        Error::Recipient { address, .. } if address == "nobody@example.com"
    ));
    assert!(err.kind().is_permanent());

    let wire = written(&sent);
    assert!(wire.ends_with("RCPT TO:<nobody@example.com>\r\nRSET\r\n"));
    assert!(!wire.contains("DATA"));
    assert!(mailer.is_connected());
}

#[tokio::test]
async fn test_missing_sender() {
    let config = Config::builder("localhost").build();
    let (mut mailer, sent) = mailer(config, &[GREETING, EHLO_PLAIN, OK]).await;

    let headers: Headers = [("Subject", "no sender")].into_iter().collect();
    let err = mailer
        .send(&recipients("bob@example.com"), &headers, b"Hi")
        .await
        .unwrap_err();

    assert_eq!(err.context, "Failed to determine sender");
    assert!(matches!(err.kind(), Error::MissingSender));
    assert_eq!(err.code, None);
    assert_eq!(written(&sent), "EHLO localhost\r\nRSET\r\n");
}

#[tokio::test]
async fn test_message_over_size_limit_is_not_sent() {
    let config = Config::builder("localhost").build();
    let (mut mailer, sent) = mailer(
        config,
        &[
            GREETING,
            "250-mx.example.com\r\n250 SIZE 100\r\n",
            OK,
            OK,
            BYE,
        ],
    )
    .await;

    let body = vec![b'x'; 200];
    let err = mailer
        .send(&recipients("bob@example.com"), &headers(), &body)
        .await
        .unwrap_err();

    assert!(matches!(
        err.kind(),
        Error::SizeLimitExceeded { limit: 100, size } if *size > 200
    ));
    let wire = written(&sent);
    assert!(!wire.contains("DATA"));
    assert!(wire.ends_with("QUIT\r\n"));
    assert!(!mailer.is_connected());
}

#[tokio::test]
async fn test_message_at_size_limit_is_not_sent() {
    // The payload is the wire message without its ".\r\n" terminator.
    let limit = MESSAGE.len() - 3;
    let ehlo = format!("250-mx.example.com\r\n250 SIZE {limit}\r\n");
    let config = Config::builder("localhost").build();
    let (mut mailer, sent) = mailer(config, &[GREETING, &ehlo, OK, OK, BYE]).await;

    let err = mailer
        .send(&recipients("bob@example.com"), &headers(), b"Hi Bob!\n")
        .await
        .unwrap_err();

    assert!(matches!(
        err.kind(),
        Error::SizeLimitExceeded { size, limit: max } if *size == limit && *max == limit
    ));
    assert_eq!(err.code, None);
    assert!(err.response.is_empty());
    assert!(!written(&sent).contains("DATA"));
}

#[tokio::test]
async fn test_message_below_size_limit_is_sent() {
    let limit = MESSAGE.len() - 2;
    let ehlo = format!("250-mx.example.com\r\n250 SIZE {limit}\r\n");
    let config = Config::builder("localhost").build();
    let (mut mailer, sent) = mailer(
        config,
        &[GREETING, &ehlo, OK, OK, GO_AHEAD, QUEUED, BYE],
    )
    .await;

    mailer
        .send(&recipients("bob@example.com"), &headers(), b"Hi Bob!\n")
        .await
        .unwrap();
    assert!(written(&sent).contains(MESSAGE));
}

#[tokio::test]
async fn test_empty_return_path_falls_back_to_from() {
    let config = Config::builder("localhost").build();
    let (mut mailer, sent) = mailer(
        config,
        &[GREETING, EHLO_PLAIN, OK, OK, GO_AHEAD, QUEUED, BYE],
    )
    .await;

    let mut headers = headers();
    headers.append("Return-Path", " ");
    mailer
        .send(&recipients("bob@example.com"), &headers, b"Hi")
        .await
        .unwrap();

    assert!(written(&sent).contains("MAIL FROM:<alice@example.com>\r\n"));
}

#[tokio::test]
async fn test_pipelined_batch() {
    let config = Config::builder("localhost").pipelining(true).build();
    let (mut mailer, sent) = mailer(
        config,
        &[
            GREETING,
            "250-mx.example.com\r\n250-PIPELINING\r\n250 SIZE 10000\r\n",
            OK,
            OK,
            "251 forwarding\r\n",
            GO_AHEAD,
            QUEUED,
            BYE,
        ],
    )
    .await;

    mailer
        .send(
            &recipients("bob@example.com, carol@example.com"),
            &headers(),
            b"Hi Bob!\n",
        )
        .await
        .unwrap();

    assert_eq!(
        written(&sent),
        format!(
            "EHLO localhost\r\nMAIL FROM:<alice@example.com>\r\nRCPT TO:<bob@example.com>\r\n\
             RCPT TO:<carol@example.com>\r\nDATA\r\n{MESSAGE}QUIT\r\n"
        )
    );
    assert_eq!(mailer.queued_as(), Some("ABC123"));
}

#[tokio::test]
async fn test_pipelined_refusal_surfaces_at_data() {
    let config = Config::builder("localhost").pipelining(true).build();
    let (mut mailer, sent) = mailer(
        config,
        &[
            GREETING,
            "250-mx.example.com\r\n250 PIPELINING\r\n",
            OK,
            OK,
            "550 5.1.1 unknown\r\n",
            "554 5.5.1 no valid recipients\r\n",
            OK,
        ],
    )
    .await;

    let err = mailer
        .send(
            &recipients("bob@example.com, carol@example.com"),
            &headers(),
            b"Hi",
        )
        .await
        .unwrap_err();

    assert_eq!(err.context, "Failed to add recipient: carol@example.com");
    assert!(matches!(
        err.kind(),
        Error::Recipient { address, .. } if address == "carol@example.com"
    ));
    assert_eq!(err.kind().reply_code(), Some(550));

    let wire = written(&sent);
    assert!(wire.ends_with("DATA\r\nRSET\r\n"));
    assert!(mailer.is_connected());
}

#[tokio::test]
async fn test_pipelined_refusal_with_data_accepted_drops_connection() {
    let config = Config::builder("localhost").pipelining(true).build();
    let (mut mailer, sent) = mailer(
        config,
        &[
            GREETING,
            "250-mx.example.com\r\n250 PIPELINING\r\n",
            OK,
            "550 5.1.1 unknown\r\n",
            GO_AHEAD,
        ],
    )
    .await;

    let err = mailer
        .send(&recipients("bob@example.com"), &headers(), b"Hi")
        .await
        .unwrap_err();

    assert!(matches!(err.kind(), Error::Recipient { .. }));
    let wire = written(&sent);
    assert!(wire.ends_with("DATA\r\n"));
    assert!(!wire.contains("Subject"));
    assert!(!mailer.is_connected());
}

#[tokio::test]
async fn test_persistent_connection_is_reused() {
    let config = Config::builder("localhost").persist(true).build();
    let (mut mailer, sent) = mailer(
        config,
        &[
            GREETING, EHLO_PLAIN, OK, OK, GO_AHEAD, QUEUED, OK, OK, GO_AHEAD,
            "250 2.0.0 Ok: queued as DEF456\r\n", BYE,
        ],
    )
    .await;

    mailer
        .send(&recipients("bob@example.com"), &headers(), b"one")
        .await
        .unwrap();
    assert!(mailer.is_connected());
    assert_eq!(mailer.queued_as(), Some("ABC123"));

    mailer
        .send(&recipients("bob@example.com"), &headers(), b"two")
        .await
        .unwrap();
    assert_eq!(mailer.queued_as(), Some("DEF456"));

    mailer.disconnect().await.unwrap();
    assert!(!mailer.is_connected());

    let wire = written(&sent);
    assert_eq!(wire.matches("EHLO").count(), 1);
    assert_eq!(wire.matches("MAIL FROM").count(), 2);
    assert!(wire.ends_with("QUIT\r\n"));
}

#[tokio::test]
async fn test_login_before_first_message() {
    let config = Config::builder("localhost")
        .auth(AuthSetting::Best)
        .credentials("alice", "secret")
        .build();
    let (mut mailer, sent) = mailer(
        config,
        &[
            GREETING,
            "250-mx.example.com\r\n250 AUTH PLAIN LOGIN\r\n",
            "334 VXNlcm5hbWU6\r\n",
            "334 UGFzc3dvcmQ6\r\n",
            "235 2.7.0 Authentication successful\r\n",
            OK,
            OK,
            GO_AHEAD,
            QUEUED,
            BYE,
        ],
    )
    .await;

    mailer
        .send(&recipients("bob@example.com"), &headers(), b"Hi Bob!\n")
        .await
        .unwrap();

    assert!(written(&sent).starts_with(
        "EHLO localhost\r\nAUTH LOGIN\r\nYWxpY2U=\r\nc2VjcmV0\r\nMAIL FROM:<alice@example.com>\r\n"
    ));
}

#[tokio::test]
async fn test_auth_bad_sequence_counts_as_authenticated() {
    let config = Config::builder("localhost")
        .auth(AuthSetting::Best)
        .credentials("alice", "secret")
        .build();
    let (mut mailer, sent) = mailer(
        config,
        &[
            GREETING,
            "250-mx.example.com\r\n250 AUTH PLAIN\r\n",
            "503 5.5.1 already authenticated\r\n",
            OK,
            OK,
            GO_AHEAD,
            QUEUED,
            BYE,
        ],
    )
    .await;

    mailer
        .send(&recipients("bob@example.com"), &headers(), b"Hi")
        .await
        .unwrap();

    assert!(written(&sent).starts_with("EHLO localhost\r\nAUTH PLAIN\r\nMAIL FROM:"));
}

#[tokio::test]
async fn test_rejected_credentials_close_the_connection() {
    let config = Config::builder("localhost")
        .auth(AuthSetting::Best)
        .credentials("alice", "wrong")
        .build();
    let (mut mailer, sent) = mailer(
        config,
        &[
            GREETING,
            "250-mx.example.com\r\n250 AUTH PLAIN\r\n",
            "334 \r\n",
            "535 5.7.8 bad credentials\r\n",
            BYE,
        ],
    )
    .await;

    let err = mailer
        .send(&recipients("bob@example.com"), &headers(), b"Hi")
        .await
        .unwrap_err();

    assert_eq!(err.context, "Failed to authenticate");
    assert_eq!(err.code, Some(535));
    assert!(matches!(err.kind(), Error::Auth(_)));
    let wire = written(&sent);
    assert!(wire.ends_with("QUIT\r\n"));
    assert!(!wire.contains("MAIL FROM"));
    assert!(!mailer.is_connected());
}

#[tokio::test]
async fn test_debug_handler_sees_conversation() {
    let lines = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&lines);
    let config = Config::builder("localhost")
        .debug(true)
        .auth(AuthSetting::Best)
        .credentials("alice", "secret")
        .build();
    let (mailer, _sent) = mailer(
        config,
        &[
            GREETING,
            "250-mx.example.com\r\n250 AUTH PLAIN\r\n",
            "334 \r\n",
            "235 ok\r\n",
            OK,
            OK,
            GO_AHEAD,
            QUEUED,
            BYE,
        ],
    )
    .await;
    let mut mailer =
        mailer.with_debug_handler(Arc::new(move |direction: Direction, line: &str| {
            sink.lock().unwrap().push(format!("{direction}: {line}"));
        }));

    mailer
        .send(&recipients("bob@example.com"), &headers(), b"Hi")
        .await
        .unwrap();

    let lines = lines.lock().unwrap();
    assert!(lines.contains(&"C: MAIL FROM:<alice@example.com>".to_string()));
    assert!(lines.iter().any(|line| line.starts_with("S: 221")));
    assert!(lines.contains(&"C: [credentials redacted]".to_string()));
    assert!(!lines.iter().any(|l| l.contains("c2VjcmV0")));
}

/// Parser that yields a recipient with an embedded line break.
struct SmugglingParser;

impl AddressListParser for SmugglingParser {
    fn parse(&self, text: &str) -> mailpost_smtp::Result<Vec<Mailbox>> {
        if text.starts_with("evil") {
            return Ok(vec![Mailbox::new("evil\r\nDATA", "example.com")]);
        }
        SimpleAddressParser::default().parse(text)
    }
}

#[tokio::test]
async fn test_line_break_in_recipient_is_refused() {
    let config = Config::builder("localhost").build();
    let (mailer, sent) = mailer(config, &[GREETING, EHLO_PLAIN, OK, OK]).await;
    let mut mailer = mailer.with_address_parser(Arc::new(SmugglingParser));

    let err = mailer
        .send(&recipients("evil@example.com"), &headers(), b"Hi")
        .await
        .unwrap_err();

    assert!(matches!(
        err.kind(),
        Error::Recipient { source, .. } if matches!(**source, Error::Format(_))
    ));
    assert_eq!(err.code, None);
    let wire = written(&sent);
    assert!(!wire.contains("evil"));
    assert!(wire.ends_with("MAIL FROM:<alice@example.com>\r\nRSET\r\n"));
}
