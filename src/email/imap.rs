use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};

use async_imap::Session;
use async_native_tls::TlsStream;
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use futures::io::{AsyncRead, AsyncWrite};
use futures::StreamExt;
use lettre::message::{header::ContentType, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials as SmtpCredentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use mailparse::{addrparse, dateparse, DispositionType, MailHeaderMap, ParsedMail};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};

use super::credentials::ImapCredential;
use super::provider::{EmailProvider, FetchOptions, FetchResult, RawMessage, SendOptions};
use crate::crypto::CredentialVault;
use crate::error::SyncError;

const DEFAULT_FOLDER: &str = "INBOX";
const DEFAULT_FETCH_LIMIT: usize = 50;

/// Wrapper for either TLS or plain IMAP stream.
enum ImapStream {
    Tls(TlsStream<Compat<TcpStream>>),
    Plain(Compat<TcpStream>),
}

impl AsyncRead for ImapStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut [u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            ImapStream::Tls(s) => Pin::new(s).poll_read(cx, buf),
            ImapStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ImapStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            ImapStream::Tls(s) => Pin::new(s).poll_write(cx, buf),
            ImapStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ImapStream::Tls(s) => Pin::new(s).poll_flush(cx),
            ImapStream::Plain(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ImapStream::Tls(s) => Pin::new(s).poll_close(cx),
            ImapStream::Plain(s) => Pin::new(s).poll_close(cx),
        }
    }
}

impl std::fmt::Debug for ImapStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImapStream::Tls(_) => write!(f, "ImapStream::Tls"),
            ImapStream::Plain(_) => write!(f, "ImapStream::Plain"),
        }
    }
}

unsafe impl Send for ImapStream {}
impl Unpin for ImapStream {}

/// IMAP/SMTP mailbox adapter. Credentials are static, so an auth failure
/// is fatal for the cycle; there is nothing to refresh or retry. One
/// transient connection is opened per operation and closed afterwards.
pub struct ImapProvider {
    vault: Arc<CredentialVault>,
    state: Mutex<Option<ImapCredential>>,
}

impl ImapProvider {
    pub fn new(vault: Arc<CredentialVault>) -> Self {
        Self {
            vault,
            state: Mutex::new(None),
        }
    }

    async fn credential(&self) -> Result<ImapCredential, SyncError> {
        let guard = self.state.lock().await;
        guard
            .clone()
            .ok_or_else(|| SyncError::Validation("provider not initialized".into()))
    }

    /// Establish a connection and log in. TCP/TLS failures are transient;
    /// a rejected LOGIN is not.
    async fn connect(&self, cred: &ImapCredential) -> Result<Session<ImapStream>, SyncError> {
        tracing::debug!("Connecting to IMAP {}:{}", cred.host, cred.port);

        let tcp = TcpStream::connect((cred.host.as_str(), cred.port))
            .await
            .map_err(|e| SyncError::ProviderUnavailable(format!("IMAP connect: {}", e)))?;

        let stream = if cred.use_tls {
            let tls = async_native_tls::TlsConnector::new();
            let tls_stream = tls
                .connect(&cred.host, tcp.compat())
                .await
                .map_err(|e| SyncError::ProviderUnavailable(format!("TLS handshake: {}", e)))?;
            ImapStream::Tls(tls_stream)
        } else {
            ImapStream::Plain(tcp.compat())
        };

        let client = async_imap::Client::new(stream);

        let session = client
            .login(&cred.username, &cred.password)
            .await
            .map_err(|(err, _)| {
                SyncError::AuthExpired(format!("IMAP login rejected: {}", err))
            })?;

        Ok(session)
    }

    fn search_query(cursor: Option<&serde_json::Value>, uid_validity: u32, options: &FetchOptions) -> String {
        if let Some(last_uid) = cursor_last_uid(cursor, uid_validity) {
            return format!("UID {}:*", last_uid + 1);
        }
        if let Some(since) = options.since {
            // IMAP SEARCH date granularity is a day.
            return format!("SINCE {}", since.format("%d-%b-%Y"));
        }
        "ALL".to_string()
    }
}

#[async_trait]
impl EmailProvider for ImapProvider {
    async fn initialize(&self, credentials_encrypted: &str) -> Result<(), SyncError> {
        let credential: ImapCredential = self.vault.decrypt(credentials_encrypted)?;
        let mut guard = self.state.lock().await;
        *guard = Some(credential);
        Ok(())
    }

    async fn test_connection(&self) -> bool {
        let Ok(cred) = self.credential().await else {
            return false;
        };
        match self.connect(&cred).await {
            Ok(mut session) => {
                let ok = session.noop().await.is_ok();
                let _ = session.logout().await;
                ok
            }
            Err(_) => false,
        }
    }

    async fn fetch_messages(&self, options: FetchOptions) -> Result<FetchResult, SyncError> {
        let cred = self.credential().await?;
        let mut session = self.connect(&cred).await?;

        let folder = options.folder.as_deref().unwrap_or(DEFAULT_FOLDER);
        let mailbox = session
            .select(folder)
            .await
            .map_err(|e| SyncError::ProviderUnavailable(format!("SELECT {}: {}", folder, e)))?;
        let uid_validity = mailbox.uid_validity.unwrap_or(0);

        let query = Self::search_query(options.cursor.as_ref(), uid_validity, &options);
        let uids = session
            .uid_search(&query)
            .await
            .map_err(|e| SyncError::ProviderUnavailable(format!("UID SEARCH: {}", e)))?;

        // "UID n:*" always matches at least the newest message, so drop
        // anything at or below the cursor.
        let last_uid = cursor_last_uid(options.cursor.as_ref(), uid_validity).unwrap_or(0);
        let mut uids: Vec<u32> = uids.into_iter().filter(|&uid| uid > last_uid).collect();
        uids.sort_unstable_by(|a, b| b.cmp(a));
        uids.truncate(options.limit.unwrap_or(DEFAULT_FETCH_LIMIT));

        let mut messages = Vec::with_capacity(uids.len());
        let mut max_uid = last_uid;

        if !uids.is_empty() {
            let sequence = uids
                .iter()
                .map(|u| u.to_string())
                .collect::<Vec<_>>()
                .join(",");

            let mut fetch_stream = session
                .uid_fetch(&sequence, "(UID FLAGS BODY.PEEK[])")
                .await
                .map_err(|e| SyncError::ProviderUnavailable(format!("UID FETCH: {}", e)))?;

            while let Some(result) = fetch_stream.next().await {
                let fetch = result
                    .map_err(|e| SyncError::ProviderUnavailable(format!("UID FETCH: {}", e)))?;
                let Some(uid) = fetch.uid else { continue };
                let Some(body) = fetch.body() else { continue };

                let is_read = fetch
                    .flags()
                    .any(|flag| matches!(flag, async_imap::types::Flag::Seen));

                match parse_imap_message(body, uid, uid_validity, is_read) {
                    Ok(raw) => {
                        max_uid = max_uid.max(uid);
                        messages.push(raw);
                    }
                    Err(err) => {
                        tracing::warn!("Skipping unparseable message uid {}: {}", uid, err);
                    }
                }
            }
        }

        let _ = session.logout().await;

        let cursor = if max_uid > 0 {
            Some(serde_json::json!({
                "uid_validity": uid_validity,
                "last_uid": max_uid,
            }))
        } else {
            options.cursor
        };

        Ok(FetchResult { messages, cursor })
    }

    async fn send_message(&self, options: SendOptions) -> Result<String, SyncError> {
        let cred = self.credential().await?;

        let from: Mailbox = cred
            .username
            .parse()
            .map_err(|_| SyncError::Validation("account address is not a valid mailbox".into()))?;

        let message_id = format!("<{}@mailsync>", uuid::Uuid::new_v4());
        let mut builder = Message::builder()
            .from(from)
            .subject(&options.subject)
            .message_id(Some(message_id.clone()));

        for to in &options.to {
            let mailbox: Mailbox = to
                .parse()
                .map_err(|_| SyncError::Validation(format!("invalid recipient: {}", to)))?;
            builder = builder.to(mailbox);
        }
        for cc in &options.cc {
            let mailbox: Mailbox = cc
                .parse()
                .map_err(|_| SyncError::Validation(format!("invalid cc recipient: {}", cc)))?;
            builder = builder.cc(mailbox);
        }
        for bcc in &options.bcc {
            let mailbox: Mailbox = bcc
                .parse()
                .map_err(|_| SyncError::Validation(format!("invalid bcc recipient: {}", bcc)))?;
            builder = builder.bcc(mailbox);
        }

        let email = match &options.body_html {
            Some(html) => builder
                .multipart(MultiPart::alternative_plain_html(
                    options.body.clone(),
                    html.clone(),
                ))
                .map_err(|e| SyncError::Validation(format!("message build failed: {}", e)))?,
            None => builder
                .singlepart(
                    SinglePart::builder()
                        .header(ContentType::TEXT_PLAIN)
                        .body(options.body.clone()),
                )
                .map_err(|e| SyncError::Validation(format!("message build failed: {}", e)))?,
        };

        let smtp_host = cred.smtp_host();
        let transport: AsyncSmtpTransport<Tokio1Executor> = if cred.smtp_port() == 465 {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&smtp_host)
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&smtp_host)
        }
        .map_err(|e| SyncError::ProviderUnavailable(format!("SMTP setup: {}", e)))?
        .port(cred.smtp_port())
        .credentials(SmtpCredentials::new(
            cred.username.clone(),
            cred.password.clone(),
        ))
        .build();

        transport.send(email).await.map_err(|e| {
            if e.to_string().contains("authentication") {
                SyncError::AuthExpired(format!("SMTP authentication failed: {}", e))
            } else {
                SyncError::ProviderUnavailable(format!("SMTP send: {}", e))
            }
        })?;

        Ok(message_id)
    }

    async fn refreshed_credential(&self) -> Result<Option<String>, SyncError> {
        // Static password credentials; nothing ever rotates mid-cycle.
        Ok(None)
    }
}

fn cursor_last_uid(cursor: Option<&serde_json::Value>, uid_validity: u32) -> Option<u32> {
    let cursor = cursor?;
    // A UIDVALIDITY change means all stored UIDs are meaningless; start
    // over rather than skipping unseen mail.
    let stored_validity = cursor.get("uid_validity")?.as_u64()? as u32;
    if stored_validity != uid_validity {
        return None;
    }
    cursor.get("last_uid")?.as_u64().map(|u| u as u32)
}

/// Parse a raw RFC 822 message into the provider-neutral shape.
fn parse_imap_message(
    raw: &[u8],
    uid: u32,
    uid_validity: u32,
    is_read: bool,
) -> Result<RawMessage, SyncError> {
    let parsed = mailparse::parse_mail(raw)
        .map_err(|e| SyncError::Validation(format!("MIME parse: {}", e)))?;

    let headers = &parsed.headers;

    let from_address = headers
        .get_first_value("From")
        .and_then(|v| first_address(&v))
        .ok_or_else(|| SyncError::Validation("message has no From address".into()))?;

    let to_addresses = headers
        .get_first_value("To")
        .map(|v| all_addresses(&v))
        .unwrap_or_default();
    let cc_addresses = headers
        .get_first_value("Cc")
        .map(|v| all_addresses(&v))
        .unwrap_or_default();

    let sent_at = headers
        .get_first_value("Date")
        .and_then(|v| dateparse(&v).ok())
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
        .ok_or_else(|| SyncError::Validation("message has no parseable Date".into()))?;

    // Prefer the RFC Message-ID; UIDs are only stable within one
    // UIDVALIDITY generation.
    let external_id = headers
        .get_first_value("Message-ID")
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| format!("uid-{}-{}", uid_validity, uid));

    let mut body_plain: Option<String> = None;
    let mut body_html: Option<String> = None;
    let mut has_attachments = false;
    collect_parts(&parsed, &mut body_plain, &mut body_html, &mut has_attachments);

    let body_preview = body_plain
        .as_deref()
        .or(body_html.as_deref())
        .map(|b| preview_text(b, 200));

    Ok(RawMessage {
        external_id,
        subject: headers.get_first_value("Subject"),
        body_preview,
        body_html,
        from_address,
        to_addresses,
        cc_addresses,
        has_attachments,
        sent_at,
        received_at: Some(sent_at),
        is_read,
        provider_thread_id: None,
    })
}

fn collect_parts(
    part: &ParsedMail,
    plain: &mut Option<String>,
    html: &mut Option<String>,
    has_attachments: &mut bool,
) {
    if part.get_content_disposition().disposition == DispositionType::Attachment {
        *has_attachments = true;
        return;
    }

    if part.subparts.is_empty() {
        let mimetype = part.ctype.mimetype.to_lowercase();
        if mimetype == "text/plain" && plain.is_none() {
            *plain = part.get_body().ok();
        } else if mimetype == "text/html" && html.is_none() {
            *html = part.get_body().ok();
        }
        return;
    }

    for sub in &part.subparts {
        collect_parts(sub, plain, html, has_attachments);
    }
}

fn first_address(header: &str) -> Option<String> {
    addrparse(header).ok().and_then(|list| {
        list.extract_single_info()
            .map(|info| info.addr)
            .or_else(|| all_addresses(header).into_iter().next())
    })
}

fn all_addresses(header: &str) -> Vec<String> {
    match addrparse(header) {
        Ok(list) => list
            .iter()
            .flat_map(|addr| match addr {
                mailparse::MailAddr::Single(info) => vec![info.addr.clone()],
                mailparse::MailAddr::Group(group) => {
                    group.addrs.iter().map(|i| i.addr.clone()).collect()
                }
            })
            .collect(),
        Err(_) => Vec::new(),
    }
}

/// Strip markup and clamp to a display preview.
fn preview_text(body: &str, max: usize) -> String {
    let mut text = String::with_capacity(body.len().min(max + 16));
    let mut in_tag = false;
    for c in body.chars() {
        match c {
            '<' => in_tag = true,
            '>' => in_tag = false,
            c if !in_tag => text.push(c),
            _ => {}
        }
    }
    let trimmed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if trimmed.chars().count() <= max {
        trimmed
    } else {
        trimmed.chars().take(max).collect::<String>() + "..."
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &[u8] = b"Message-ID: <abc123@example.com>\r\n\
From: Alice <alice@example.com>\r\n\
To: bob@example.com, carol@example.com\r\n\
Cc: dave@example.com\r\n\
Subject: Re: Quarterly numbers\r\n\
Date: Wed, 1 May 2024 10:15:00 +0000\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
\r\n\
Hello Bob, numbers attached below.\r\n";

    #[test]
    fn test_parse_imap_message() {
        let msg = parse_imap_message(SAMPLE, 42, 7, true).unwrap();
        assert_eq!(msg.external_id, "<abc123@example.com>");
        assert_eq!(msg.from_address, "alice@example.com");
        assert_eq!(msg.to_addresses, vec!["bob@example.com", "carol@example.com"]);
        assert_eq!(msg.cc_addresses, vec!["dave@example.com"]);
        assert_eq!(msg.subject.as_deref(), Some("Re: Quarterly numbers"));
        assert!(msg.is_read);
        assert!(!msg.has_attachments);
        assert!(msg.body_preview.unwrap().starts_with("Hello Bob"));
        assert_eq!(msg.sent_at.to_rfc3339(), "2024-05-01T10:15:00+00:00");
    }

    #[test]
    fn test_parse_missing_from_is_validation_error() {
        let raw = b"Subject: hi\r\nDate: Wed, 1 May 2024 10:15:00 +0000\r\n\r\nbody\r\n";
        let err = parse_imap_message(raw, 1, 1, false).unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));
    }

    #[test]
    fn test_external_id_falls_back_to_uid() {
        let raw = b"From: a@b.com\r\nTo: c@d.com\r\nDate: Wed, 1 May 2024 10:15:00 +0000\r\n\r\nx\r\n";
        let msg = parse_imap_message(raw, 42, 7, false).unwrap();
        assert_eq!(msg.external_id, "uid-7-42");
    }

    #[test]
    fn test_cursor_uid_validity_reset() {
        let cursor = serde_json::json!({ "uid_validity": 7, "last_uid": 120 });
        assert_eq!(cursor_last_uid(Some(&cursor), 7), Some(120));
        // Mailbox was rebuilt; stored UIDs no longer apply.
        assert_eq!(cursor_last_uid(Some(&cursor), 8), None);
        assert_eq!(cursor_last_uid(None, 7), None);
    }

    #[test]
    fn test_search_query() {
        let cursor = serde_json::json!({ "uid_validity": 7, "last_uid": 120 });
        let options = FetchOptions::default();
        assert_eq!(
            ImapProvider::search_query(Some(&cursor), 7, &options),
            "UID 121:*"
        );

        let since = FetchOptions {
            since: Some(Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap()),
            ..Default::default()
        };
        assert_eq!(
            ImapProvider::search_query(None, 7, &since),
            "SINCE 01-May-2024"
        );
        assert_eq!(ImapProvider::search_query(None, 7, &options), "ALL");
    }

    #[test]
    fn test_preview_strips_html() {
        let html = "<div><p>Hello <b>world</b></p></div>";
        assert_eq!(preview_text(html, 200), "Hello world");
    }
}
