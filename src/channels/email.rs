//! Email adapters: SMTP via lettre for outreach, IMAP polling for replies.

use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use mail_parser::MessageParser;
use secrecy::{ExposeSecret, SecretString};
use uuid::Uuid;

use crate::channels::{InboundEmail, Mailbox, Mailer, OutboundEmail, SentEmail};
use crate::config::env_parse;
use crate::error::ExternalError;

// ── Configuration ───────────────────────────────────────────────────

/// Mail configuration, built from environment variables.
#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub imap_host: String,
    pub imap_port: u16,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub username: String,
    pub password: SecretString,
    pub from_address: String,
    pub poll_interval_secs: u64,
}

impl EmailConfig {
    /// Reads `EMAIL_*` variables. Mail stays disabled (`None`) until
    /// `EMAIL_IMAP_HOST` is set.
    pub fn from_env() -> Option<Self> {
        let imap_host = std::env::var("EMAIL_IMAP_HOST").ok()?;
        let smtp_host = std::env::var("EMAIL_SMTP_HOST")
            .unwrap_or_else(|_| imap_host.replacen("imap", "smtp", 1));
        let username = std::env::var("EMAIL_USERNAME").unwrap_or_default();
        let from_address =
            std::env::var("EMAIL_FROM_ADDRESS").unwrap_or_else(|_| username.clone());

        Some(Self {
            imap_port: env_parse("EMAIL_IMAP_PORT").unwrap_or(993),
            smtp_port: env_parse("EMAIL_SMTP_PORT").unwrap_or(587),
            password: SecretString::from(std::env::var("EMAIL_PASSWORD").unwrap_or_default()),
            poll_interval_secs: env_parse("EMAIL_POLL_INTERVAL_SECS").unwrap_or(60),
            imap_host,
            smtp_host,
            username,
            from_address,
        })
    }
}

// ── SMTP ────────────────────────────────────────────────────────────

/// Sends outreach mail over SMTP. lettre's transport is blocking, so every
/// send runs on the blocking pool.
pub struct SmtpMailer {
    config: Arc<EmailConfig>,
}

impl SmtpMailer {
    pub fn new(config: EmailConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, email: &OutboundEmail) -> Result<SentEmail, ExternalError> {
        let config = Arc::clone(&self.config);
        let email = email.clone();
        tokio::task::spawn_blocking(move || send_smtp(&config, &email))
            .await
            .map_err(|e| ExternalError::failed("smtp", format!("send task panicked: {e}")))?
    }
}

fn send_smtp(config: &EmailConfig, email: &OutboundEmail) -> Result<SentEmail, ExternalError> {
    let creds = Credentials::new(
        config.username.clone(),
        config.password.expose_secret().to_string(),
    );

    let transport = SmtpTransport::relay(&config.smtp_host)
        .map_err(|e| ExternalError::failed("smtp", format!("relay error: {e}")))?
        .port(config.smtp_port)
        .credentials(creds)
        .timeout(Some(Duration::from_secs(30)))
        .build();

    let message_id = format!("<{}@lead-pilot>", Uuid::new_v4());
    let message = Message::builder()
        .from(
            config
                .from_address
                .parse()
                .map_err(|e| ExternalError::failed("smtp", format!("invalid from address: {e}")))?,
        )
        .to(email
            .to
            .parse()
            .map_err(|e| ExternalError::failed("smtp", format!("invalid to address: {e}")))?)
        .subject(email.subject.as_str())
        .message_id(Some(message_id.clone()))
        .body(email.body.clone())
        .map_err(|e| ExternalError::failed("smtp", format!("failed to build email: {e}")))?;

    transport
        .send(&message)
        .map_err(|e| ExternalError::failed("smtp", format!("send failed: {e}")))?;

    tracing::info!(to = %email.to, message_id = %message_id, "Email sent");
    Ok(SentEmail { message_id })
}

// ── IMAP ────────────────────────────────────────────────────────────

/// Fetches unseen messages from the INBOX and marks them `\Seen`.
pub struct ImapMailbox {
    config: Arc<EmailConfig>,
}

impl ImapMailbox {
    pub fn new(config: EmailConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.config.poll_interval_secs.max(1))
    }

    pub fn own_address(&self) -> &str {
        &self.config.from_address
    }
}

#[async_trait]
impl Mailbox for ImapMailbox {
    async fn fetch_new(&self) -> Result<Vec<InboundEmail>, ExternalError> {
        let config = Arc::clone(&self.config);
        tokio::task::spawn_blocking(move || fetch_unseen_imap(&config))
            .await
            .map_err(|e| ExternalError::failed("imap", format!("poll task panicked: {e}")))?
            .map_err(|e| ExternalError::failed("imap", e))
    }
}

// ── Parsing ─────────────────────────────────────────────────────────

/// Flattens an HTML body to plain text. Tags act as word breaks.
fn html_to_text(html: &str) -> String {
    let mut pieces = html.split('<');
    let mut text = pieces.next().unwrap_or_default().to_string();
    for piece in pieces {
        if let Some((_tag, rest)) = piece.split_once('>') {
            text.push(' ');
            text.push_str(rest);
        }
    }
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Turn a raw RFC 822 message into an `InboundEmail`.
pub fn parse_inbound(raw: &[u8]) -> Option<InboundEmail> {
    let parsed = MessageParser::default().parse(raw)?;

    let sender = parsed
        .from()
        .and_then(|list| list.first())
        .and_then(|addr| addr.address())
        .unwrap_or("unknown")
        .to_string();
    let body = match parsed.body_text(0) {
        Some(text) => text.into_owned(),
        None => parsed
            .body_html(0)
            .map(|html| html_to_text(&html))
            .unwrap_or_default(),
    };
    let thread_id = parsed
        .in_reply_to()
        .as_text()
        .or_else(|| parsed.references().as_text())
        .map(str::to_string);

    Some(InboundEmail {
        sender,
        subject: parsed.subject().unwrap_or("(no subject)").to_string(),
        body,
        message_id: parsed
            .message_id()
            .map_or_else(|| format!("gen-{}", Uuid::new_v4()), str::to_string),
        thread_id,
    })
}

/// Sequence numbers listed on the untagged `* SEARCH` lines.
fn search_hits(lines: &[String]) -> Vec<u32> {
    lines
        .iter()
        .filter_map(|line| line.strip_prefix("* SEARCH"))
        .flat_map(str::split_whitespace)
        .filter_map(|n| n.parse().ok())
        .collect()
}

// ── IMAP session ────────────────────────────────────────────────────

type ImapError = Box<dyn std::error::Error + Send + Sync>;

type TlsStream = rustls::StreamOwned<rustls::ClientConnection, TcpStream>;

/// An IMAP connection over TLS that numbers its own command tags.
struct ImapSession {
    stream: BufReader<TlsStream>,
    next_tag: u32,
}

impl ImapSession {
    fn connect(config: &EmailConfig) -> Result<Self, ImapError> {
        let tcp = TcpStream::connect((config.imap_host.as_str(), config.imap_port))?;
        tcp.set_read_timeout(Some(Duration::from_secs(30)))?;

        let roots = rustls::RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };
        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let server_name = rustls_pki_types::ServerName::try_from(config.imap_host.clone())?;
        let conn = rustls::ClientConnection::new(Arc::new(tls_config), server_name)?;

        let mut session = Self {
            stream: BufReader::new(rustls::StreamOwned::new(conn, tcp)),
            next_tag: 1,
        };
        session.next_line()?;
        Ok(session)
    }

    fn next_line(&mut self) -> Result<String, ImapError> {
        let mut buf = Vec::new();
        if self.stream.read_until(b'\n', &mut buf)? == 0 {
            return Err("IMAP connection closed".into());
        }
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    /// Sends one command and collects every line up to and including the
    /// tagged completion line. A `NO` or `BAD` completion is an error.
    fn run(&mut self, command: &str) -> Result<Vec<String>, ImapError> {
        let tag = format!("A{}", self.next_tag);
        self.next_tag += 1;

        let writer = self.stream.get_mut();
        writer.write_all(format!("{tag} {command}\r\n").as_bytes())?;
        writer.flush()?;

        let mut lines = Vec::new();
        loop {
            let line = self.next_line()?;
            if let Some(status) = line.strip_prefix(tag.as_str()) {
                if !status.trim_start().starts_with("OK") {
                    return Err(format!("IMAP {} rejected: {}", verb(command), status.trim()).into());
                }
                lines.push(line);
                return Ok(lines);
            }
            lines.push(line);
        }
    }
}

/// First word of a command, so credentials never reach an error message.
fn verb(command: &str) -> &str {
    command.split_whitespace().next().unwrap_or_default()
}

/// Fetch unseen emails via raw IMAP over TLS (blocking, run in spawn_blocking).
fn fetch_unseen_imap(config: &EmailConfig) -> Result<Vec<InboundEmail>, ImapError> {
    let mut session = ImapSession::connect(config)?;
    session.run(&format!(
        "LOGIN \"{}\" \"{}\"",
        config.username,
        config.password.expose_secret()
    ))?;
    session.run("SELECT \"INBOX\"")?;
    let unseen = search_hits(&session.run("SEARCH UNSEEN")?);

    let mut results = Vec::with_capacity(unseen.len());
    for seq in unseen {
        let response = session.run(&format!("FETCH {seq} RFC822"))?;
        // Literal sits between the untagged FETCH line and the closing paren
        // plus tagged completion.
        let literal: String = response
            .get(1..response.len().saturating_sub(2))
            .unwrap_or_default()
            .concat();

        match parse_inbound(literal.as_bytes()) {
            Some(email) => results.push(email),
            None => tracing::warn!(seq, "Unparseable message skipped"),
        }

        if let Err(e) = session.run(&format!("STORE {seq} +FLAGS (\\Seen)")) {
            tracing::debug!(seq, error = %e, "Could not flag message as seen");
        }
    }

    if let Err(e) = session.run("LOGOUT") {
        tracing::debug!(error = %e, "IMAP logout failed");
    }

    Ok(results)
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn html_tags_become_word_breaks() {
        assert_eq!(
            html_to_text("<div><b>Bold</b> and <i>italic</i></div>"),
            "Bold and italic"
        );
        assert_eq!(html_to_text("<p>Call me</p><p>Tuesday</p>"), "Call me Tuesday");
        assert_eq!(html_to_text("No HTML here"), "No HTML here");
    }

    #[test]
    fn search_hits_reads_only_untagged_search_lines() {
        let lines = vec![
            "* 4 EXISTS\r\n".to_string(),
            "* SEARCH 3 7 12\r\n".to_string(),
            "A3 OK SEARCH completed\r\n".to_string(),
        ];
        assert_eq!(search_hits(&lines), vec![3, 7, 12]);

        let empty = vec!["* SEARCH\r\n".to_string(), "A3 OK\r\n".to_string()];
        assert!(search_hits(&empty).is_empty());
    }

    #[test]
    fn commands_are_named_by_verb_only() {
        assert_eq!(verb("LOGIN \"me\" \"hunter2\""), "LOGIN");
        assert_eq!(verb(""), "");
    }

    #[test]
    fn html_only_reply_is_flattened() {
        let raw = concat!(
            "From: Ana <ana@bakery.example>\r\n",
            "Subject: Re: your note\r\n",
            "Message-ID: <reply-9@bakery.example>\r\n",
            "References: <out-9@lead-pilot>\r\n",
            "Content-Type: text/html; charset=utf-8\r\n",
            "\r\n",
            "<html><body><p>Not right now,</p><p>thanks.</p></body></html>\r\n",
        );
        let email = parse_inbound(raw.as_bytes()).unwrap();
        assert_eq!(email.sender, "ana@bakery.example");
        assert_eq!(email.thread_id.as_deref(), Some("out-9@lead-pilot"));
        assert!(email.body.contains("Not right now, thanks."));
        assert!(!email.body.contains('<'));
    }

    #[test]
    fn parses_plain_reply() {
        let raw = concat!(
            "From: Joe <joe@joestacos.com>\r\n",
            "To: pilot@agency.com\r\n",
            "Subject: Re: A website for Joe's Tacos [Ref: 1A2B3C4D]\r\n",
            "Message-ID: <reply-1@joestacos.com>\r\n",
            "In-Reply-To: <out-1@lead-pilot>\r\n",
            "Content-Type: text/plain; charset=utf-8\r\n",
            "\r\n",
            "Sounds good, I'm interested.\r\n",
        );
        let email = parse_inbound(raw.as_bytes()).unwrap();
        assert_eq!(email.sender, "joe@joestacos.com");
        assert!(email.subject.contains("1A2B3C4D"));
        assert_eq!(email.message_id, "reply-1@joestacos.com");
        assert_eq!(email.thread_id.as_deref(), Some("out-1@lead-pilot"));
        assert!(email.body.contains("interested"));
    }

    #[test]
    fn missing_message_id_is_generated() {
        let raw = "From: a@b.com\r\nSubject: hi\r\n\r\nhello\r\n";
        let email = parse_inbound(raw.as_bytes()).unwrap();
        assert!(email.message_id.starts_with("gen-"));
        assert!(email.thread_id.is_none());
    }

    #[test]
    fn config_from_env_returns_none_when_no_host() {
        // SAFETY: no other test reads EMAIL_IMAP_HOST concurrently.
        unsafe { std::env::remove_var("EMAIL_IMAP_HOST") };
        assert!(EmailConfig::from_env().is_none());
    }
}
