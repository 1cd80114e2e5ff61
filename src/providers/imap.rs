//! Generic IMAP/SMTP provider adapter.
//!
//! Mail is read over IMAP4rev1 (RFC 3501) via `async-imap` and sent over SMTP
//! via `lettre`. Calendar and contacts come from the configured CalDAV and
//! CardDAV collections through [`DavClient`].
//!
//! # Cursors
//!
//! The email cursor is `"<uidvalidity>:<last uid>"` for the inbox. A changed
//! UIDVALIDITY invalidates it. Without CONDSTORE/QRESYNC an incremental sync
//! only sees newly arrived messages; expunges and flag changes are picked up by
//! the next full sync.

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_imap::types::{Fetch, Flag};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use lettre::address::Envelope;
use lettre::message::{Mailbox, MessageBuilder, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials as SmtpCredentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use mail_parser::{Addr, Message as ParsedMessage, MessageParser};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::ClientConfig;
use tokio_rustls::TlsConnector;
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};

use super::dav::DavClient;
use super::traits::normalize_with;
use super::{
    AdapterOptions, ListThreadsParams, MailboxAdapter, OutgoingEmail, ProviderError, Result,
    SyncBatch, SyncParams, ThreadPage, ThreadSummary, UserInfo,
};
use crate::domain::{
    Address, CalendarEvent, Contact, Draft, Email, Folder, ProviderType, Security, ServerSettings,
};
use crate::storage::Login;

/// IMAP session over TLS (implicit or after STARTTLS).
type ImapSession = async_imap::Session<Compat<TlsStream<TcpStream>>>;

const INBOX: &str = "INBOX";
const DRAFTS: &str = "Drafts";
const FETCH_ITEMS: &str = "(UID FLAGS BODY.PEEK[])";
const FETCH_CHUNK: usize = 50;

const SYSTEM_FOLDERS: &[&str] = &["INBOX", "Sent", "Drafts", "Trash", "Junk", "Archive"];

/// Resume point of an IMAP mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct UidCursor {
    uid_validity: u32,
    last_uid: u32,
}

impl UidCursor {
    fn parse(value: &str) -> Result<Self> {
        let invalid = || ProviderError::CursorInvalidated(format!("malformed IMAP cursor: {}", value));
        let (validity, last) = value.split_once(':').ok_or_else(invalid)?;
        Ok(Self {
            uid_validity: validity.parse().map_err(|_| invalid())?,
            last_uid: last.parse().map_err(|_| invalid())?,
        })
    }
}

impl fmt::Display for UidCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.uid_validity, self.last_uid)
    }
}

/// Picks the UIDs a sync fetches, in ascending order.
///
/// Incremental syncs take the oldest `limit` UIDs above the cursor so the
/// cursor can advance without gaps. Full syncs take the newest `limit`.
fn plan_uids(found: HashSet<u32>, after: Option<u32>, limit: Option<usize>) -> Vec<u32> {
    let mut uids: Vec<u32> = found
        .into_iter()
        .filter(|uid| after.map_or(true, |last| *uid > last))
        .collect();
    uids.sort_unstable();

    match (after, limit) {
        (Some(_), Some(limit)) => uids.truncate(limit),
        (None, Some(limit)) if uids.len() > limit => {
            uids.drain(..uids.len() - limit);
        }
        _ => {}
    }
    uids
}

/// Splits an `"<folder>:<uid>"` message ID.
fn split_message_id(id: &str) -> Result<(&str, u32)> {
    let (folder, uid) = id
        .rsplit_once(':')
        .ok_or_else(|| ProviderError::InvalidRequest(format!("invalid message id: {}", id)))?;
    let uid = uid
        .parse()
        .map_err(|_| ProviderError::InvalidRequest(format!("invalid UID in {}", id)))?;
    Ok((folder, uid))
}

/// Maps an `async-imap` failure, surfacing server throttling text.
fn map_imap_error(context: &str, err: async_imap::error::Error) -> ProviderError {
    use async_imap::error::Error;
    match err {
        Error::Io(e) => ProviderError::Network(format!("{}: {}", context, e)),
        Error::ConnectionLost => ProviderError::Network(format!("{}: connection lost", context)),
        Error::No(text) | Error::Bad(text) if text.to_uppercase().contains("THROTTLED") => {
            ProviderError::Protocol(format!("THROTTLED: {}", text))
        }
        other => ProviderError::Protocol(format!("{}: {}", context, other)),
    }
}

/// Maps a LOGIN failure. A NO/BAD reply is a rejected credential.
fn map_login_error(err: async_imap::error::Error) -> ProviderError {
    use async_imap::error::Error;
    match err {
        Error::No(text) | Error::Bad(text) if !text.to_uppercase().contains("THROTTLED") => {
            ProviderError::LoginRejected(text)
        }
        other => map_imap_error("IMAP login", other),
    }
}

fn map_smtp_error(err: lettre::transport::smtp::Error) -> ProviderError {
    if err.is_permanent() {
        let text = err.to_string();
        if text.contains("535") || text.to_lowercase().contains("authentication") {
            return ProviderError::LoginRejected(text);
        }
        ProviderError::Protocol(format!("SMTP: {}", text))
    } else if err.is_transient() {
        ProviderError::Protocol(format!("SMTP transient: {}", err))
    } else {
        ProviderError::Network(format!("SMTP: {}", err))
    }
}

fn parse_address(addr: &Addr) -> Address {
    Address {
        email: addr.address().unwrap_or("").to_string(),
        name: addr.name().map(|s| s.to_string()),
    }
}

fn address_list(value: Option<&mail_parser::Address>) -> Vec<Address> {
    value
        .and_then(|addr| addr.as_list())
        .map(|list| list.iter().map(parse_address).collect())
        .unwrap_or_default()
}

/// Reads `\Seen`, `\Flagged` and `\Draft`.
fn parse_flags(fetch: &Fetch) -> (bool, bool, bool) {
    let (mut seen, mut flagged, mut draft) = (false, false, false);
    for flag in fetch.flags() {
        match flag {
            Flag::Seen => seen = true,
            Flag::Flagged => flagged = true,
            Flag::Draft => draft = true,
            _ => {}
        }
    }
    (seen, flagged, draft)
}

/// Builds an [`Email`] from a raw RFC 5322 message.
fn email_from_raw(folder: &str, uid: u32, raw: &[u8], flags: (bool, bool, bool)) -> Option<Email> {
    let message = MessageParser::default().parse(raw)?;
    let external_id = format!("{}:{}", folder, uid);
    let (is_read, is_starred, is_draft) = flags;

    let message_id = message.message_id().map(|s| format!("<{}>", s));
    let thread_root = message
        .references()
        .as_text_list()
        .and_then(|refs| refs.first().map(|s| format!("<{}>", s)))
        .or_else(|| message.in_reply_to().as_text().map(|s| format!("<{}>", s)));

    let body_text = message.body_text(0).map(|s| s.to_string());
    let snippet = body_text
        .as_ref()
        .map(|s| s.chars().take(200).collect())
        .unwrap_or_default();

    Some(Email {
        thread_id: thread_root
            .or_else(|| message_id.clone())
            .unwrap_or_else(|| external_id.clone()),
        external_id,
        message_id,
        from: address_list(message.from())
            .into_iter()
            .next()
            .unwrap_or_else(|| Address::new("unknown@unknown.com")),
        to: address_list(message.to()),
        cc: address_list(message.cc()),
        subject: message.subject().map(|s| s.to_string()),
        body_html: message.body_html(0).map(|s| s.to_string()),
        body_text,
        snippet,
        date: message
            .date()
            .and_then(|d| DateTime::from_timestamp(d.to_timestamp(), 0))
            .unwrap_or_else(Utc::now),
        is_read,
        is_starred,
        is_draft: is_draft || folder.eq_ignore_ascii_case(DRAFTS),
        labels: vec![folder.to_string()],
    })
}

/// Converts a folder name to its conventional IMAP path.
fn folder_path(folder: &str) -> &str {
    match folder.to_uppercase().as_str() {
        "INBOX" => INBOX,
        "SENT" => "Sent",
        "DRAFTS" => DRAFTS,
        "TRASH" => "Trash",
        "ARCHIVE" => "Archive",
        "SPAM" | "JUNK" => "Junk",
        _ => folder,
    }
}

fn parse_mailbox(addr: &Address) -> Result<Mailbox> {
    addr.to_header_value()
        .parse()
        .map_err(|e| ProviderError::InvalidRequest(format!("invalid address {}: {}", addr.email, e)))
}

/// Builds a lettre message with an explicit Message-ID.
fn build_message(from: &str, email: &OutgoingEmail, message_id: &str) -> Result<Message> {
    let from: Mailbox = from
        .parse()
        .map_err(|e| ProviderError::InvalidRequest(format!("invalid from address: {}", e)))?;
    let mut builder = MessageBuilder::new()
        .from(from)
        .subject(email.subject.clone())
        .message_id(Some(message_id.to_string()));

    for addr in &email.to {
        builder = builder.to(parse_mailbox(addr)?);
    }
    for addr in &email.cc {
        builder = builder.cc(parse_mailbox(addr)?);
    }
    for addr in &email.bcc {
        builder = builder.bcc(parse_mailbox(addr)?);
    }
    if let Some(reply_to) = &email.in_reply_to {
        builder = builder
            .in_reply_to(reply_to.clone())
            .references(reply_to.clone());
    }

    let result = match &email.body_html {
        Some(html) => builder.multipart(
            MultiPart::alternative()
                .singlepart(SinglePart::plain(email.body_text.clone()))
                .singlepart(SinglePart::html(html.clone())),
        ),
        None => builder.singlepart(SinglePart::plain(email.body_text.clone())),
    };
    result.map_err(|e| ProviderError::InvalidRequest(format!("failed to build message: {}", e)))
}

/// SMTP envelope for a stored raw message.
fn envelope_for(message: &ParsedMessage) -> Result<Envelope> {
    let parse = |a: Address| {
        a.email
            .parse::<lettre::Address>()
            .map_err(|e| ProviderError::InvalidRequest(format!("invalid address {}: {}", a.email, e)))
    };
    let from = address_list(message.from())
        .into_iter()
        .next()
        .map(parse)
        .transpose()?;
    let recipients = address_list(message.to())
        .into_iter()
        .chain(address_list(message.cc()))
        .chain(address_list(message.bcc()))
        .map(parse)
        .collect::<Result<Vec<_>>>()?;
    Envelope::new(from, recipients)
        .map_err(|e| ProviderError::InvalidRequest(format!("invalid envelope: {}", e)))
}

fn new_message_id(from: &str) -> String {
    let domain = from.rsplit_once('@').map(|(_, d)| d).unwrap_or("localhost");
    format!("<{}@{}>", uuid::Uuid::new_v4(), domain)
}

/// Generic IMAP/SMTP adapter with optional CalDAV/CardDAV.
pub struct GenericAdapter {
    settings: ServerSettings,
    imap: Login,
    smtp: Login,
    dav: DavClient,
    timeout: Duration,
    test_timeout: Duration,
    full_sync_limit: u32,
}

impl GenericAdapter {
    /// Creates an adapter. SMTP and DAV logins fall back to the IMAP login.
    pub fn new(
        client: reqwest::Client,
        settings: ServerSettings,
        imap: Login,
        smtp: Option<Login>,
        dav: Option<Login>,
        options: &AdapterOptions,
    ) -> Self {
        let dav = DavClient::new(
            client,
            dav.unwrap_or_else(|| imap.clone()),
            options.request_timeout,
        );
        Self {
            settings,
            smtp: smtp.unwrap_or_else(|| imap.clone()),
            imap,
            dav,
            timeout: options.request_timeout,
            test_timeout: options.test_timeout,
            full_sync_limit: options.full_sync_limit,
        }
    }

    fn account(&self) -> &str {
        self.imap.username.expose()
    }

    /// Runs a unit of IMAP work under the request timeout.
    async fn bounded<T>(&self, work: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.timeout, work)
            .await
            .map_err(|_| ProviderError::Timeout(self.timeout))?
    }

    async fn tls_wrap(&self, tcp: TcpStream) -> Result<Compat<TlsStream<TcpStream>>> {
        let config = ClientConfig::builder()
            .with_root_certificates(tokio_rustls::rustls::RootCertStore::from_iter(
                webpki_roots::TLS_SERVER_ROOTS.iter().cloned(),
            ))
            .with_no_client_auth();

        let connector = TlsConnector::from(Arc::new(config));
        let server_name = ServerName::try_from(self.settings.imap_host.clone())
            .map_err(|e| ProviderError::InvalidRequest(format!("invalid server name: {}", e)))?;

        let tls = connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| ProviderError::Network(format!("TLS handshake failed: {}", e)))?;
        Ok(tls.compat())
    }

    /// Issues STARTTLS on a plain connection before the TLS handshake.
    async fn starttls(tcp: TcpStream) -> Result<TcpStream> {
        let io_err = |e: std::io::Error| ProviderError::Network(format!("STARTTLS: {}", e));
        let mut reader = BufReader::new(tcp);
        let mut line = String::new();

        reader.read_line(&mut line).await.map_err(io_err)?;
        if !line.starts_with("* OK") {
            return Err(ProviderError::Protocol(format!("unexpected greeting: {}", line.trim())));
        }

        reader
            .get_mut()
            .write_all(b"a0 STARTTLS\r\n")
            .await
            .map_err(io_err)?;
        loop {
            line.clear();
            if reader.read_line(&mut line).await.map_err(io_err)? == 0 {
                return Err(ProviderError::Network("STARTTLS: connection closed".to_string()));
            }
            if let Some(status) = line.strip_prefix("a0 ") {
                if status.starts_with("OK") {
                    break;
                }
                return Err(ProviderError::Protocol(format!("STARTTLS refused: {}", status.trim())));
            }
        }
        Ok(reader.into_inner())
    }

    /// Connects and logs in.
    async fn connect(&self) -> Result<ImapSession> {
        let tcp = TcpStream::connect((self.settings.imap_host.as_str(), self.settings.imap_port))
            .await
            .map_err(|e| ProviderError::Network(format!("TCP connect failed: {}", e)))?;
        let tcp = match self.settings.imap_security {
            Security::Tls => tcp,
            Security::StartTls => Self::starttls(tcp).await?,
        };
        let stream = self.tls_wrap(tcp).await?;

        let client = async_imap::Client::new(stream);
        client
            .login(self.imap.username.expose(), self.imap.password.expose())
            .await
            .map_err(|(e, _)| map_login_error(e))
    }

    async fn logout(mut session: ImapSession) {
        if let Err(e) = session.logout().await {
            tracing::debug!(error = %e, "IMAP logout failed");
        }
    }

    /// Fetches full messages for the given UIDs of the selected folder.
    async fn fetch_emails(session: &mut ImapSession, folder: &str, uids: &[u32]) -> Result<Vec<Email>> {
        let mut emails = Vec::with_capacity(uids.len());
        for chunk in uids.chunks(FETCH_CHUNK) {
            let set = chunk.iter().map(u32::to_string).collect::<Vec<_>>().join(",");
            let stream = session
                .uid_fetch(&set, FETCH_ITEMS)
                .await
                .map_err(|e| map_imap_error("FETCH", e))?;
            futures::pin_mut!(stream);
            while let Some(fetch) = stream.next().await {
                let fetch = fetch.map_err(|e| map_imap_error("FETCH", e))?;
                let (Some(uid), Some(body)) = (fetch.uid, fetch.body()) else {
                    continue;
                };
                match email_from_raw(folder, uid, body, parse_flags(&fetch)) {
                    Some(email) => emails.push(email),
                    None => tracing::warn!(uid, folder, "skipping unparseable message"),
                }
            }
        }
        Ok(emails)
    }

    /// Fetches the raw bytes of one message of the selected folder.
    async fn fetch_raw(session: &mut ImapSession, uid: u32) -> Result<Option<Vec<u8>>> {
        let stream = session
            .uid_fetch(uid.to_string(), "(UID BODY.PEEK[])")
            .await
            .map_err(|e| map_imap_error("FETCH", e))?;
        futures::pin_mut!(stream);
        let mut raw = None;
        while let Some(fetch) = stream.next().await {
            let fetch = fetch.map_err(|e| map_imap_error("FETCH", e))?;
            if fetch.uid == Some(uid) {
                raw = fetch.body().map(<[u8]>::to_vec);
            }
        }
        Ok(raw)
    }

    async fn store(session: &mut ImapSession, uids: &str, command: &str) -> Result<()> {
        let stream = session
            .uid_store(uids, command)
            .await
            .map_err(|e| map_imap_error("STORE", e))?;
        futures::pin_mut!(stream);
        while let Some(result) = stream.next().await {
            result.map_err(|e| map_imap_error("STORE", e))?;
        }
        Ok(())
    }

    async fn set_seen(&self, ids: &[String], seen: bool) -> Result<()> {
        let command = if seen { "+FLAGS (\\Seen)" } else { "-FLAGS (\\Seen)" };
        let ids = self.normalize_ids(ids);
        self.bounded(async {
            let mut session = self.connect().await?;
            for id in &ids {
                let (folder, uid) = split_message_id(id)?;
                session
                    .select(folder_path(folder))
                    .await
                    .map_err(|e| map_imap_error("SELECT", e))?;
                Self::store(&mut session, &uid.to_string(), command).await?;
            }
            Self::logout(session).await;
            Ok(())
        })
        .await
    }

    /// Finds a draft by Message-ID in the Drafts folder.
    async fn find_draft(session: &mut ImapSession, id: &str) -> Result<u32> {
        session
            .select(DRAFTS)
            .await
            .map_err(|e| map_imap_error("SELECT", e))?;
        let query = format!("HEADER Message-ID \"{}\"", id.replace('"', ""));
        let found = session
            .uid_search(&query)
            .await
            .map_err(|e| map_imap_error("SEARCH", e))?;
        found
            .into_iter()
            .max()
            .ok_or_else(|| ProviderError::NotFound(format!("draft {}", id)))
    }

    async fn smtp_transport(&self) -> Result<AsyncSmtpTransport<Tokio1Executor>> {
        let credentials = SmtpCredentials::new(
            self.smtp.username.expose().to_string(),
            self.smtp.password.expose().to_string(),
        );
        let builder = match self.settings.smtp_security {
            Security::Tls => AsyncSmtpTransport::<Tokio1Executor>::relay(&self.settings.smtp_host),
            Security::StartTls => {
                AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&self.settings.smtp_host)
            }
        }
        .map_err(|e| ProviderError::InvalidRequest(format!("SMTP relay error: {}", e)))?;

        Ok(builder
            .credentials(credentials)
            .port(self.settings.smtp_port)
            .timeout(Some(self.timeout))
            .build())
    }
}

#[async_trait]
impl MailboxAdapter for GenericAdapter {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Generic
    }

    async fn get_user_info(&self) -> Result<UserInfo> {
        self.bounded(async {
            let session = self.connect().await?;
            Self::logout(session).await;
            Ok(())
        })
        .await?;
        Ok(UserInfo {
            email: self.account().to_string(),
            display_name: None,
        })
    }

    async fn list_threads(&self, params: &ListThreadsParams) -> Result<ThreadPage> {
        let folder = params.folder.as_deref().unwrap_or(INBOX);
        let before = match &params.page_token {
            Some(token) => Some(token.parse::<u32>().map_err(|_| {
                ProviderError::InvalidRequest(format!("invalid page token: {}", token))
            })?),
            None => None,
        };

        self.bounded(async {
            let mut session = self.connect().await?;
            session
                .select(folder_path(folder))
                .await
                .map_err(|e| map_imap_error("SELECT", e))?;
            let query = match before {
                Some(uid) => format!("UID 1:{}", uid),
                None => "ALL".to_string(),
            };
            let found = session
                .uid_search(&query)
                .await
                .map_err(|e| map_imap_error("SEARCH", e))?;

            let mut uids: Vec<u32> = found
                .into_iter()
                .filter(|uid| before.map_or(true, |b| *uid <= b))
                .collect();
            uids.sort_unstable_by(|a, b| b.cmp(a));
            let more = uids.len() > params.max_results as usize;
            uids.truncate(params.max_results as usize);

            let emails = Self::fetch_emails(&mut session, folder, &uids).await?;
            Self::logout(session).await;

            let next_page_token = match uids.last() {
                Some(oldest) if more && *oldest > 1 => Some((oldest - 1).to_string()),
                _ => None,
            };
            let mut threads: Vec<ThreadSummary> = emails
                .into_iter()
                .map(|e| ThreadSummary {
                    thread_id: e.thread_id,
                    subject: e.subject,
                    snippet: e.snippet,
                    from: Some(e.from),
                    last_message_at: Some(e.date),
                    unread: !e.is_read,
                })
                .collect();
            threads.sort_by(|a, b| b.last_message_at.cmp(&a.last_message_at));

            Ok(ThreadPage {
                threads,
                next_page_token,
            })
        })
        .await
    }

    async fn get_message(&self, id: &str) -> Result<Email> {
        let (folder, uid) = split_message_id(id.trim())?;
        self.bounded(async {
            let mut session = self.connect().await?;
            session
                .select(folder_path(folder))
                .await
                .map_err(|e| map_imap_error("SELECT", e))?;
            let email = Self::fetch_emails(&mut session, folder, &[uid]).await?;
            Self::logout(session).await;
            email
                .into_iter()
                .next()
                .ok_or_else(|| ProviderError::NotFound(format!("message {}", id)))
        })
        .await
    }

    async fn send_email(&self, email: &OutgoingEmail) -> Result<String> {
        let message_id = new_message_id(self.account());
        let message = build_message(self.account(), email, &message_id)?;
        let mailer = self.smtp_transport().await?;
        mailer.send(message).await.map_err(map_smtp_error)?;

        tracing::info!(message_id = %message_id, "email sent via SMTP");
        Ok(message_id)
    }

    async fn sync_emails(&self, params: &SyncParams) -> Result<SyncBatch<Email>> {
        let cursor = params.resume_cursor().map(UidCursor::parse).transpose()?;
        let limit = match cursor {
            Some(_) => params.max_items,
            None => Some(params.max_items.unwrap_or(self.full_sync_limit)),
        };

        self.bounded(async {
            let mut session = self.connect().await?;
            let mailbox = session
                .select(INBOX)
                .await
                .map_err(|e| map_imap_error("SELECT", e))?;
            let uid_validity = mailbox.uid_validity.unwrap_or(0);

            if let Some(cursor) = cursor {
                if cursor.uid_validity != uid_validity {
                    Self::logout(session).await;
                    return Err(ProviderError::CursorInvalidated(format!(
                        "UIDVALIDITY changed from {} to {}",
                        cursor.uid_validity, uid_validity
                    )));
                }
            }

            let after = cursor.map(|c| c.last_uid);
            let query = match after {
                Some(last) => format!("UID {}:*", last.saturating_add(1)),
                None => "ALL".to_string(),
            };
            let found = session
                .uid_search(&query)
                .await
                .map_err(|e| map_imap_error("SEARCH", e))?;
            let uids = plan_uids(found, after, limit.map(|l| l as usize));

            let items = Self::fetch_emails(&mut session, INBOX, &uids).await?;
            Self::logout(session).await;

            let last_uid = uids.last().copied().or(after).unwrap_or(0);
            let next = UidCursor {
                uid_validity,
                last_uid,
            };
            tracing::debug!(fetched = items.len(), cursor = %next, "IMAP sync pass");
            Ok(SyncBatch::new(items, Vec::new(), Some(next.to_string())))
        })
        .await
    }

    async fn get_labels(&self) -> Result<Vec<Folder>> {
        self.bounded(async {
            let mut session = self.connect().await?;
            let mut names = Vec::new();
            {
                let stream = session
                    .list(Some(""), Some("*"))
                    .await
                    .map_err(|e| map_imap_error("LIST", e))?;
                futures::pin_mut!(stream);
                while let Some(name) = stream.next().await {
                    let name = name.map_err(|e| map_imap_error("LIST", e))?;
                    names.push(name.name().to_string());
                }
            }
            Self::logout(session).await;

            Ok(names
                .into_iter()
                .map(|name| Folder {
                    is_system: SYSTEM_FOLDERS
                        .iter()
                        .any(|s| s.eq_ignore_ascii_case(&name)),
                    external_id: name.clone(),
                    name,
                })
                .collect())
        })
        .await
    }

    async fn create_label(&self, name: &str) -> Result<Folder> {
        self.bounded(async {
            let mut session = self.connect().await?;
            session
                .create(name)
                .await
                .map_err(|e| map_imap_error("CREATE", e))?;
            Self::logout(session).await;
            Ok(Folder {
                external_id: name.to_string(),
                name: name.to_string(),
                is_system: false,
            })
        })
        .await
    }

    async fn mark_as_read(&self, ids: &[String]) -> Result<()> {
        self.set_seen(ids, true).await
    }

    async fn mark_as_unread(&self, ids: &[String]) -> Result<()> {
        self.set_seen(ids, false).await
    }

    /// Saves the draft with APPEND. The draft ID is its Message-ID.
    async fn create_draft(&self, email: &OutgoingEmail) -> Result<Draft> {
        let message_id = new_message_id(self.account());
        let raw = build_message(self.account(), email, &message_id)?.formatted();

        self.bounded(async {
            let mut session = self.connect().await?;
            session
                .append(DRAFTS, Some("(\\Seen \\Draft)"), None, &raw)
                .await
                .map_err(|e| map_imap_error("APPEND", e))?;
            Self::logout(session).await;
            Ok(())
        })
        .await?;

        let message = email_from_raw(DRAFTS, 0, &raw, (true, false, true)).map(|mut email| {
            email.external_id = message_id.clone();
            email
        });
        Ok(Draft {
            id: message_id,
            message,
        })
    }

    async fn get_draft(&self, id: &str) -> Result<Draft> {
        let id = id.trim();
        self.bounded(async {
            let mut session = self.connect().await?;
            let uid = Self::find_draft(&mut session, id).await?;
            let message = Self::fetch_emails(&mut session, DRAFTS, &[uid])
                .await?
                .into_iter()
                .next();
            Self::logout(session).await;
            Ok(Draft {
                id: id.to_string(),
                message,
            })
        })
        .await
    }

    /// Sends the stored draft as-is, then removes it from Drafts.
    async fn send_draft(&self, id: &str) -> Result<String> {
        let id = id.trim();
        let mailer = self.smtp_transport().await?;

        self.bounded(async {
            let mut session = self.connect().await?;
            let uid = Self::find_draft(&mut session, id).await?;
            let raw = Self::fetch_raw(&mut session, uid)
                .await?
                .ok_or_else(|| ProviderError::NotFound(format!("draft {}", id)))?;
            let envelope = {
                let parsed = MessageParser::default().parse(&raw).ok_or_else(|| {
                    ProviderError::Parse(format!("draft {} is not a message", id))
                })?;
                envelope_for(&parsed)?
            };

            mailer
                .send_raw(&envelope, &raw)
                .await
                .map_err(map_smtp_error)?;

            Self::store(&mut session, &uid.to_string(), "+FLAGS (\\Deleted)").await?;
            {
                let expunged = session
                    .expunge()
                    .await
                    .map_err(|e| map_imap_error("EXPUNGE", e))?;
                futures::pin_mut!(expunged);
                while let Some(result) = expunged.next().await {
                    result.map_err(|e| map_imap_error("EXPUNGE", e))?;
                }
            }
            Self::logout(session).await;

            tracing::info!(message_id = %id, "draft sent via SMTP");
            Ok(id.to_string())
        })
        .await
    }

    /// Counts the inbox.
    async fn get_email_count(&self) -> Result<u64> {
        self.bounded(async {
            let mut session = self.connect().await?;
            let mailbox = session
                .examine(INBOX)
                .await
                .map_err(|e| map_imap_error("EXAMINE", e))?;
            Self::logout(session).await;
            Ok(u64::from(mailbox.exists))
        })
        .await
    }

    async fn test_connection(&self) -> bool {
        let check = async {
            let mut session = self.connect().await?;
            session
                .noop()
                .await
                .map_err(|e| map_imap_error("NOOP", e))?;
            Self::logout(session).await;
            Ok::<_, ProviderError>(())
        };
        match tokio::time::timeout(self.test_timeout, check).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::debug!(error = %e, "IMAP connection test failed");
                false
            }
            Err(_) => false,
        }
    }

    /// Bare UIDs are taken to be inbox UIDs.
    fn normalize_ids(&self, ids: &[String]) -> Vec<String> {
        normalize_with(ids, |id| {
            if id.bytes().all(|b| b.is_ascii_digit()) {
                format!("{}:{}", INBOX, id)
            } else {
                id.to_string()
            }
        })
    }

    async fn sync_calendar(&self, params: &SyncParams) -> Result<SyncBatch<CalendarEvent>> {
        match &self.settings.caldav_url {
            Some(url) => self.dav.sync_calendar(url, params).await,
            None => Err(ProviderError::Unsupported(
                "no CalDAV collection configured".to_string(),
            )),
        }
    }

    async fn sync_contacts(&self, params: &SyncParams) -> Result<SyncBatch<Contact>> {
        match &self.settings.carddav_url {
            Some(url) => self.dav.sync_contacts(url, params).await,
            None => Err(ProviderError::Unsupported(
                "no CardDAV collection configured".to_string(),
            )),
        }
    }
}
