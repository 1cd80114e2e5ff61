//! Microsoft Graph provider adapter.
//!
//! Mail, calendar and contacts all sync through Graph delta queries. The final
//! `@odata.deltaLink` of a round is stored verbatim as the cursor; an
//! incremental sync simply GETs it again. Entries carrying `@removed` are
//! reported as deletions.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;
use serde_json::json;

use super::http::ApiClient;
use super::traits::normalize_with;
use super::{
    AdapterOptions, ListThreadsParams, MailboxAdapter, OutgoingEmail, ProviderError, Result,
    SyncBatch, SyncParams, ThreadPage, ThreadSummary, UserInfo,
};
use crate::domain::{Address, CalendarEvent, Contact, Draft, Email, Folder, ProviderType};
use crate::storage::Secret;

/// Default Graph base URL for the signed-in user.
pub const GRAPH_API_BASE: &str = "https://graph.microsoft.com/v1.0/me";

const MESSAGE_FIELDS: &str = "subject,from,toRecipients,ccRecipients,receivedDateTime,isRead,\
isDraft,flag,bodyPreview,body,conversationId,internetMessageId,parentFolderId";

/// Calendar delta window around now.
const CALENDAR_PAST_DAYS: i64 = 30;
const CALENDAR_FUTURE_DAYS: i64 = 365;

const SYSTEM_FOLDERS: &[&str] = &[
    "Inbox",
    "Sent Items",
    "Drafts",
    "Deleted Items",
    "Junk Email",
    "Archive",
    "Outbox",
];

/// One page of a Graph collection or delta query.
#[derive(Debug, Deserialize)]
struct GraphPage<T> {
    #[serde(default = "Vec::new")]
    value: Vec<T>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
    #[serde(rename = "@odata.deltaLink")]
    delta_link: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphUser {
    mail: Option<String>,
    user_principal_name: Option<String>,
    display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphMessage {
    id: String,
    conversation_id: Option<String>,
    internet_message_id: Option<String>,
    subject: Option<String>,
    body_preview: Option<String>,
    body: Option<GraphBody>,
    from: Option<GraphRecipient>,
    #[serde(default)]
    to_recipients: Vec<GraphRecipient>,
    #[serde(default)]
    cc_recipients: Vec<GraphRecipient>,
    received_date_time: Option<DateTime<Utc>>,
    #[serde(default)]
    is_read: bool,
    #[serde(default)]
    is_draft: bool,
    flag: Option<GraphFlag>,
    parent_folder_id: Option<String>,
    #[serde(rename = "@removed")]
    removed: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphBody {
    content_type: Option<String>,
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphRecipient {
    email_address: GraphEmailAddress,
}

#[derive(Debug, Deserialize)]
struct GraphEmailAddress {
    name: Option<String>,
    address: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphFlag {
    flag_status: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphFolder {
    id: String,
    display_name: String,
    total_item_count: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphEvent {
    id: String,
    subject: Option<String>,
    body_preview: Option<String>,
    location: Option<GraphLocation>,
    start: Option<GraphDateTime>,
    end: Option<GraphDateTime>,
    #[serde(default)]
    is_all_day: bool,
    #[serde(default)]
    is_cancelled: bool,
    show_as: Option<String>,
    #[serde(rename = "@removed")]
    removed: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphLocation {
    display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphDateTime {
    date_time: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphContact {
    id: String,
    display_name: Option<String>,
    #[serde(default)]
    email_addresses: Vec<GraphEmailAddress>,
    #[serde(default)]
    business_phones: Vec<String>,
    #[serde(default)]
    home_phones: Vec<String>,
    mobile_phone: Option<String>,
    company_name: Option<String>,
    #[serde(rename = "@removed")]
    removed: Option<serde_json::Value>,
}

/// Microsoft Graph adapter.
#[derive(Debug, Clone)]
pub struct MicrosoftAdapter {
    graph: ApiClient,
    test_timeout: Duration,
    full_sync_limit: u32,
}

impl MicrosoftAdapter {
    /// Creates an adapter authenticated with the given access token.
    pub fn new(client: reqwest::Client, token: Secret, options: &AdapterOptions) -> Self {
        let graph = ApiClient::new(client, &options.graph_base, token, options.request_timeout)
            .with_header("prefer", r#"outlook.timezone="UTC""#)
            .with_header("prefer", "odata.maxpagesize=50")
            .with_header("prefer", r#"IdType="ImmutableId""#);
        Self {
            graph,
            test_timeout: options.test_timeout,
            full_sync_limit: options.full_sync_limit,
        }
    }

    async fn me(&self) -> Result<GraphUser> {
        self.graph.get("").await
    }

    /// Maps a logical folder name to a Graph well-known folder name.
    fn folder_id(folder: &str) -> String {
        match folder.to_uppercase().as_str() {
            "INBOX" => "inbox".to_string(),
            "SENT" => "sentitems".to_string(),
            "DRAFTS" => "drafts".to_string(),
            "TRASH" => "deleteditems".to_string(),
            "SPAM" | "JUNK" => "junkemail".to_string(),
            "ARCHIVE" => "archive".to_string(),
            _ => folder.to_string(),
        }
    }

    /// Runs one delta round.
    ///
    /// Follows `@odata.nextLink` until the `@odata.deltaLink`, or until `limit`
    /// entries were read, in which case the pending next link becomes the
    /// cursor so the following sync resumes the same round.
    async fn delta<T, F>(
        &self,
        params: &SyncParams,
        initial: String,
        limit: Option<u32>,
        mut on_entry: F,
    ) -> Result<Option<String>>
    where
        T: for<'de> Deserialize<'de>,
        F: FnMut(T),
    {
        let mut url = match params.resume_cursor() {
            Some(link) if link.starts_with("http") => link.to_string(),
            Some(link) => {
                return Err(ProviderError::CursorInvalidated(format!(
                    "not a delta link: {}",
                    link
                )))
            }
            None => initial,
        };

        let mut seen: u32 = 0;
        loop {
            let page: GraphPage<T> = self.graph.get(&url).await?;
            seen += page.value.len() as u32;
            page.value.into_iter().for_each(&mut on_entry);

            match (page.delta_link, page.next_link) {
                (Some(delta), _) => return Ok(Some(delta)),
                (None, Some(next)) if limit.is_some_and(|l| seen >= l) => return Ok(Some(next)),
                (None, Some(next)) => url = next,
                (None, None) => {
                    tracing::warn!("delta query ended without a deltaLink");
                    return Ok(None);
                }
            }
        }
    }

    fn address(recipient: &GraphRecipient) -> Address {
        Address {
            email: recipient.email_address.address.clone().unwrap_or_default(),
            name: recipient.email_address.name.clone(),
        }
    }

    /// Converts a Graph message to our domain Email type.
    fn message_to_email(msg: GraphMessage) -> Email {
        let (body_text, body_html) = match msg.body {
            Some(GraphBody {
                content_type,
                content,
            }) => match content_type.as_deref().map(str::to_lowercase).as_deref() {
                Some("html") => (None, content),
                _ => (content, None),
            },
            None => (None, None),
        };

        Email {
            thread_id: msg.conversation_id.unwrap_or_else(|| msg.id.clone()),
            external_id: msg.id,
            message_id: msg.internet_message_id,
            from: msg
                .from
                .as_ref()
                .map(Self::address)
                .unwrap_or_else(|| Address::new("unknown@unknown.com")),
            to: msg.to_recipients.iter().map(Self::address).collect(),
            cc: msg.cc_recipients.iter().map(Self::address).collect(),
            subject: msg.subject,
            body_text,
            body_html,
            snippet: msg.body_preview.unwrap_or_default(),
            date: msg.received_date_time.unwrap_or_else(Utc::now),
            is_read: msg.is_read,
            is_starred: msg
                .flag
                .and_then(|f| f.flag_status)
                .is_some_and(|s| s == "flagged"),
            is_draft: msg.is_draft,
            labels: msg.parent_folder_id.into_iter().collect(),
        }
    }

    /// Graph `message` resource for an outgoing email.
    fn outgoing_message(email: &OutgoingEmail) -> serde_json::Value {
        let recipients = |addrs: &[Address]| -> Vec<serde_json::Value> {
            addrs
                .iter()
                .map(|a| json!({ "emailAddress": { "address": a.email, "name": a.name } }))
                .collect()
        };
        let body = match &email.body_html {
            Some(html) => json!({ "contentType": "HTML", "content": html }),
            None => json!({ "contentType": "Text", "content": email.body_text }),
        };
        json!({
            "subject": email.subject,
            "body": body,
            "toRecipients": recipients(&email.to),
            "ccRecipients": recipients(&email.cc),
            "bccRecipients": recipients(&email.bcc),
        })
    }

    /// Parses a Graph `dateTimeTimeZone` value. Requests ask for UTC.
    fn parse_date_time(value: &GraphDateTime) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&value.date_time)
            .map(|d| d.with_timezone(&Utc))
            .ok()
            .or_else(|| {
                NaiveDateTime::parse_from_str(&value.date_time, "%Y-%m-%dT%H:%M:%S%.f")
                    .ok()
                    .map(|d| d.and_utc())
            })
    }

    fn event_from(event: GraphEvent) -> CalendarEvent {
        CalendarEvent {
            starts_at: event.start.as_ref().and_then(Self::parse_date_time),
            ends_at: event.end.as_ref().and_then(Self::parse_date_time),
            external_id: event.id,
            summary: event.subject,
            description: event.body_preview,
            location: event.location.and_then(|l| l.display_name),
            all_day: event.is_all_day,
            status: event.show_as,
        }
    }

    fn contact_from(contact: GraphContact) -> Contact {
        let mut phones = contact.mobile_phone.into_iter().collect::<Vec<_>>();
        phones.extend(contact.business_phones);
        phones.extend(contact.home_phones);
        Contact {
            external_id: contact.id,
            display_name: contact.display_name,
            emails: contact
                .email_addresses
                .into_iter()
                .filter_map(|e| e.address)
                .collect(),
            phones,
            organization: contact.company_name,
        }
    }

    async fn set_read(&self, ids: &[String], read: bool) -> Result<()> {
        for id in self.normalize_ids(ids) {
            self.graph
                .patch_no_response(&format!("/messages/{}", id), &json!({ "isRead": read }))
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl MailboxAdapter for MicrosoftAdapter {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Microsoft
    }

    async fn get_user_info(&self) -> Result<UserInfo> {
        let user = self.me().await?;
        let email = user
            .mail
            .or(user.user_principal_name)
            .ok_or_else(|| ProviderError::Parse("user has no mail address".to_string()))?;
        Ok(UserInfo {
            email,
            display_name: user.display_name,
        })
    }

    async fn list_threads(&self, params: &ListThreadsParams) -> Result<ThreadPage> {
        let page: GraphPage<GraphMessage> = match &params.page_token {
            Some(next_link) => self.graph.get(next_link).await?,
            None => {
                let folder = Self::folder_id(params.folder.as_deref().unwrap_or("INBOX"));
                let query = [
                    ("$top", params.max_results.to_string()),
                    ("$select", MESSAGE_FIELDS.to_string()),
                    ("$orderby", "receivedDateTime desc".to_string()),
                ];
                self.graph
                    .get_with(&format!("/mailFolders/{}/messages", folder), &query)
                    .await?
            }
        };

        let threads = page
            .value
            .into_iter()
            .map(|m| ThreadSummary {
                thread_id: m.conversation_id.clone().unwrap_or_else(|| m.id.clone()),
                subject: m.subject.clone(),
                snippet: m.body_preview.clone().unwrap_or_default(),
                from: m.from.as_ref().map(Self::address),
                last_message_at: m.received_date_time,
                unread: !m.is_read,
            })
            .collect();

        Ok(ThreadPage {
            threads,
            next_page_token: page.next_link,
        })
    }

    async fn get_message(&self, id: &str) -> Result<Email> {
        let message: GraphMessage = match self.graph.get(&format!("/messages/{}", id.trim())).await
        {
            Err(ProviderError::Http { status: 404, .. }) => {
                return Err(ProviderError::NotFound(format!("message {}", id)))
            }
            other => other?,
        };
        Ok(Self::message_to_email(message))
    }

    /// Graph's `sendMail` reports no message ID, so mail goes out through a
    /// draft and the draft ID is returned.
    async fn send_email(&self, email: &OutgoingEmail) -> Result<String> {
        let draft = self.create_draft(email).await?;
        self.send_draft(&draft.id).await
    }

    async fn sync_emails(&self, params: &SyncParams) -> Result<SyncBatch<Email>> {
        let initial = self.graph.url(&format!(
            "/mailFolders/inbox/messages/delta?$select={}",
            MESSAGE_FIELDS
        ));
        let limit = match params.resume_cursor() {
            Some(_) => None,
            None => Some(params.max_items.unwrap_or(self.full_sync_limit)),
        };

        let mut items = Vec::new();
        let mut deleted = Vec::new();
        let next_cursor = self
            .delta(params, initial, limit, |msg: GraphMessage| {
                if msg.removed.is_some() {
                    deleted.push(msg.id);
                } else {
                    items.push(Self::message_to_email(msg));
                }
            })
            .await?;

        Ok(SyncBatch::new(items, deleted, next_cursor))
    }

    async fn get_labels(&self) -> Result<Vec<Folder>> {
        let page: GraphPage<GraphFolder> =
            self.graph.get_with("/mailFolders", &[("$top", "100")]).await?;
        Ok(page
            .value
            .into_iter()
            .map(|f| Folder {
                is_system: SYSTEM_FOLDERS.contains(&f.display_name.as_str()),
                external_id: f.id,
                name: f.display_name,
            })
            .collect())
    }

    async fn create_label(&self, name: &str) -> Result<Folder> {
        let folder: GraphFolder = self
            .graph
            .post("/mailFolders", &json!({ "displayName": name }))
            .await?;
        Ok(Folder {
            external_id: folder.id,
            name: folder.display_name,
            is_system: false,
        })
    }

    async fn mark_as_read(&self, ids: &[String]) -> Result<()> {
        self.set_read(ids, true).await
    }

    async fn mark_as_unread(&self, ids: &[String]) -> Result<()> {
        self.set_read(ids, false).await
    }

    async fn create_draft(&self, email: &OutgoingEmail) -> Result<Draft> {
        let message: GraphMessage = self
            .graph
            .post("/messages", &Self::outgoing_message(email))
            .await?;
        Ok(Draft {
            id: message.id.clone(),
            message: Some(Self::message_to_email(message)),
        })
    }

    async fn get_draft(&self, id: &str) -> Result<Draft> {
        let message: GraphMessage = self.graph.get(&format!("/messages/{}", id.trim())).await?;
        Ok(Draft {
            id: message.id.clone(),
            message: Some(Self::message_to_email(message)),
        })
    }

    async fn send_draft(&self, id: &str) -> Result<String> {
        let id = id.trim();
        self.graph
            .post_no_response(&format!("/messages/{}/send", id), &json!({}))
            .await?;
        tracing::info!(message_id = %id, "email sent via Graph");
        Ok(id.to_string())
    }

    /// Counts the inbox; Graph has no mailbox-wide total.
    async fn get_email_count(&self) -> Result<u64> {
        let folder: GraphFolder = self.graph.get("/mailFolders/inbox").await?;
        Ok(folder.total_item_count.unwrap_or(0))
    }

    async fn test_connection(&self) -> bool {
        matches!(
            tokio::time::timeout(self.test_timeout, self.me()).await,
            Ok(Ok(_))
        )
    }

    fn normalize_ids(&self, ids: &[String]) -> Vec<String> {
        normalize_with(ids, str::to_string)
    }

    async fn sync_calendar(&self, params: &SyncParams) -> Result<SyncBatch<CalendarEvent>> {
        let now = Utc::now();
        let start = now - chrono::Duration::days(CALENDAR_PAST_DAYS);
        let end = now + chrono::Duration::days(CALENDAR_FUTURE_DAYS);
        let initial = self.graph.url(&format!(
            "/calendarView/delta?startDateTime={}&endDateTime={}",
            start.format("%Y-%m-%dT%H:%M:%SZ"),
            end.format("%Y-%m-%dT%H:%M:%SZ")
        ));

        let mut items = Vec::new();
        let mut deleted = Vec::new();
        let next_cursor = self
            .delta(params, initial, None, |event: GraphEvent| {
                if event.removed.is_some() || event.is_cancelled {
                    deleted.push(event.id);
                } else {
                    items.push(Self::event_from(event));
                }
            })
            .await?;

        Ok(SyncBatch::new(items, deleted, next_cursor))
    }

    async fn sync_contacts(&self, params: &SyncParams) -> Result<SyncBatch<Contact>> {
        let initial = self.graph.url("/contacts/delta");

        let mut items = Vec::new();
        let mut deleted = Vec::new();
        let next_cursor = self
            .delta(params, initial, None, |contact: GraphContact| {
                if contact.removed.is_some() {
                    deleted.push(contact.id);
                } else {
                    items.push(Self::contact_from(contact));
                }
            })
            .await?;

        Ok(SyncBatch::new(items, deleted, next_cursor))
    }
}
