//! Google provider adapter.
//!
//! Drives a Google account through three REST APIs with one OAuth access token:
//!
//! - Gmail API v1 for mail (`users.history.list` for incremental sync, the
//!   profile `historyId` as the cursor)
//! - Calendar API v3 `events.list` with `syncToken`
//! - People API v1 `connections.list` with `requestSyncToken`

use std::time::Duration;

use async_trait::async_trait;
use base64::prelude::*;
use chrono::{DateTime, NaiveDate, Utc};
use futures::{stream, StreamExt};
use serde::{Deserialize, Serialize};

use super::http::ApiClient;
use super::traits::normalize_with;
use super::{
    AdapterOptions, ListThreadsParams, MailboxAdapter, OutgoingEmail, ProviderError, Result,
    SyncBatch, SyncParams, ThreadPage, ThreadSummary, UserInfo,
};
use crate::domain::{Address, CalendarEvent, Contact, Draft, Email, Folder, ProviderType};
use crate::storage::Secret;

const GMAIL_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1/users/me";
const CALENDAR_API_BASE: &str = "https://www.googleapis.com/calendar/v3";
const PEOPLE_API_BASE: &str = "https://people.googleapis.com/v1";

const MESSAGE_FETCH_CONCURRENCY: usize = 8;
const PERSON_FIELDS: &str = "names,emailAddresses,phoneNumbers,organizations,metadata";

/// Base URLs for the Google APIs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GoogleEndpoints {
    pub gmail: String,
    pub calendar: String,
    pub people: String,
}

impl Default for GoogleEndpoints {
    fn default() -> Self {
        Self {
            gmail: GMAIL_API_BASE.to_string(),
            calendar: CALENDAR_API_BASE.to_string(),
            people: PEOPLE_API_BASE.to_string(),
        }
    }
}

impl GoogleEndpoints {
    /// All three APIs under one root, as `{root}/gmail`, `{root}/calendar`, `{root}/people`.
    pub fn rooted_at(root: &str) -> Self {
        let root = root.trim_end_matches('/');
        Self {
            gmail: format!("{root}/gmail"),
            calendar: format!("{root}/calendar"),
            people: format!("{root}/people"),
        }
    }
}

/// Gmail profile response.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailProfile {
    email_address: String,
    messages_total: Option<u64>,
    history_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageListResponse {
    messages: Option<Vec<MessageRef>>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageRef {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ThreadListResponse {
    threads: Option<Vec<ThreadRef>>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ThreadRef {
    id: String,
    snippet: Option<String>,
}

/// Gmail API message.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailMessage {
    id: String,
    thread_id: Option<String>,
    label_ids: Option<Vec<String>>,
    snippet: Option<String>,
    internal_date: Option<String>,
    payload: Option<GmailPart>,
}

/// Message payload or one of its MIME parts.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailPart {
    mime_type: Option<String>,
    headers: Option<Vec<GmailHeader>>,
    body: Option<GmailBody>,
    parts: Option<Vec<GmailPart>>,
}

#[derive(Debug, Deserialize)]
struct GmailHeader {
    name: String,
    value: String,
}

#[derive(Debug, Deserialize)]
struct GmailBody {
    data: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryListResponse {
    history: Option<Vec<GmailHistory>>,
    next_page_token: Option<String>,
    history_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailHistory {
    messages_added: Option<Vec<HistoryMessage>>,
    messages_deleted: Option<Vec<HistoryMessage>>,
    labels_added: Option<Vec<HistoryMessage>>,
    labels_removed: Option<Vec<HistoryMessage>>,
}

#[derive(Debug, Deserialize)]
struct HistoryMessage {
    message: MessageRef,
}

#[derive(Debug, Deserialize)]
struct LabelListResponse {
    labels: Option<Vec<GmailLabel>>,
}

#[derive(Debug, Deserialize)]
struct GmailLabel {
    id: String,
    name: String,
    #[serde(rename = "type")]
    label_type: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ModifyRequest<'a> {
    ids: &'a [String],
    #[serde(skip_serializing_if = "Vec::is_empty")]
    add_label_ids: Vec<&'static str>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    remove_label_ids: Vec<&'static str>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RawMessage {
    raw: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    thread_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct DraftRequest {
    message: RawMessage,
}

#[derive(Debug, Deserialize)]
struct GmailDraft {
    id: String,
    message: Option<GmailMessage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventListResponse {
    items: Option<Vec<GoogleEvent>>,
    next_page_token: Option<String>,
    next_sync_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GoogleEvent {
    id: String,
    status: Option<String>,
    summary: Option<String>,
    description: Option<String>,
    location: Option<String>,
    start: Option<EventTime>,
    end: Option<EventTime>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventTime {
    date_time: Option<String>,
    date: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectionsResponse {
    connections: Option<Vec<Person>>,
    next_page_token: Option<String>,
    next_sync_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Person {
    resource_name: String,
    metadata: Option<PersonMetadata>,
    names: Option<Vec<PersonName>>,
    email_addresses: Option<Vec<PersonValue>>,
    phone_numbers: Option<Vec<PersonValue>>,
    organizations: Option<Vec<PersonOrganization>>,
}

#[derive(Debug, Deserialize)]
struct PersonMetadata {
    deleted: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersonName {
    display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PersonValue {
    value: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PersonOrganization {
    name: Option<String>,
}

/// Gmail, Google Calendar and Google People adapter.
#[derive(Debug, Clone)]
pub struct GoogleAdapter {
    gmail: ApiClient,
    calendar: ApiClient,
    people: ApiClient,
    test_timeout: Duration,
    full_sync_limit: u32,
}

impl GoogleAdapter {
    /// Creates an adapter authenticated with the given access token.
    pub fn new(client: reqwest::Client, token: Secret, options: &AdapterOptions) -> Self {
        let endpoints = &options.google;
        let timeout = options.request_timeout;
        Self {
            gmail: ApiClient::new(client.clone(), &endpoints.gmail, token.clone(), timeout),
            calendar: ApiClient::new(client.clone(), &endpoints.calendar, token.clone(), timeout),
            people: ApiClient::new(client, &endpoints.people, token, timeout),
            test_timeout: options.test_timeout,
            full_sync_limit: options.full_sync_limit,
        }
    }

    async fn profile(&self) -> Result<GmailProfile> {
        self.gmail.get("/profile").await
    }

    async fn fetch_message(&self, id: &str) -> Result<Email> {
        let message: GmailMessage = self
            .gmail
            .get(&format!("/messages/{}?format=full", id))
            .await?;
        Ok(Self::message_to_email(&message))
    }

    /// Fetches messages concurrently, preserving order. Messages that vanished
    /// between listing and fetching are returned separately.
    async fn fetch_messages(&self, ids: Vec<String>) -> Result<(Vec<Email>, Vec<String>)> {
        let results: Vec<(String, Result<Email>)> = stream::iter(ids)
            .map(|id| async move {
                let result = self.fetch_message(&id).await;
                (id, result)
            })
            .buffered(MESSAGE_FETCH_CONCURRENCY)
            .collect()
            .await;

        let mut emails = Vec::with_capacity(results.len());
        let mut vanished = Vec::new();
        for (id, result) in results {
            match result {
                Ok(email) => emails.push(email),
                Err(ProviderError::Http { status: 404, .. }) => vanished.push(id),
                Err(e) => return Err(e),
            }
        }
        Ok((emails, vanished))
    }

    /// Full sync: page through message IDs from the newest, then fetch each.
    async fn full_email_sync(&self, limit: u32) -> Result<SyncBatch<Email>> {
        // Read the history ID first so changes made during the listing are
        // replayed by the next incremental sync.
        let profile = self.profile().await?;

        let mut ids = Vec::new();
        let mut page_token: Option<String> = None;
        while (ids.len() as u32) < limit {
            let page_size = (limit - ids.len() as u32).min(100).to_string();
            let mut query = vec![("maxResults", page_size)];
            if let Some(token) = &page_token {
                query.push(("pageToken", token.clone()));
            }

            let page: MessageListResponse = self.gmail.get_with("/messages", &query).await?;
            ids.extend(page.messages.unwrap_or_default().into_iter().map(|m| m.id));
            page_token = page.next_page_token;
            if page_token.is_none() {
                break;
            }
        }
        ids.truncate(limit as usize);

        let (emails, _) = self.fetch_messages(ids).await?;
        Ok(SyncBatch::new(emails, Vec::new(), profile.history_id))
    }

    /// Incremental sync from a history ID.
    async fn incremental_email_sync(&self, start_history_id: &str) -> Result<SyncBatch<Email>> {
        let mut changed: Vec<String> = Vec::new();
        let mut deleted: Vec<String> = Vec::new();
        let mut latest: Option<String> = None;
        let mut page_token: Option<String> = None;

        loop {
            let mut query = vec![
                ("startHistoryId", start_history_id.to_string()),
                ("historyTypes", "messageAdded".to_string()),
                ("historyTypes", "messageDeleted".to_string()),
                ("historyTypes", "labelAdded".to_string()),
                ("historyTypes", "labelRemoved".to_string()),
            ];
            if let Some(token) = &page_token {
                query.push(("pageToken", token.clone()));
            }

            let page: HistoryListResponse = match self.gmail.get_with("/history", &query).await {
                Ok(page) => page,
                Err(ProviderError::Http { status: 404, .. }) => {
                    return Err(ProviderError::CursorInvalidated(format!(
                        "history {} is no longer available",
                        start_history_id
                    )));
                }
                Err(e) => return Err(e),
            };

            for record in page.history.unwrap_or_default() {
                let touched = [
                    record.messages_added,
                    record.labels_added,
                    record.labels_removed,
                ];
                for entry in touched.into_iter().flatten().flatten() {
                    if !changed.contains(&entry.message.id) {
                        changed.push(entry.message.id);
                    }
                }
                for entry in record.messages_deleted.unwrap_or_default() {
                    changed.retain(|id| id != &entry.message.id);
                    if !deleted.contains(&entry.message.id) {
                        deleted.push(entry.message.id);
                    }
                }
            }

            if page.history_id.is_some() {
                latest = page.history_id;
            }
            page_token = page.next_page_token;
            if page_token.is_none() {
                break;
            }
        }

        let (emails, vanished) = self.fetch_messages(changed).await?;
        deleted.extend(vanished);

        let next_cursor = latest.or_else(|| Some(start_history_id.to_string()));
        Ok(SyncBatch::new(emails, deleted, next_cursor))
    }

    async fn modify(&self, ids: &[String], add: Vec<&'static str>, remove: Vec<&'static str>) -> Result<()> {
        let ids = self.normalize_ids(ids);
        if ids.is_empty() {
            return Ok(());
        }
        let request = ModifyRequest {
            ids: &ids,
            add_label_ids: add,
            remove_label_ids: remove,
        };
        self.gmail.post_no_response("/messages/batchModify", &request).await
    }

    async fn raw_message(&self, email: &OutgoingEmail) -> Result<RawMessage> {
        let profile = self.profile().await?;
        let raw = email.to_rfc822(&profile.email_address);
        Ok(RawMessage {
            raw: BASE64_URL_SAFE_NO_PAD.encode(raw.as_bytes()),
            thread_id: email.thread_id.clone(),
        })
    }

    /// Decodes a base64url body, tolerating padding.
    fn decode_body(data: &str) -> Option<String> {
        let bytes = BASE64_URL_SAFE_NO_PAD
            .decode(data.trim_end_matches('='))
            .ok()?;
        String::from_utf8(bytes).ok()
    }

    /// Recursively extracts text and HTML bodies.
    fn extract_body(part: &GmailPart, text: &mut Option<String>, html: &mut Option<String>) {
        let mime = part.mime_type.as_deref().unwrap_or("");
        let data = part
            .body
            .as_ref()
            .and_then(|b| b.data.as_deref())
            .and_then(Self::decode_body);

        match mime {
            "text/plain" if text.is_none() => *text = data,
            "text/html" if html.is_none() => *html = data,
            _ => {}
        }

        for nested in part.parts.iter().flatten() {
            Self::extract_body(nested, text, html);
        }
    }

    /// Converts a Gmail message to our domain Email type.
    fn message_to_email(msg: &GmailMessage) -> Email {
        let headers = msg.payload.as_ref().and_then(|p| p.headers.as_ref());
        let header = |name: &str| -> Option<String> {
            headers.and_then(|h| {
                h.iter()
                    .find(|hdr| hdr.name.eq_ignore_ascii_case(name))
                    .map(|hdr| hdr.value.clone())
            })
        };

        let date = msg
            .internal_date
            .as_ref()
            .and_then(|d| d.parse::<i64>().ok())
            .and_then(DateTime::from_timestamp_millis)
            .unwrap_or_else(Utc::now);

        let labels = msg.label_ids.clone().unwrap_or_default();
        let has = |label: &str| labels.iter().any(|l| l == label);

        let mut body_text = None;
        let mut body_html = None;
        if let Some(payload) = &msg.payload {
            Self::extract_body(payload, &mut body_text, &mut body_html);
        }

        Email {
            external_id: msg.id.clone(),
            thread_id: msg.thread_id.clone().unwrap_or_else(|| msg.id.clone()),
            message_id: header("Message-ID"),
            from: header("From")
                .map(|v| Address::parse(&v))
                .unwrap_or_else(|| Address::new("unknown@unknown.com")),
            to: header("To").map(|v| Address::parse_list(&v)).unwrap_or_default(),
            cc: header("Cc").map(|v| Address::parse_list(&v)).unwrap_or_default(),
            subject: header("Subject"),
            body_text,
            body_html,
            snippet: msg.snippet.clone().unwrap_or_default(),
            date,
            is_read: !has("UNREAD"),
            is_starred: has("STARRED"),
            is_draft: has("DRAFT"),
            labels,
        }
    }

    fn draft_from(draft: GmailDraft) -> Draft {
        Draft {
            id: draft.id,
            message: draft
                .message
                .filter(|m| m.payload.is_some())
                .map(|m| Self::message_to_email(&m)),
        }
    }

    /// Converts a Google event time to UTC, flagging all-day dates.
    fn event_time(time: Option<&EventTime>) -> (Option<DateTime<Utc>>, bool) {
        let Some(time) = time else {
            return (None, false);
        };
        if let Some(date_time) = &time.date_time {
            let parsed = DateTime::parse_from_rfc3339(date_time)
                .ok()
                .map(|d| d.with_timezone(&Utc));
            return (parsed, false);
        }
        let date = time
            .date
            .as_deref()
            .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|d| d.and_utc());
        (date, date.is_some())
    }

    fn event_from(event: GoogleEvent) -> CalendarEvent {
        let (starts_at, all_day) = Self::event_time(event.start.as_ref());
        let (ends_at, _) = Self::event_time(event.end.as_ref());
        CalendarEvent {
            external_id: event.id,
            summary: event.summary,
            description: event.description,
            location: event.location,
            starts_at,
            ends_at,
            all_day,
            status: event.status,
        }
    }

    fn contact_from(person: Person) -> Contact {
        let values = |list: Option<Vec<PersonValue>>| -> Vec<String> {
            list.unwrap_or_default()
                .into_iter()
                .filter_map(|v| v.value)
                .collect()
        };
        Contact {
            external_id: person.resource_name,
            display_name: person
                .names
                .and_then(|names| names.into_iter().find_map(|n| n.display_name)),
            emails: values(person.email_addresses),
            phones: values(person.phone_numbers),
            organization: person
                .organizations
                .and_then(|orgs| orgs.into_iter().find_map(|o| o.name)),
        }
    }
}

#[async_trait]
impl MailboxAdapter for GoogleAdapter {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Google
    }

    async fn get_user_info(&self) -> Result<UserInfo> {
        let profile = self.profile().await?;
        Ok(UserInfo {
            email: profile.email_address,
            display_name: None,
        })
    }

    async fn list_threads(&self, params: &ListThreadsParams) -> Result<ThreadPage> {
        let label = params.folder.as_deref().unwrap_or("INBOX").to_uppercase();
        let mut query = vec![("maxResults", params.max_results.to_string())];
        if label != "ALL" {
            query.push(("labelIds", label));
        }
        if let Some(token) = &params.page_token {
            query.push(("pageToken", token.clone()));
        }

        let response: ThreadListResponse = self.gmail.get_with("/threads", &query).await?;
        let threads = response
            .threads
            .unwrap_or_default()
            .into_iter()
            .map(|t| ThreadSummary {
                thread_id: t.id,
                subject: None,
                snippet: t.snippet.unwrap_or_default(),
                from: None,
                last_message_at: None,
                unread: false,
            })
            .collect();

        Ok(ThreadPage {
            threads,
            next_page_token: response.next_page_token,
        })
    }

    async fn get_message(&self, id: &str) -> Result<Email> {
        match self.fetch_message(&id.trim().to_lowercase()).await {
            Err(ProviderError::Http { status: 404, .. }) => {
                Err(ProviderError::NotFound(format!("message {}", id)))
            }
            other => other,
        }
    }

    async fn send_email(&self, email: &OutgoingEmail) -> Result<String> {
        let request = self.raw_message(email).await?;
        let sent: GmailMessage = self.gmail.post("/messages/send", &request).await?;
        tracing::info!(message_id = %sent.id, "email sent via Gmail API");
        Ok(sent.id)
    }

    async fn sync_emails(&self, params: &SyncParams) -> Result<SyncBatch<Email>> {
        match params.resume_cursor() {
            Some(history_id) => self.incremental_email_sync(history_id).await,
            None => {
                self.full_email_sync(params.max_items.unwrap_or(self.full_sync_limit))
                    .await
            }
        }
    }

    async fn get_labels(&self) -> Result<Vec<Folder>> {
        let response: LabelListResponse = self.gmail.get("/labels").await?;
        Ok(response
            .labels
            .unwrap_or_default()
            .into_iter()
            .map(|l| Folder {
                external_id: l.id,
                name: l.name,
                is_system: l.label_type.as_deref() == Some("system"),
            })
            .collect())
    }

    async fn create_label(&self, name: &str) -> Result<Folder> {
        let body = serde_json::json!({
            "name": name,
            "labelListVisibility": "labelShow",
            "messageListVisibility": "show",
        });
        let label: GmailLabel = self.gmail.post("/labels", &body).await?;
        Ok(Folder {
            external_id: label.id,
            name: label.name,
            is_system: false,
        })
    }

    async fn mark_as_read(&self, ids: &[String]) -> Result<()> {
        self.modify(ids, vec![], vec!["UNREAD"]).await
    }

    async fn mark_as_unread(&self, ids: &[String]) -> Result<()> {
        self.modify(ids, vec!["UNREAD"], vec![]).await
    }

    async fn create_draft(&self, email: &OutgoingEmail) -> Result<Draft> {
        let request = DraftRequest {
            message: self.raw_message(email).await?,
        };
        let draft: GmailDraft = self.gmail.post("/drafts", &request).await?;
        Ok(Self::draft_from(draft))
    }

    async fn get_draft(&self, id: &str) -> Result<Draft> {
        let draft: GmailDraft = self
            .gmail
            .get(&format!("/drafts/{}?format=full", id.trim()))
            .await?;
        Ok(Self::draft_from(draft))
    }

    async fn send_draft(&self, id: &str) -> Result<String> {
        let body = serde_json::json!({ "id": id.trim() });
        let sent: GmailMessage = self.gmail.post("/drafts/send", &body).await?;
        Ok(sent.id)
    }

    async fn get_email_count(&self) -> Result<u64> {
        Ok(self.profile().await?.messages_total.unwrap_or(0))
    }

    async fn test_connection(&self) -> bool {
        matches!(
            tokio::time::timeout(self.test_timeout, self.profile()).await,
            Ok(Ok(_))
        )
    }

    fn normalize_ids(&self, ids: &[String]) -> Vec<String> {
        normalize_with(ids, str::to_lowercase)
    }

    async fn sync_calendar(&self, params: &SyncParams) -> Result<SyncBatch<CalendarEvent>> {
        let mut items = Vec::new();
        let mut deleted = Vec::new();
        let mut page_token: Option<String> = None;

        let next_sync_token = loop {
            let mut query = vec![
                ("maxResults", "250".to_string()),
                ("showDeleted", "true".to_string()),
            ];
            if let Some(token) = params.resume_cursor() {
                query.push(("syncToken", token.to_string()));
            }
            if let Some(token) = &page_token {
                query.push(("pageToken", token.clone()));
            }

            let page: EventListResponse = self
                .calendar
                .get_with("/calendars/primary/events", &query)
                .await?;

            for event in page.items.unwrap_or_default() {
                if event.status.as_deref() == Some("cancelled") {
                    deleted.push(event.id);
                } else {
                    items.push(Self::event_from(event));
                }
            }

            page_token = page.next_page_token;
            if page_token.is_none() {
                break page.next_sync_token;
            }
        };

        Ok(SyncBatch::new(items, deleted, next_sync_token))
    }

    async fn sync_contacts(&self, params: &SyncParams) -> Result<SyncBatch<Contact>> {
        let mut items = Vec::new();
        let mut deleted = Vec::new();
        let mut page_token: Option<String> = None;

        let next_sync_token = loop {
            let mut query = vec![
                ("personFields", PERSON_FIELDS.to_string()),
                ("pageSize", "1000".to_string()),
                ("requestSyncToken", "true".to_string()),
            ];
            if let Some(token) = params.resume_cursor() {
                query.push(("syncToken", token.to_string()));
            }
            if let Some(token) = &page_token {
                query.push(("pageToken", token.clone()));
            }

            let page: ConnectionsResponse = self
                .people
                .get_with("/people/me/connections", &query)
                .await?;

            for person in page.connections.unwrap_or_default() {
                let removed = person
                    .metadata
                    .as_ref()
                    .and_then(|m| m.deleted)
                    .unwrap_or(false);
                if removed {
                    deleted.push(person.resource_name);
                } else {
                    items.push(Self::contact_from(person));
                }
            }

            page_token = page.next_page_token;
            if page_token.is_none() {
                break page.next_sync_token;
            }
        };

        Ok(SyncBatch::new(items, deleted, next_sync_token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn adapter(server: &MockServer) -> GoogleAdapter {
        let options = AdapterOptions {
            google: GoogleEndpoints::rooted_at(&server.uri()),
            ..AdapterOptions::default()
        };
        GoogleAdapter::new(reqwest::Client::new(), Secret::from("tok"), &options)
    }

    fn message_json(id: &str, labels: &[&str]) -> serde_json::Value {
        json!({
            "id": id,
            "threadId": format!("t-{id}"),
            "labelIds": labels,
            "snippet": "Hello there",
            "internalDate": "1714554000000",
            "payload": {
                "mimeType": "multipart/alternative",
                "headers": [
                    { "name": "From", "value": "\"Alice\" <alice@example.com>" },
                    { "name": "To", "value": "bob@example.com, carol@example.com" },
                    { "name": "Subject", "value": format!("Subject {id}") },
                    { "name": "Message-ID", "value": format!("<{id}@mail.gmail.com>") }
                ],
                "parts": [
                    { "mimeType": "text/plain", "body": { "data": BASE64_URL_SAFE_NO_PAD.encode("Hello") } },
                    { "mimeType": "text/html", "body": { "data": BASE64_URL_SAFE_NO_PAD.encode("<p>Hello</p>") } }
                ]
            }
        })
    }

    async fn mount_message(server: &MockServer, id: &str, labels: &[&str]) {
        Mock::given(method("GET"))
            .and(path(format!("/gmail/messages/{id}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(message_json(id, labels)))
            .mount(server)
            .await;
    }

    #[test]
    fn converts_message() {
        let msg: GmailMessage =
            serde_json::from_value(message_json("m1", &["INBOX", "UNREAD", "STARRED"])).unwrap();
        let email = GoogleAdapter::message_to_email(&msg);

        assert_eq!(email.external_id, "m1");
        assert_eq!(email.thread_id, "t-m1");
        assert_eq!(email.from, Address::with_name("alice@example.com", "Alice"));
        assert_eq!(email.to.len(), 2);
        assert_eq!(email.subject.as_deref(), Some("Subject m1"));
        assert_eq!(email.message_id.as_deref(), Some("<m1@mail.gmail.com>"));
        assert_eq!(email.body_text.as_deref(), Some("Hello"));
        assert_eq!(email.body_html.as_deref(), Some("<p>Hello</p>"));
        assert!(!email.is_read);
        assert!(email.is_starred);
        assert!(!email.is_draft);
        assert_eq!(email.date.timestamp_millis(), 1_714_554_000_000);
    }

    #[test]
    fn all_day_event_time() {
        let time = EventTime {
            date_time: None,
            date: Some("2025-05-01".to_string()),
        };
        let (start, all_day) = GoogleAdapter::event_time(Some(&time));
        assert!(all_day);
        assert_eq!(start.unwrap().to_rfc3339(), "2025-05-01T00:00:00+00:00");
    }

    #[test]
    fn normalize_lowercases() {
        let adapter = GoogleAdapter::new(
            reqwest::Client::new(),
            Secret::from("t"),
            &AdapterOptions::default(),
        );
        let ids = vec!["18F2A ".to_string(), "18f2a".to_string(), " ".to_string()];
        assert_eq!(adapter.normalize_ids(&ids), vec!["18f2a"]);
    }

    #[tokio::test]
    async fn incremental_sync_reads_history() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/gmail/history"))
            .and(query_param("startHistoryId", "abc123"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "history": [
                    { "messagesAdded": [{ "message": { "id": "m1" } }, { "message": { "id": "m2" } }] },
                    { "labelsRemoved": [{ "message": { "id": "m1" } }] },
                    { "messagesDeleted": [{ "message": { "id": "m3" } }] }
                ],
                "historyId": "abc456"
            })))
            .expect(1)
            .mount(&server)
            .await;
        mount_message(&server, "m1", &["INBOX"]).await;
        mount_message(&server, "m2", &["INBOX", "UNREAD"]).await;

        let batch = adapter(&server)
            .sync_emails(&SyncParams::incremental(Some("abc123".to_string())))
            .await
            .unwrap();

        let ids: Vec<_> = batch.items.iter().map(|e| e.external_id.as_str()).collect();
        assert_eq!(ids, vec!["m1", "m2"]);
        assert_eq!(batch.deleted, vec!["m3".to_string()]);
        assert_eq!(batch.next_cursor.as_deref(), Some("abc456"));
    }

    #[tokio::test]
    async fn unchanged_history_keeps_cursor() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/gmail/history"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "historyId": "abc123" })))
            .mount(&server)
            .await;

        let batch = adapter(&server)
            .sync_emails(&SyncParams::incremental(Some("abc123".to_string())))
            .await
            .unwrap();
        assert!(batch.items.is_empty());
        assert_eq!(batch.next_cursor.as_deref(), Some("abc123"));
    }

    #[tokio::test]
    async fn expired_history_invalidates_cursor() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/gmail/history"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({
                "error": { "code": 404, "message": "Requested entity was not found.", "status": "NOT_FOUND" }
            })))
            .mount(&server)
            .await;

        let err = adapter(&server)
            .sync_emails(&SyncParams::incremental(Some("1".to_string())))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::CursorInvalidated(_)));
    }

    #[tokio::test]
    async fn full_sync_lists_and_fetches() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/gmail/profile"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "emailAddress": "user@gmail.com",
                "messagesTotal": 2,
                "historyId": "900"
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/gmail/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "messages": [{ "id": "m1", "threadId": "t-m1" }, { "id": "m2", "threadId": "t-m2" }]
            })))
            .mount(&server)
            .await;
        mount_message(&server, "m1", &["INBOX"]).await;
        mount_message(&server, "m2", &["INBOX"]).await;

        let batch = adapter(&server)
            .sync_emails(&SyncParams::full(Some(10)))
            .await
            .unwrap();
        assert_eq!(batch.items.len(), 2);
        assert!(batch.deleted.is_empty());
        assert_eq!(batch.next_cursor.as_deref(), Some("900"));
    }

    #[tokio::test]
    async fn mark_as_read_removes_unread_label() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/gmail/messages/batchModify"))
            .and(body_partial_json(json!({ "ids": ["m1"], "removeLabelIds": ["UNREAD"] })))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        adapter(&server)
            .mark_as_read(&["M1".to_string(), "m1".to_string()])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn calendar_sync_maps_cancelled_to_deleted() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/calendar/calendars/primary/events"))
            .and(query_param("syncToken", "cal-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "items": [
                    {
                        "id": "e1",
                        "status": "confirmed",
                        "summary": "Standup",
                        "start": { "dateTime": "2025-05-01T09:00:00Z" },
                        "end": { "dateTime": "2025-05-01T09:15:00Z" }
                    },
                    { "id": "e2", "status": "cancelled" }
                ],
                "nextSyncToken": "cal-2"
            })))
            .mount(&server)
            .await;

        let batch = adapter(&server)
            .sync_calendar(&SyncParams::incremental(Some("cal-1".to_string())))
            .await
            .unwrap();
        assert_eq!(batch.items.len(), 1);
        assert_eq!(batch.items[0].summary.as_deref(), Some("Standup"));
        assert!(!batch.items[0].all_day);
        assert_eq!(batch.deleted, vec!["e2".to_string()]);
        assert_eq!(batch.next_cursor.as_deref(), Some("cal-2"));
    }

    #[tokio::test]
    async fn contacts_sync_pages_and_detects_deletions() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/people/people/me/connections"))
            .and(query_param("pageToken", "p2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "connections": [
                    { "resourceName": "people/c2", "metadata": { "deleted": true } }
                ],
                "nextSyncToken": "ppl-2"
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/people/people/me/connections"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "connections": [{
                    "resourceName": "people/c1",
                    "names": [{ "displayName": "Jane Doe" }],
                    "emailAddresses": [{ "value": "jane@example.com" }],
                    "organizations": [{ "name": "Acme" }]
                }],
                "nextPageToken": "p2"
            })))
            .mount(&server)
            .await;

        let batch = adapter(&server)
            .sync_contacts(&SyncParams::full(None))
            .await
            .unwrap();
        assert_eq!(batch.items.len(), 1);
        assert_eq!(batch.items[0].display_name.as_deref(), Some("Jane Doe"));
        assert_eq!(batch.items[0].organization.as_deref(), Some("Acme"));
        assert_eq!(batch.deleted, vec!["people/c2".to_string()]);
        assert_eq!(batch.next_cursor.as_deref(), Some("ppl-2"));
    }

    #[tokio::test]
    async fn test_connection_reports_bool() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/gmail/profile"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        assert!(!adapter(&server).test_connection().await);

        let ok = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/gmail/profile"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "emailAddress": "u@gmail.com" })))
            .mount(&ok)
            .await;
        assert!(adapter(&ok).test_connection().await);
    }
}
