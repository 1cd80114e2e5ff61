//! CalDAV/CardDAV collection sync for generic providers.
//!
//! Uses the WebDAV `sync-collection` REPORT (RFC 6578). The collection's
//! `sync-token` is the cursor. Resources are keyed by their href, which is the
//! only identifier a 404 (deleted) entry carries.

use std::time::Duration;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use quick_xml::events::Event;
use quick_xml::Reader;
use reqwest::header::{CONTENT_TYPE, RETRY_AFTER};
use reqwest::Method;
use url::Url;

use super::http::map_send_error;
use super::{ProviderError, Result, SyncBatch, SyncParams};
use crate::domain::{CalendarEvent, Contact};
use crate::storage::Login;

const CALDAV_NS: &str = "urn:ietf:params:xml:ns:caldav";
const CARDDAV_NS: &str = "urn:ietf:params:xml:ns:carddav";

/// One `<response>` of a multistatus body.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct DavEntry {
    href: String,
    /// Response-level status, set for removed members.
    status: Option<u16>,
    /// `calendar-data` or `address-data`.
    data: Option<String>,
}

impl DavEntry {
    fn is_removed(&self) -> bool {
        self.status == Some(404)
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct Multistatus {
    entries: Vec<DavEntry>,
    sync_token: Option<String>,
}

/// Parses the status code out of `HTTP/1.1 404 Not Found`.
fn parse_status_line(line: &str) -> Option<u16> {
    line.split_whitespace().nth(1)?.parse().ok()
}

fn parse_multistatus(xml: &str) -> Result<Multistatus> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut path: Vec<Vec<u8>> = Vec::new();
    let mut current: Option<DavEntry> = None;
    let mut out = Multistatus::default();

    loop {
        let text = match reader
            .read_event()
            .map_err(|e| ProviderError::Parse(format!("multistatus: {}", e)))?
        {
            Event::Start(e) => {
                let name = e.local_name().as_ref().to_vec();
                if name == b"response" {
                    current = Some(DavEntry::default());
                }
                path.push(name);
                continue;
            }
            Event::End(_) => {
                if path.pop().as_deref() == Some(b"response".as_slice()) {
                    out.entries.extend(current.take());
                }
                continue;
            }
            Event::Text(t) => t
                .unescape()
                .map_err(|e| ProviderError::Parse(format!("multistatus text: {}", e)))?
                .into_owned(),
            Event::CData(c) => String::from_utf8_lossy(&c.into_inner()).into_owned(),
            Event::Eof => break,
            _ => continue,
        };

        let parent = path.len().checked_sub(2).map(|i| path[i].as_slice());
        match (path.last().map(Vec::as_slice), parent, current.as_mut()) {
            (Some(b"href"), Some(b"response"), Some(entry)) => entry.href = text,
            (Some(b"status"), Some(b"response"), Some(entry)) => {
                entry.status = parse_status_line(&text)
            }
            (Some(b"calendar-data" | b"address-data"), _, Some(entry)) => entry.data = Some(text),
            (Some(b"sync-token"), Some(b"multistatus"), _) => out.sync_token = Some(text),
            _ => {}
        }
    }

    Ok(out)
}

/// Unfolds RFC 5545 / RFC 6350 content lines.
fn unfold(data: &str) -> Vec<String> {
    let mut lines: Vec<String> = Vec::new();
    for raw in data.lines() {
        let raw = raw.trim_end_matches('\r');
        match (raw.strip_prefix(' ').or_else(|| raw.strip_prefix('\t')), lines.last_mut()) {
            (Some(continuation), Some(last)) => last.push_str(continuation),
            _ => lines.push(raw.to_string()),
        }
    }
    lines
}

/// Splits `NAME;PARAM=X:value` into `(NAME, params, value)`.
fn split_property(line: &str) -> Option<(String, &str, &str)> {
    let (head, value) = line.split_once(':')?;
    let (name, params) = head.split_once(';').unwrap_or((head, ""));
    Some((name.to_ascii_uppercase(), params, value))
}

fn unescape_text(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n' | 'N') => out.push('\n'),
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}

/// Parses a DATE or DATE-TIME value. Floating and TZID times are read as UTC.
fn parse_ical_time(params: &str, value: &str) -> Option<(DateTime<Utc>, bool)> {
    if params.to_ascii_uppercase().contains("VALUE=DATE") && !value.contains('T') {
        let date = NaiveDate::parse_from_str(value, "%Y%m%d").ok()?;
        return Some((date.and_hms_opt(0, 0, 0)?.and_utc(), true));
    }
    let naive = NaiveDateTime::parse_from_str(value.trim_end_matches('Z'), "%Y%m%dT%H%M%S").ok()?;
    Some((naive.and_utc(), false))
}

/// Reads the first VEVENT of an iCalendar object.
fn parse_vevent(href: &str, data: &str) -> Option<CalendarEvent> {
    let mut event = CalendarEvent::new(href);
    let mut in_event = false;

    for line in unfold(data) {
        let Some((name, params, value)) = split_property(&line) else {
            continue;
        };
        match (name.as_str(), in_event) {
            ("BEGIN", false) if value.eq_ignore_ascii_case("VEVENT") => in_event = true,
            ("END", true) if value.eq_ignore_ascii_case("VEVENT") => return Some(event),
            ("SUMMARY", true) => event.summary = Some(unescape_text(value)),
            ("DESCRIPTION", true) => event.description = Some(unescape_text(value)),
            ("LOCATION", true) => event.location = Some(unescape_text(value)),
            ("STATUS", true) => event.status = Some(value.to_ascii_lowercase()),
            ("DTSTART", true) => {
                if let Some((at, all_day)) = parse_ical_time(params, value) {
                    event.starts_at = Some(at);
                    event.all_day = all_day;
                }
            }
            ("DTEND", true) => event.ends_at = parse_ical_time(params, value).map(|(at, _)| at),
            _ => {}
        }
    }
    None
}

/// Reads a vCard.
fn parse_vcard(href: &str, data: &str) -> Option<Contact> {
    let mut contact = Contact::new(href);
    let mut in_card = false;

    for line in unfold(data) {
        let Some((name, _, value)) = split_property(&line) else {
            continue;
        };
        // Grouped properties look like `item1.EMAIL`.
        let name = name.rsplit('.').next().unwrap_or_default();
        match (name, in_card) {
            ("BEGIN", false) if value.eq_ignore_ascii_case("VCARD") => in_card = true,
            ("END", true) if value.eq_ignore_ascii_case("VCARD") => return Some(contact),
            ("FN", true) => contact.display_name = Some(unescape_text(value)),
            ("EMAIL", true) => contact.emails.push(value.trim().to_string()),
            ("TEL", true) => contact.phones.push(value.trim().to_string()),
            ("ORG", true) => {
                contact.organization = value
                    .split(';')
                    .next()
                    .map(unescape_text)
                    .filter(|s| !s.is_empty())
            }
            _ => {}
        }
    }
    None
}

fn sync_collection_body(namespace: &str, data_prop: &str, token: Option<&str>) -> String {
    let token = match token {
        Some(token) => format!("<d:sync-token>{}</d:sync-token>", quick_xml::escape::escape(token)),
        None => "<d:sync-token/>".to_string(),
    };
    format!(
        r#"<?xml version="1.0" encoding="utf-8"?>
<d:sync-collection xmlns:d="DAV:" xmlns:x="{namespace}">
  {token}
  <d:sync-level>1</d:sync-level>
  <d:prop><d:getetag/><x:{data_prop}/></d:prop>
</d:sync-collection>"#
    )
}

/// WebDAV client authenticated with a static login.
pub(crate) struct DavClient {
    client: reqwest::Client,
    login: Login,
    timeout: Duration,
}

impl DavClient {
    pub(crate) fn new(client: reqwest::Client, login: Login, timeout: Duration) -> Self {
        Self {
            client,
            login,
            timeout,
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<String> {
        let response = request
            .basic_auth(self.login.username.expose(), Some(self.login.password.expose()))
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| map_send_error(e, self.timeout))?;

        let status = response.status();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.text().await?;

        if status.is_success() {
            return Ok(body);
        }
        if body.contains("valid-sync-token") {
            return Err(ProviderError::CursorInvalidated(
                "server rejected the sync-token".to_string(),
            ));
        }
        Err(ProviderError::Http {
            status: status.as_u16(),
            code: None,
            message: if body.is_empty() {
                status.canonical_reason().unwrap_or("request failed").to_string()
            } else {
                body
            },
            retry_after,
        })
    }

    /// Runs one sync-collection REPORT and fills in missing resource data.
    async fn sync_collection(
        &self,
        collection: &str,
        namespace: &str,
        data_prop: &str,
        params: &SyncParams,
    ) -> Result<Multistatus> {
        let base = Url::parse(collection)
            .map_err(|e| ProviderError::InvalidRequest(format!("invalid collection URL: {}", e)))?;
        let method = Method::from_bytes(b"REPORT")
            .map_err(|e| ProviderError::InvalidRequest(e.to_string()))?;

        let body = sync_collection_body(namespace, data_prop, params.resume_cursor());
        let request = self
            .client
            .request(method, base.clone())
            .header("Depth", "0")
            .header(CONTENT_TYPE, "application/xml; charset=utf-8")
            .body(body);
        let mut status = parse_multistatus(&self.send(request).await?)?;

        for entry in status.entries.iter_mut() {
            if entry.is_removed() || entry.data.is_some() {
                continue;
            }
            let url = base
                .join(&entry.href)
                .map_err(|e| ProviderError::Parse(format!("invalid href {}: {}", entry.href, e)))?;
            entry.data = Some(self.send(self.client.get(url)).await?);
        }

        tracing::debug!(
            collection,
            entries = status.entries.len(),
            "sync-collection report"
        );
        Ok(status)
    }

    fn into_batch<T>(
        status: Multistatus,
        parse: impl Fn(&str, &str) -> Option<T>,
        cursor: Option<&str>,
    ) -> SyncBatch<T> {
        let mut batch = SyncBatch::new(
            Vec::new(),
            Vec::new(),
            status.sync_token.or_else(|| cursor.map(str::to_string)),
        );
        for entry in status.entries {
            if entry.is_removed() {
                batch.deleted.push(entry.href);
                continue;
            }
            match entry.data.as_deref().and_then(|data| parse(&entry.href, data)) {
                Some(item) => batch.items.push(item),
                None => tracing::warn!(href = %entry.href, "skipping unparseable DAV resource"),
            }
        }
        batch
    }

    pub(crate) async fn sync_calendar(
        &self,
        collection: &str,
        params: &SyncParams,
    ) -> Result<SyncBatch<CalendarEvent>> {
        let status = self
            .sync_collection(collection, CALDAV_NS, "calendar-data", params)
            .await?;
        Ok(Self::into_batch(status, parse_vevent, params.resume_cursor()))
    }

    pub(crate) async fn sync_contacts(
        &self,
        collection: &str,
        params: &SyncParams,
    ) -> Result<SyncBatch<Contact>> {
        let status = self
            .sync_collection(collection, CARDDAV_NS, "address-data", params)
            .await?;
        Ok(Self::into_batch(status, parse_vcard, params.resume_cursor()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine;
    use pretty_assertions::assert_eq;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const MULTISTATUS: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<d:multistatus xmlns:d="DAV:" xmlns:cal="urn:ietf:params:xml:ns:caldav">
  <d:response>
    <d:href>/cal/alice/work/ev1.ics</d:href>
    <d:propstat>
      <d:prop>
        <d:getetag>"1"</d:getetag>
        <cal:calendar-data>BEGIN:VCALENDAR
BEGIN:VEVENT
UID:ev1
SUMMARY:Planning\, Q3
DTSTART;VALUE=DATE:20250501
DTEND;VALUE=DATE:20250502
LOCATION:Room 1
END:VEVENT
END:VCALENDAR
</cal:calendar-data>
      </d:prop>
      <d:status>HTTP/1.1 200 OK</d:status>
    </d:propstat>
  </d:response>
  <d:response>
    <d:href>/cal/alice/work/ev0.ics</d:href>
    <d:status>HTTP/1.1 404 Not Found</d:status>
  </d:response>
  <d:sync-token>http://example.com/sync/42</d:sync-token>
</d:multistatus>"#;

    #[test]
    fn parses_multistatus() {
        let status = parse_multistatus(MULTISTATUS).unwrap();
        assert_eq!(status.sync_token.as_deref(), Some("http://example.com/sync/42"));
        assert_eq!(status.entries.len(), 2);
        assert_eq!(status.entries[0].href, "/cal/alice/work/ev1.ics");
        assert!(status.entries[0].data.as_deref().unwrap().contains("BEGIN:VEVENT"));
        assert!(!status.entries[0].is_removed());
        assert!(status.entries[1].is_removed());
    }

    #[test]
    fn parses_timed_vevent_with_folding() {
        let data = "BEGIN:VCALENDAR\r\nBEGIN:VEVENT\r\nSUMMARY:Long\r\n  title\r\n\
DTSTART:20250501T090000Z\r\nDTEND:20250501T100000Z\r\nSTATUS:CONFIRMED\r\nEND:VEVENT\r\nEND:VCALENDAR\r\n";
        let event = parse_vevent("/cal/a.ics", data).unwrap();
        assert_eq!(event.external_id, "/cal/a.ics");
        assert_eq!(event.summary.as_deref(), Some("Long title"));
        assert!(!event.all_day);
        assert_eq!(event.starts_at.unwrap().to_rfc3339(), "2025-05-01T09:00:00+00:00");
        assert_eq!(event.status.as_deref(), Some("confirmed"));
    }

    #[test]
    fn vevent_without_event_block_is_rejected() {
        assert!(parse_vevent("/x", "BEGIN:VCALENDAR\nEND:VCALENDAR\n").is_none());
    }

    #[test]
    fn parses_vcard() {
        let data = "BEGIN:VCARD\nVERSION:3.0\nFN:Dana Scully\nitem1.EMAIL;TYPE=work:dana@fbi.gov\n\
TEL;TYPE=cell:+1 555 0100\nORG:FBI;X-Files\nEND:VCARD\n";
        let contact = parse_vcard("/card/dana.vcf", data).unwrap();
        assert_eq!(contact.display_name.as_deref(), Some("Dana Scully"));
        assert_eq!(contact.emails, vec!["dana@fbi.gov".to_string()]);
        assert_eq!(contact.phones, vec!["+1 555 0100".to_string()]);
        assert_eq!(contact.organization.as_deref(), Some("FBI"));
    }

    #[test]
    fn request_body_escapes_token() {
        let body = sync_collection_body(CALDAV_NS, "calendar-data", Some("a&b"));
        assert!(body.contains("<d:sync-token>a&amp;b</d:sync-token>"));
        let initial = sync_collection_body(CARDDAV_NS, "address-data", None);
        assert!(initial.contains("<d:sync-token/>"));
        assert!(initial.contains("<x:address-data/>"));
    }

    fn client() -> DavClient {
        DavClient::new(
            reqwest::Client::new(),
            Login::new("alice", "pw"),
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn calendar_sync_reports_changes_and_deletions() {
        let server = MockServer::start().await;
        let auth = format!(
            "Basic {}",
            base64::engine::general_purpose::STANDARD.encode("alice:pw")
        );
        Mock::given(method("REPORT"))
            .and(path("/cal/alice/work/"))
            .and(header("authorization", auth.as_str()))
            .and(body_string_contains("<d:sync-token>tok-41</d:sync-token>"))
            .respond_with(ResponseTemplate::new(207).set_body_string(MULTISTATUS))
            .expect(1)
            .mount(&server)
            .await;

        let collection = format!("{}/cal/alice/work/", server.uri());
        let batch = client()
            .sync_calendar(&collection, &SyncParams::incremental(Some("tok-41".to_string())))
            .await
            .unwrap();

        assert_eq!(batch.items.len(), 1);
        assert_eq!(batch.items[0].summary.as_deref(), Some("Planning, Q3"));
        assert!(batch.items[0].all_day);
        assert_eq!(batch.deleted, vec!["/cal/alice/work/ev0.ics".to_string()]);
        assert_eq!(batch.next_cursor.as_deref(), Some("http://example.com/sync/42"));
    }

    #[tokio::test]
    async fn missing_data_is_fetched_individually() {
        let server = MockServer::start().await;
        let report = r#"<d:multistatus xmlns:d="DAV:">
  <d:response><d:href>/card/dana.vcf</d:href>
    <d:propstat><d:prop><d:getetag>"2"</d:getetag></d:prop><d:status>HTTP/1.1 200 OK</d:status></d:propstat>
  </d:response>
  <d:sync-token>tok-2</d:sync-token>
</d:multistatus>"#;
        Mock::given(method("REPORT"))
            .and(path("/card/"))
            .respond_with(ResponseTemplate::new(207).set_body_string(report))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/card/dana.vcf"))
            .respond_with(
                ResponseTemplate::new(200).set_body_string("BEGIN:VCARD\nFN:Dana\nEND:VCARD\n"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let batch = client()
            .sync_contacts(&format!("{}/card/", server.uri()), &SyncParams::full(None))
            .await
            .unwrap();
        assert_eq!(batch.items[0].display_name.as_deref(), Some("Dana"));
        assert_eq!(batch.next_cursor.as_deref(), Some("tok-2"));
    }

    #[tokio::test]
    async fn rejected_sync_token_invalidates_cursor() {
        let server = MockServer::start().await;
        Mock::given(method("REPORT"))
            .respond_with(ResponseTemplate::new(403).set_body_string(
                r#"<d:error xmlns:d="DAV:"><d:valid-sync-token/></d:error>"#,
            ))
            .mount(&server)
            .await;

        let err = client()
            .sync_calendar(
                &format!("{}/cal/", server.uri()),
                &SyncParams::incremental(Some("stale".to_string())),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::CursorInvalidated(_)));
    }
}
