//! CalDAV store implementation

use appt_core::{Appointment, AppointmentPatch, StoreConfig, StoreKind};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use quick_xml::events::Event;
use quick_xml::Reader;
use reqwest::{Client, Method, Response, StatusCode};
use tracing::{debug, error, info};

use crate::error::{Result, StoreError};
use crate::ical::{parse_ical, to_ical};
use crate::store::{sort_by_creation, CalendarStore, StoreQuery};

/// Calendar store backed by a CalDAV collection
pub struct CalDavStore {
    name: String,
    kind: StoreKind,
    client: Client,
    collection_url: String,
    username: String,
    password: String,
}

impl CalDavStore {
    /// Create a new CalDAV store
    pub fn new(config: &StoreConfig, name: impl Into<String>, kind: StoreKind) -> Result<Self> {
        let name = name.into();
        let server_url = config.server_url.as_deref().ok_or_else(|| {
            StoreError::Configuration(format!("store '{}' needs a server_url", name))
        })?;

        let client = Client::builder()
            .danger_accept_invalid_certs(false)
            .build()
            .map_err(|e| StoreError::Configuration(e.to_string()))?;

        let calendar_path = config.calendar_id.as_deref().unwrap_or("calendars");
        let collection_url = format!(
            "{}/{}",
            server_url.trim_end_matches('/'),
            calendar_path.trim_matches('/')
        );

        info!(store = %name, "Calendar client initialized for: {}", collection_url);

        Ok(Self {
            name,
            kind,
            client,
            collection_url,
            username: config.username.clone().unwrap_or_default(),
            password: config.password.clone().unwrap_or_default(),
        })
    }

    fn event_url(&self, uid: &str) -> String {
        format!("{}/{}.ics", self.collection_url, uid)
    }

    fn report_method() -> Result<Method> {
        Method::from_bytes(b"REPORT").map_err(|e| StoreError::Caldav(e.to_string()))
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Response> {
        request
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await
            .map_err(|e| StoreError::Unavailable(format!("{}: {}", self.name, e)))
    }

    /// Turn a non-success response into the matching store error
    async fn check(&self, response: Response, what: &str, id: &str) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let error_text = response.text().await.unwrap_or_default();
        error!(store = %self.name, "{} failed: {} - {}", what, status, error_text);
        Err(status_error(status, id, &error_text))
    }

    async fn fetch(&self, uid: &str) -> Result<Option<Appointment>> {
        let response = self.send(self.client.get(self.event_url(uid))).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = self.check(response, "Get event", uid).await?;
        let text = response
            .text()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let mut record = parse_ical(&text)?;
        record.id = Some(uid.to_string());
        record.origin = self.kind;
        Ok(Some(record))
    }

    async fn put(&self, uid: &str, record: &Appointment, create: bool) -> Result<()> {
        let mut request = self
            .client
            .put(self.event_url(uid))
            .header("Content-Type", "text/calendar; charset=utf-8")
            .body(to_ical(record, uid));
        if create {
            request = request.header("If-None-Match", "*");
        }

        let response = self.send(request).await?;
        self.check(response, if create { "Create event" } else { "Update event" }, uid)
            .await?;
        Ok(())
    }

    /// Calendar-query REPORT, optionally limited to a time range
    async fn report(&self, range: Option<(DateTime<Utc>, DateTime<Utc>)>) -> Result<Vec<Appointment>> {
        let time_range = range
            .map(|(start, end)| {
                format!(
                    r#"<C:time-range start="{}" end="{}"/>"#,
                    start.format("%Y%m%dT%H%M%SZ"),
                    // time-range end is exclusive
                    (end + chrono::Duration::seconds(1)).format("%Y%m%dT%H%M%SZ")
                )
            })
            .unwrap_or_default();

        let body = format!(
            r#"<?xml version="1.0" encoding="utf-8" ?>
<C:calendar-query xmlns:D="DAV:" xmlns:C="urn:ietf:params:xml:ns:caldav">
    <D:prop>
        <D:getetag/>
        <C:calendar-data/>
    </D:prop>
    <C:filter>
        <C:comp-filter name="VCALENDAR">
            <C:comp-filter name="VEVENT">
                {}
            </C:comp-filter>
        </C:comp-filter>
    </C:filter>
</C:calendar-query>"#,
            time_range
        );

        debug!(store = %self.name, "Fetching events from: {}", self.collection_url);

        let request = self
            .client
            .request(Self::report_method()?, &self.collection_url)
            .header("Content-Type", "application/xml; charset=utf-8")
            .header("Depth", "1")
            .body(body);
        let response = self.send(request).await?;
        let response = self.check(response, "Calendar query", &self.collection_url).await?;
        let text = response
            .text()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let mut records = parse_multistatus(&text)?;
        for record in &mut records {
            record.origin = self.kind;
        }
        Ok(records)
    }
}

#[async_trait]
impl CalendarStore for CalDavStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StoreKind {
        self.kind
    }

    async fn create(&self, record: &Appointment) -> Result<String> {
        let uid = uuid::Uuid::new_v4().to_string();
        let mut stored = record.clone();
        stored.created_at = Some(Utc::now());

        debug!(store = %self.name, "Creating event: {}", stored.title);
        self.put(&uid, &stored, true).await?;

        info!(store = %self.name, "Created event: {}", uid);
        Ok(uid)
    }

    async fn get(&self, id: &str) -> Result<Option<Appointment>> {
        self.fetch(id).await
    }

    async fn update(&self, id: &str, patch: &AppointmentPatch) -> Result<()> {
        let mut record = self
            .fetch(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        patch.apply(&mut record);
        self.put(id, &record, false).await?;

        debug!(store = %self.name, "Updated event: {}", id);
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        debug!(store = %self.name, "Deleting event: {}", id);

        let response = self.send(self.client.delete(self.event_url(id))).await?;
        self.check(response, "Delete event", id).await?;

        info!(store = %self.name, "Deleted event: {}", id);
        Ok(())
    }

    async fn find(&self, query: &StoreQuery) -> Result<Vec<Appointment>> {
        let range = match query {
            StoreQuery::TimeRange { start, end } => Some((*start, *end)),
            _ => None,
        };

        let mut found: Vec<_> = self
            .report(range)
            .await?
            .into_iter()
            .filter(|r| query.matches(r))
            .collect();
        sort_by_creation(&mut found);

        info!(store = %self.name, "Fetched {} events", found.len());
        Ok(found)
    }
}

fn status_error(status: StatusCode, id: &str, body: &str) -> StoreError {
    match status {
        StatusCode::NOT_FOUND | StatusCode::GONE => StoreError::NotFound(id.to_string()),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            StoreError::Configuration(format!("access denied ({}): {}", status, body))
        }
        StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => {
            StoreError::Unavailable(format!("{}: {}", status, body))
        }
        s if s.is_server_error() => StoreError::Unavailable(format!("{}: {}", status, body)),
        _ => StoreError::Caldav(format!("Request failed: {} - {}", status, body)),
    }
}

/// Extract the events carried in a multistatus REPORT response.
///
/// The event UID becomes the record identity.
fn parse_multistatus(response: &str) -> Result<Vec<Appointment>> {
    let mut records = Vec::new();
    let mut reader = Reader::from_str(response);
    reader.config_mut().trim_text(true);

    let mut buf = Vec::new();
    let mut in_calendar_data = false;
    let mut current_calendar_data = String::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) if e.local_name().as_ref() == b"calendar-data" => {
                in_calendar_data = true;
                current_calendar_data.clear();
            }
            Ok(Event::End(ref e)) if e.local_name().as_ref() == b"calendar-data" => {
                in_calendar_data = false;
                match parse_ical(&current_calendar_data) {
                    Ok(record) if record.id.is_some() => records.push(record),
                    Ok(_) => debug!("Skipping event without UID"),
                    Err(e) => debug!("Skipping unreadable event: {}", e),
                }
            }
            Ok(Event::Text(ref e)) if in_calendar_data => {
                let text = e
                    .unescape()
                    .map_err(|e| StoreError::XmlParse(e.to_string()))?;
                current_calendar_data.push_str(&text);
            }
            Ok(Event::CData(ref e)) if in_calendar_data => {
                current_calendar_data.push_str(&String::from_utf8_lossy(e));
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(StoreError::XmlParse(e.to_string()));
            }
            _ => {}
        }
        buf.clear();
    }

    Ok(records)
}
