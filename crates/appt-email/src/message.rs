//! Inbound message parsing
//!
//! Decoding (RFC 2047 words, transfer encodings, nested multipart) is left to
//! `mail-parser`; this module keeps what the extractor needs. The first
//! inline text part wins and HTML-only bodies are reduced to their text.

use chrono::{DateTime, FixedOffset};
use mail_parser::{Address, MessageParser};
use tracing::debug;

use crate::error::{EmailError, Result};

/// A parsed inbound message
#[derive(Debug, Clone, PartialEq)]
pub struct MailMessage {
    pub subject: Option<String>,
    pub from: Option<String>,
    pub date: Option<DateTime<FixedOffset>>,
    pub message_id: Option<String>,
    /// Decoded text of the first readable body part
    pub body: String,
}

impl MailMessage {
    pub fn parse(raw: &str) -> Result<Self> {
        Self::parse_bytes(raw.as_bytes())
    }

    /// Parse a raw RFC 5322 message, whatever its charset
    pub fn parse_bytes(raw: &[u8]) -> Result<Self> {
        let parsed = MessageParser::default()
            .parse(raw)
            .filter(|message| !message.headers().is_empty())
            .ok_or_else(|| EmailError::Parsing("no message headers found".to_string()))?;

        let subject = parsed.subject().map(|s| s.trim().to_string());
        let from = parsed.from().and_then(format_sender);
        // Dates mail-parser cannot make sense of come back out of range
        let date = parsed
            .date()
            .filter(|d| d.is_valid())
            .and_then(|d| DateTime::parse_from_rfc3339(&d.to_rfc3339()).ok());
        let message_id = parsed.message_id().map(str::to_string);

        let body = parsed
            .body_text(0)
            .map(|text| text.trim().to_string())
            .unwrap_or_default();
        if body.is_empty() && subject.as_deref().is_none_or(str::is_empty) {
            return Err(EmailError::NoBody);
        }

        debug!(
            subject = ?subject,
            from = ?from,
            body_chars = body.len(),
            "Parsed inbound message"
        );
        Ok(Self {
            subject,
            from,
            date,
            message_id,
            body,
        })
    }

    /// Text handed to the extractor: subject line first, then the body
    pub fn extraction_text(&self) -> String {
        match self.subject.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            Some(subject) => format!("Subject: {}\n\n{}", subject, self.body.trim()),
            None => self.body.trim().to_string(),
        }
    }
}

/// `Name <address>` for the first sender, or the bare address
fn format_sender(address: &Address<'_>) -> Option<String> {
    let sender = address.first()?;
    match (sender.name(), sender.address()) {
        (Some(name), Some(addr)) if !name.trim().is_empty() => {
            Some(format!("{} <{}>", name.trim(), addr))
        }
        (_, Some(addr)) => Some(addr.to_string()),
        (Some(name), None) => Some(name.trim().to_string()),
        (None, None) => None,
    }
}
