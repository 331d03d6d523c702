use chrono::{DateTime, Utc};
use mail_parser::{HeaderValue, MessageParser};
use serde::Serialize;

/// Header fields carried on every ingestion event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HeaderSummary {
    pub message_id: Option<String>,
    pub subject: Option<String>,
    pub from: Option<String>,
    pub date: Option<DateTime<Utc>>,
    pub in_reply_to: Option<String>,
    pub references: Vec<String>,
}

/// Parse the headers needed for dedup and threading.
///
/// Returns `None` when the bytes do not look like a message at all, which
/// the listener treats as a malformed message to skip.
pub fn parse_summary(raw: &[u8]) -> Option<HeaderSummary> {
    let message = MessageParser::default().parse_headers(raw)?;
    if message.headers().is_empty() {
        return None;
    }

    let from = message.from().and_then(|addrs| addrs.first()).map(|addr| {
        match (addr.name(), addr.address()) {
            (Some(name), Some(address)) => format!("{} <{}>", name, address),
            (None, Some(address)) => address.to_string(),
            (Some(name), None) => name.to_string(),
            (None, None) => String::new(),
        }
    });

    let date = message
        .date()
        .and_then(|d| DateTime::from_timestamp(d.to_timestamp(), 0));

    let in_reply_to = first_id(message.in_reply_to());
    let references = id_list(message.references());

    Some(HeaderSummary {
        message_id: message.message_id().map(|s| s.to_string()),
        subject: message.subject().map(|s| s.to_string()),
        from: from.filter(|s| !s.is_empty()),
        date,
        in_reply_to,
        references,
    })
}

fn first_id(value: &HeaderValue<'_>) -> Option<String> {
    value
        .as_text_list()
        .and_then(|ids| ids.first().map(|s| s.to_string()))
}

fn id_list(value: &HeaderValue<'_>) -> Vec<String> {
    value
        .as_text_list()
        .map(|ids| ids.iter().map(|s| s.to_string()).collect())
        .unwrap_or_default()
}
