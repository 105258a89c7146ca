use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod outcome;
pub mod urls;

pub use outcome::{DeliveryOutcome, Recipient};

/// Opaque, unique-per-message identifier supplied by the host.
/// It is the correlation key in every generated url and event.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for MessageId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

pub const DELIVERED_DSN_STATUS: &str = "2.0.0";
pub const DELIVERED_DSN_MESSAGE: &str = "Delivered";
pub const BOUNCED_DSN_STATUS: &str = "5.X.X";
pub const BOUNCED_DSN_MESSAGE: &str = "Permanent Failure";
pub const DEFERRED_DSN_STATUS: &str = "4.X.X";
pub const DEFERRED_DSN_MESSAGE: &str = "Temporary Failure";

#[derive(Serialize, Deserialize, Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// The message was accepted by the destination
    Delivered,
    /// The message permanently failed for this recipient
    Bounced,
    /// Delivery was temporarily unsuccessful and will be retried
    /// by the host. Only dispatched when explicitly enabled.
    Deferred,
}

impl EventKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Delivered => "delivered",
            Self::Bounced => "bounced",
            Self::Deferred => "deferred",
        }
    }

    /// The DSN status code and message to report when the host
    /// didn't supply any
    pub const fn default_dsn(&self) -> (&'static str, &'static str) {
        match self {
            Self::Delivered => (DELIVERED_DSN_STATUS, DELIVERED_DSN_MESSAGE),
            Self::Bounced => (BOUNCED_DSN_STATUS, BOUNCED_DSN_MESSAGE),
            Self::Deferred => (DEFERRED_DSN_STATUS, DEFERRED_DSN_MESSAGE),
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.write_str(self.as_str())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DeliveryDetail {
    /// The recipient address, as originally submitted
    pub recipient: String,
    pub dsn_status: String,
    pub dsn_message: String,
}

impl DeliveryDetail {
    /// Build the detail for a recipient.
    /// Delivered events always report `2.0.0 Delivered`; the other
    /// kinds use the supplied status, falling back to the defaults
    /// for the kind when it is absent or empty.
    pub fn new(
        kind: EventKind,
        recipient: &str,
        dsn_status: Option<&str>,
        dsn_message: Option<&str>,
    ) -> Self {
        let (default_status, default_message) = kind.default_dsn();
        let (dsn_status, dsn_message) = match kind {
            EventKind::Delivered => (default_status, default_message),
            EventKind::Bounced | EventKind::Deferred => (
                dsn_status
                    .filter(|s| !s.is_empty())
                    .unwrap_or(default_status),
                dsn_message
                    .filter(|s| !s.is_empty())
                    .unwrap_or(default_message),
            ),
        };

        Self {
            recipient: recipient.to_string(),
            dsn_status: dsn_status.to_string(),
            dsn_message: dsn_message.to_string(),
        }
    }
}

/// The payload POSTed to the tracking service
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryEvent {
    pub event_type: EventKind,
    pub email_id: MessageId,
    pub details: DeliveryDetail,
    /// When this event was created
    #[serde(with = "iso8601")]
    pub timestamp: DateTime<Utc>,
}

impl DeliveryEvent {
    pub fn new(kind: EventKind, email_id: &MessageId, details: DeliveryDetail) -> Self {
        Self {
            event_type: kind,
            email_id: email_id.clone(),
            details,
            timestamp: Utc::now(),
        }
    }
}

/// Serializes timestamps in the ISO-8601 form that javascript's
/// `Date.prototype.toISOString` produces, with millisecond precision.
mod iso8601 {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(d: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        s.serialize_str(&d.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    pub fn deserialize<'a, D>(d: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'a>,
    {
        let text = String::deserialize(d)?;
        DateTime::parse_from_rfc3339(&text)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}
