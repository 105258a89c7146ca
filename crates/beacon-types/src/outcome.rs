use crate::{DeliveryDetail, DeliveryEvent, EventKind, MessageId};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    /// The address as originally submitted to the host
    pub original: String,
}

impl Recipient {
    pub fn new(original: impl Into<String>) -> Self {
        Self {
            original: original.into(),
        }
    }
}

/// A delivery outcome as reported by the host.
/// A missing recipient list is treated the same as an empty one.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryOutcome {
    #[serde(default)]
    pub recipients: Option<Vec<Recipient>>,
    #[serde(default)]
    pub status_code: Option<String>,
    #[serde(default)]
    pub status_message: Option<String>,
}

impl DeliveryOutcome {
    pub fn new(recipients: Vec<Recipient>) -> Self {
        Self {
            recipients: Some(recipients),
            ..Self::default()
        }
    }

    pub fn with_status(mut self, code: Option<String>, message: Option<String>) -> Self {
        self.status_code = code;
        self.status_message = message;
        self
    }

    pub fn recipients(&self) -> &[Recipient] {
        self.recipients.as_deref().unwrap_or(&[])
    }

    /// Produce one event per recipient, in recipient order
    pub fn events(&self, kind: EventKind, message_id: &MessageId) -> Vec<DeliveryEvent> {
        self.recipients()
            .iter()
            .map(|recip| {
                DeliveryEvent::new(
                    kind,
                    message_id,
                    DeliveryDetail::new(
                        kind,
                        &recip.original,
                        self.status_code.as_deref(),
                        self.status_message.as_deref(),
                    ),
                )
            })
            .collect()
    }
}
