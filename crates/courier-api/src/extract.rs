//! Canonical message extraction from webhook payloads.
//!
//! This is the only place that decides whether an event is a real inbound
//! message. Receipts, echoes and malformed events come back as
//! [`ExtractionSkip`], which is a classification and not an error.

use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use courier_types::models::MediaType;

// -- Wire types --

#[derive(Debug, Deserialize)]
pub struct WebhookPayload {
    pub object: Option<String>,
    #[serde(default)]
    pub entry: Vec<Entry>,
}

/// One entry of a delivery. Events stay as raw JSON until [`extract`] looks
/// at them, so a single malformed event cannot fail the whole delivery.
#[derive(Debug, Deserialize)]
pub struct Entry {
    /// The messaging-channel id this delivery is addressed to.
    pub id: Option<String>,
    pub time: Option<Value>,
    #[serde(default)]
    pub messaging: Vec<Value>,
    #[serde(default)]
    pub changes: Vec<Value>,
}

#[derive(Debug, Deserialize)]
pub struct Change {
    pub field: Option<String>,
    #[serde(default)]
    pub value: Value,
}

#[derive(Debug, Default, Deserialize)]
pub struct MessagingEvent {
    pub sender: Option<Party>,
    pub recipient: Option<Party>,
    /// Epoch milliseconds; some payloads send it as a string.
    pub timestamp: Option<Value>,
    pub message: Option<EventMessage>,
    pub delivery: Option<Delivery>,
    pub read: Option<ReadReceipt>,
}

#[derive(Debug, Deserialize)]
pub struct Party {
    pub id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct EventMessage {
    pub mid: Option<String>,
    pub text: Option<String>,
    #[serde(default)]
    pub is_echo: bool,
    #[serde(default)]
    pub attachments: Vec<EventAttachment>,
}

#[derive(Debug, Deserialize)]
pub struct EventAttachment {
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: Option<AttachmentPayload>,
}

#[derive(Debug, Deserialize)]
pub struct AttachmentPayload {
    pub url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Delivery {
    #[serde(default)]
    pub mids: Vec<String>,
    pub watermark: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct ReadReceipt {
    pub watermark: Option<i64>,
}

// -- Canonical output --

/// A real inbound message, ready for routing.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub mid: String,
    /// `entry.id`: authoritative routing key.
    pub channel_id: String,
    /// `recipient.id`: routing fallback (platform account id).
    pub recipient_id: String,
    pub sender_id: String,
    pub text: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub attachments: Vec<InboundAttachment>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InboundAttachment {
    pub media_type: MediaType,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExtractionSkip {
    /// Delivery confirmation for messages we sent.
    DeliveryReceipt { mids: Vec<String> },
    ReadReceipt,
    /// A message the account itself sent.
    Echo { mid: Option<String> },
    MissingField { field: &'static str },
    /// Neither text nor a usable attachment.
    Empty { mid: String },
    /// A `changes[]` field other than `messages`, or an event kind we don't handle.
    Unsupported { kind: String },
    /// The event JSON does not have the expected shape.
    Malformed { reason: String },
}

/// Extract every event in `payload`, in delivery order.
pub fn extract(payload: &WebhookPayload) -> Vec<Result<InboundMessage, ExtractionSkip>> {
    let mut out = Vec::new();
    for entry in &payload.entry {
        let channel_id = entry.id.as_deref().filter(|id| !id.is_empty());
        for event in &entry.messaging {
            out.push(extract_raw(channel_id, event));
        }
        for change in &entry.changes {
            let change = match Change::deserialize(change) {
                Ok(change) => change,
                Err(e) => {
                    out.push(Err(malformed("change", &e)));
                    continue;
                }
            };
            match change.field.as_deref() {
                Some("messages") => out.push(extract_raw(channel_id, &change.value)),
                other => out.push(Err(ExtractionSkip::Unsupported {
                    kind: other.unwrap_or("unnamed change").to_string(),
                })),
            }
        }
    }
    out
}

fn extract_raw(channel_id: Option<&str>, raw: &Value) -> Result<InboundMessage, ExtractionSkip> {
    let event = MessagingEvent::deserialize(raw).map_err(|e| malformed("event", &e))?;
    let channel_id = channel_id.ok_or(ExtractionSkip::MissingField { field: "entry.id" })?;
    extract_event(channel_id, &event)
}

fn malformed(what: &str, err: &serde_json::Error) -> ExtractionSkip {
    debug!(error = %err, "malformed webhook {}", what);
    ExtractionSkip::Malformed {
        reason: format!("{what}: {err}"),
    }
}

pub fn extract_event(
    channel_id: &str,
    event: &MessagingEvent,
) -> Result<InboundMessage, ExtractionSkip> {
    if let Some(delivery) = &event.delivery {
        return Err(ExtractionSkip::DeliveryReceipt {
            mids: delivery.mids.clone(),
        });
    }
    if event.read.is_some() {
        return Err(ExtractionSkip::ReadReceipt);
    }

    let Some(message) = &event.message else {
        return Err(ExtractionSkip::Unsupported {
            kind: "non-message event".into(),
        });
    };

    let sender_id = party_id(&event.sender);
    if message.is_echo || sender_id == Some(channel_id) {
        return Err(ExtractionSkip::Echo {
            mid: message.mid.clone(),
        });
    }

    let mid = non_empty(message.mid.as_deref())
        .ok_or(ExtractionSkip::MissingField { field: "message.mid" })?;
    let sender_id = sender_id.ok_or(ExtractionSkip::MissingField { field: "sender.id" })?;
    let recipient_id =
        party_id(&event.recipient).ok_or(ExtractionSkip::MissingField { field: "recipient.id" })?;

    let attachments: Vec<InboundAttachment> = message
        .attachments
        .iter()
        .filter_map(|a| {
            let url = a.payload.as_ref().and_then(|p| non_empty(p.url.as_deref()));
            if url.is_none() {
                debug!(mid, kind = %a.kind, "dropping attachment without url");
            }
            url.map(|url| InboundAttachment {
                media_type: MediaType::from_platform(&a.kind),
                url: url.to_string(),
            })
        })
        .collect();

    let text = non_empty(message.text.as_deref()).map(str::to_string);
    if text.is_none() && attachments.is_empty() {
        return Err(ExtractionSkip::Empty {
            mid: mid.to_string(),
        });
    }

    Ok(InboundMessage {
        mid: mid.to_string(),
        channel_id: channel_id.to_string(),
        recipient_id: recipient_id.to_string(),
        sender_id: sender_id.to_string(),
        text,
        timestamp: event
            .timestamp
            .as_ref()
            .and_then(parse_millis)
            .unwrap_or_else(Utc::now),
        attachments,
    })
}

fn party_id(party: &Option<Party>) -> Option<&str> {
    party.as_ref().and_then(|p| non_empty(p.id.as_deref()))
}

fn non_empty(s: Option<&str>) -> Option<&str> {
    s.filter(|s| !s.is_empty())
}

fn parse_millis(value: &Value) -> Option<DateTime<Utc>> {
    let millis = match value {
        Value::Number(n) => n.as_i64()?,
        Value::String(s) => s.parse().ok()?,
        _ => return None,
    };
    Utc.timestamp_millis_opt(millis).single()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn payload(value: Value) -> WebhookPayload {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn text_message_is_extracted() {
        let p = payload(json!({
            "object": "instagram",
            "entry": [{
                "id": "C1",
                "time": 1700000000000i64,
                "messaging": [{
                    "sender": {"id": "u_1"},
                    "recipient": {"id": "P1"},
                    "timestamp": 1700000000123i64,
                    "message": {"mid": "mid.1", "text": "hello"}
                }]
            }]
        }));

        let out = extract(&p);
        assert_eq!(out.len(), 1);
        let msg = out[0].as_ref().unwrap();
        assert_eq!(msg.mid, "mid.1");
        assert_eq!(msg.channel_id, "C1");
        assert_eq!(msg.recipient_id, "P1");
        assert_eq!(msg.text.as_deref(), Some("hello"));
        assert_eq!(msg.timestamp.timestamp_millis(), 1700000000123);
    }

    #[test]
    fn changes_shape_and_string_timestamp() {
        let p = payload(json!({
            "entry": [{
                "id": "C1",
                "changes": [
                    {"field": "messages", "value": {
                        "sender": {"id": "u_1"},
                        "recipient": {"id": "C1x"},
                        "timestamp": "1700000000000",
                        "message": {"mid": "mid.2", "attachments": [
                            {"type": "image", "payload": {"url": "https://cdn/a.jpg"}},
                            {"type": "fallback", "payload": {}}
                        ]}
                    }},
                    {"field": "comments", "value": {}}
                ]
            }]
        }));

        let out = extract(&p);
        assert_eq!(out.len(), 2);
        let msg = out[0].as_ref().unwrap();
        assert_eq!(msg.attachments.len(), 1);
        assert_eq!(msg.attachments[0].media_type, MediaType::Image);
        assert_eq!(msg.timestamp.timestamp_millis(), 1700000000000);
        assert!(matches!(&out[1], Err(ExtractionSkip::Unsupported { kind }) if kind == "comments"));
    }

    #[test]
    fn receipts_and_echoes_are_skipped() {
        let p = payload(json!({
            "entry": [{
                "id": "C1",
                "messaging": [
                    {"sender": {"id": "u_1"}, "recipient": {"id": "C1"},
                     "delivery": {"mids": ["out.1"], "watermark": 1}},
                    {"sender": {"id": "u_1"}, "recipient": {"id": "C1"},
                     "read": {"watermark": 1}},
                    {"sender": {"id": "C1"}, "recipient": {"id": "u_1"},
                     "message": {"mid": "mid.3", "text": "our reply"}},
                    {"sender": {"id": "u_1"}, "recipient": {"id": "C1"},
                     "message": {"mid": "mid.4", "text": "x", "is_echo": true}}
                ]
            }]
        }));

        let out = extract(&p);
        assert_eq!(
            out[0],
            Err(ExtractionSkip::DeliveryReceipt {
                mids: vec!["out.1".into()]
            })
        );
        assert_eq!(out[1], Err(ExtractionSkip::ReadReceipt));
        assert!(matches!(out[2], Err(ExtractionSkip::Echo { .. })));
        assert!(matches!(out[3], Err(ExtractionSkip::Echo { .. })));
    }

    #[test]
    fn missing_identity_fields_are_skipped() {
        let missing_mid = MessagingEvent {
            sender: Some(Party { id: Some("u_1".into()) }),
            recipient: Some(Party { id: Some("C1".into()) }),
            message: Some(EventMessage {
                mid: None,
                text: Some("hi".into()),
                is_echo: false,
                attachments: vec![],
            }),
            ..Default::default()
        };
        assert_eq!(
            extract_event("C1", &missing_mid),
            Err(ExtractionSkip::MissingField { field: "message.mid" })
        );

        let missing_sender = MessagingEvent {
            sender: None,
            recipient: Some(Party { id: Some("C1".into()) }),
            message: Some(EventMessage {
                mid: Some("mid.5".into()),
                text: Some("hi".into()),
                is_echo: false,
                attachments: vec![],
            }),
            ..Default::default()
        };
        assert_eq!(
            extract_event("C1", &missing_sender),
            Err(ExtractionSkip::MissingField { field: "sender.id" })
        );
    }

    #[test]
    fn empty_message_is_skipped() {
        let event = MessagingEvent {
            sender: Some(Party { id: Some("u_1".into()) }),
            recipient: Some(Party { id: Some("C1".into()) }),
            message: Some(EventMessage {
                mid: Some("mid.6".into()),
                text: Some(String::new()),
                is_echo: false,
                attachments: vec![],
            }),
            ..Default::default()
        };
        assert_eq!(
            extract_event("C1", &event),
            Err(ExtractionSkip::Empty { mid: "mid.6".into() })
        );
    }

    #[test]
    fn one_malformed_event_does_not_sink_the_delivery() {
        let p = payload(json!({
            "object": "instagram",
            "entry": [{
                "id": "C1",
                "messaging": [
                    {"sender": {"id": "u_1"}, "recipient": {"id": "P1"},
                     "message": {"mid": "mid.7", "text": "real"}},
                    {"sender": "not-an-object", "message": 42}
                ],
                "changes": [
                    {"field": "feed", "value": {"message": "a page post"}},
                    {"field": "messages", "value": {"message": "a string, not an object"}},
                    "not-a-change"
                ]
            }]
        }));

        let out = extract(&p);
        assert_eq!(out.len(), 5);
        assert_eq!(out[0].as_ref().unwrap().mid, "mid.7");
        assert!(matches!(out[1], Err(ExtractionSkip::Malformed { .. })));
        assert!(matches!(&out[2], Err(ExtractionSkip::Unsupported { kind }) if kind == "feed"));
        assert!(matches!(out[3], Err(ExtractionSkip::Malformed { .. })));
        assert!(matches!(out[4], Err(ExtractionSkip::Malformed { .. })));
    }

    #[test]
    fn entry_without_id_skips_its_events() {
        let p = payload(json!({
            "entry": [{
                "time": "1700000000000",
                "messaging": [{"sender": {"id": "u_1"}, "recipient": {"id": "P1"},
                               "message": {"mid": "mid.8", "text": "hi"}}]
            }]
        }));

        assert_eq!(
            extract(&p),
            vec![Err(ExtractionSkip::MissingField { field: "entry.id" })]
        );
    }
}
