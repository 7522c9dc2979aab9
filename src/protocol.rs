use std::borrow::Borrow;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{InvalidIdentity, MalformedMessage};

const MAX_IDENTITY_LEN: usize = 256;

/// Opaque name of one live signaling channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Identity(String);

impl Identity {
    pub fn new(raw: impl Into<String>) -> Result<Self, InvalidIdentity> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(InvalidIdentity::Empty);
        }
        if raw.chars().count() > MAX_IDENTITY_LEN {
            return Err(InvalidIdentity::TooLong { max: MAX_IDENTITY_LEN });
        }
        if raw.chars().any(char::is_control) {
            return Err(InvalidIdentity::ControlCharacter);
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Identity {
    type Error = InvalidIdentity;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Self::new(raw)
    }
}

impl From<Identity> for String {
    fn from(id: Identity) -> Self {
        id.0
    }
}

impl Borrow<str> for Identity {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The `type` tag of a client-originated signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    CallRequest,
    Offer,
    Answer,
    Candidate,
    CallAccepted,
    CallEnded,
}

impl SignalKind {
    const ALL: [SignalKind; 6] = [
        SignalKind::CallRequest,
        SignalKind::Offer,
        SignalKind::Answer,
        SignalKind::Candidate,
        SignalKind::CallAccepted,
        SignalKind::CallEnded,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SignalKind::CallRequest => "call-request",
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::Candidate => "candidate",
            SignalKind::CallAccepted => "call-accepted",
            SignalKind::CallEnded => "call-ended",
        }
    }

    /// Fields that must be present (and non-null) besides `type` and `recipientId`.
    pub fn required_fields(self) -> &'static [&'static str] {
        match self {
            SignalKind::CallRequest => &["callId", "callType"],
            SignalKind::Offer => &["callId", "offer"],
            SignalKind::Answer => &["callId", "answer"],
            SignalKind::Candidate => &["callId", "candidate"],
            SignalKind::CallAccepted => &["signal"],
            SignalKind::CallEnded => &[],
        }
    }
}

impl FromStr for SignalKind {
    type Err = MalformedMessage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| MalformedMessage::UnknownType(s.to_owned()))
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated client signal. Everything except `type`, `recipientId` and
/// `senderId` is kept verbatim in `fields` and never interpreted.
#[derive(Debug, Clone)]
pub struct InboundSignal {
    pub kind: SignalKind,
    pub recipient: Identity,
    /// Whatever the client put in `senderId`. Never trusted.
    pub claimed_sender: Option<Value>,
    pub fields: Map<String, Value>,
}

impl InboundSignal {
    pub fn parse(text: &str) -> Result<Self, MalformedMessage> {
        let Value::Object(mut fields) = serde_json::from_str::<Value>(text)? else {
            return Err(MalformedMessage::NotAnObject);
        };

        let kind = match fields.remove("type") {
            Some(Value::String(tag)) => tag.parse::<SignalKind>()?,
            Some(_) => return Err(MalformedMessage::InvalidField("type")),
            None => return Err(MalformedMessage::MissingField("type")),
        };

        let recipient = match fields.remove("recipientId") {
            Some(Value::String(raw)) => {
                Identity::new(raw).map_err(MalformedMessage::InvalidRecipient)?
            }
            Some(_) => return Err(MalformedMessage::InvalidField("recipientId")),
            None => return Err(MalformedMessage::MissingField("recipientId")),
        };

        let claimed_sender = fields.remove("senderId");

        for &field in kind.required_fields() {
            if fields.get(field).is_none_or(Value::is_null) {
                return Err(MalformedMessage::MissingField(field));
            }
        }

        Ok(Self {
            kind,
            recipient,
            claimed_sender,
            fields,
        })
    }

    /// Build the frame delivered to the recipient: the original payload,
    /// stamped with the channel-bound sender and without `recipientId`.
    pub fn attribute(self, sender: &Identity) -> String {
        let mut out = self.fields;
        out.insert("type".into(), Value::String(self.kind.as_str().into()));
        out.insert("senderId".into(), Value::String(sender.as_str().into()));
        Value::Object(out).to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HangupReason {
    Disconnected,
}

/// Messages the relay itself originates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerEvent {
    /// Sent once after registration: tells the client its own identity.
    Identified { id: Identity },
    /// Advisory notice that a peer's channel went away.
    CallEnded {
        #[serde(rename = "senderId")]
        sender_id: Identity,
        reason: HangupReason,
    },
}

impl ServerEvent {
    pub fn to_json(&self) -> String {
        // Only strings and unit enums inside; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}
