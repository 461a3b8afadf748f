use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    domain::{CallId, GroupName, UserId},
    error::ApiError,
};

/// Signal types carried inside the `SIGNAL|...` envelope.
///
/// The one-shot audio blob travels under the historical wire name `MSG`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    CallRequest,
    CallAccept,
    CallReject,
    CallEnd,
    Offer,
    Answer,
    IceCandidate,
    AudioChunk,
}

impl SignalKind {
    pub fn wire_name(self) -> &'static str {
        match self {
            Self::CallRequest => "CALL_REQUEST",
            Self::CallAccept => "CALL_ACCEPT",
            Self::CallReject => "CALL_REJECT",
            Self::CallEnd => "CALL_END",
            Self::Offer => "OFFER",
            Self::Answer => "ANSWER",
            Self::IceCandidate => "ICE_CANDIDATE",
            Self::AudioChunk => "MSG",
        }
    }

    pub fn from_wire(name: &str) -> Option<Self> {
        match name {
            "CALL_REQUEST" => Some(Self::CallRequest),
            "CALL_ACCEPT" => Some(Self::CallAccept),
            "CALL_REJECT" => Some(Self::CallReject),
            "CALL_END" => Some(Self::CallEnd),
            "OFFER" => Some(Self::Offer),
            "ANSWER" => Some(Self::Answer),
            "ICE_CANDIDATE" => Some(Self::IceCandidate),
            "MSG" => Some(Self::AudioChunk),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamFormat {
    Pcm,
    Webm,
}

impl StreamFormat {
    pub fn wire_name(self) -> &'static str {
        match self {
            Self::Pcm => "pcm",
            Self::Webm => "webm",
        }
    }

    pub fn from_wire(name: &str) -> Option<Self> {
        match name {
            "pcm" => Some(Self::Pcm),
            "webm" => Some(Self::Webm),
            _ => None,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("empty frame")]
    Empty,
    #[error("unknown envelope `{0}`")]
    UnknownEnvelope(String),
    #[error("unknown signal type `{0}`")]
    UnknownSignal(String),
    #[error("frame is missing its `{0}` field")]
    MissingField(&'static str),
}

/// One text frame on the signaling channel.
///
/// `Signal` payloads may themselves contain `|`; parsing therefore splits
/// the envelope into at most four fields and keeps the remainder intact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// `SIGNAL|<peer>|<TYPE>|<payload>`; `peer` is the target when sending
    /// and the sender when receiving.
    Signal {
        peer: UserId,
        kind: SignalKind,
        payload: String,
    },
    /// `INCOMING_CALL|<caller>|<callId>`, pushed by the server outside the
    /// SIGNAL envelope, with no negotiation payload attached.
    IncomingCall { caller: UserId, call_id: CallId },
    /// `START_STREAM|<target>|format=<fmt>` opens a raw-audio stream.
    StartStream {
        target: UserId,
        format: StreamFormat,
    },
    /// `STOP_STREAM` closes the raw-audio stream.
    StopStream,
    /// `ERROR|<message>` is a server-reported failure, logged and dropped.
    ServerError { message: String },
}

impl Frame {
    pub fn signal(peer: impl Into<String>, kind: SignalKind, payload: impl Into<String>) -> Self {
        Self::Signal {
            peer: UserId::new(peer),
            kind,
            payload: payload.into(),
        }
    }

    pub fn encode(&self) -> String {
        match self {
            Self::Signal {
                peer,
                kind,
                payload,
            } => format!("SIGNAL|{peer}|{}|{payload}", kind.wire_name()),
            Self::IncomingCall { caller, call_id } => {
                format!("INCOMING_CALL|{caller}|{call_id}")
            }
            Self::StartStream { target, format } => {
                format!("START_STREAM|{target}|format={}", format.wire_name())
            }
            Self::StopStream => "STOP_STREAM".to_string(),
            Self::ServerError { message } => format!("ERROR|{message}"),
        }
    }

    pub fn parse(raw: &str) -> Result<Self, FrameError> {
        if raw.is_empty() {
            return Err(FrameError::Empty);
        }
        let (envelope, rest) = match raw.split_once('|') {
            Some((envelope, rest)) => (envelope, rest),
            None => (raw, ""),
        };
        match envelope {
            "SIGNAL" => {
                let mut fields = rest.splitn(3, '|');
                let peer = fields
                    .next()
                    .filter(|s| !s.is_empty())
                    .ok_or(FrameError::MissingField("sender"))?;
                let kind = fields.next().ok_or(FrameError::MissingField("type"))?;
                let kind = SignalKind::from_wire(kind)
                    .ok_or_else(|| FrameError::UnknownSignal(kind.to_string()))?;
                let payload = fields.next().unwrap_or_default().to_string();
                Ok(Self::Signal {
                    peer: UserId::new(peer),
                    kind,
                    payload,
                })
            }
            "INCOMING_CALL" => {
                let (caller, call_id) = rest
                    .split_once('|')
                    .ok_or(FrameError::MissingField("callId"))?;
                if caller.is_empty() {
                    return Err(FrameError::MissingField("caller"));
                }
                Ok(Self::IncomingCall {
                    caller: UserId::new(caller),
                    call_id: CallId::new(call_id),
                })
            }
            "START_STREAM" => {
                let (target, format) = rest
                    .split_once('|')
                    .ok_or(FrameError::MissingField("format"))?;
                let format = format
                    .strip_prefix("format=")
                    .and_then(StreamFormat::from_wire)
                    .ok_or(FrameError::MissingField("format"))?;
                Ok(Self::StartStream {
                    target: UserId::new(target),
                    format,
                })
            }
            "STOP_STREAM" => Ok(Self::StopStream),
            "ERROR" => Ok(Self::ServerError {
                message: rest.to_string(),
            }),
            other => Err(FrameError::UnknownEnvelope(other.to_string())),
        }
    }
}

/// Opaque session description; never inspected beyond presence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: String,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: "offer".to_string(),
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: "answer".to_string(),
            sdp: sdp.into(),
        }
    }
}

/// A trickled ICE candidate, carried verbatim as its JSON text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IceCandidate(pub String);

/// JSON payload of a CALL_REQUEST signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallRequestPayload {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offer: Option<SessionDescription>,
}

impl CallRequestPayload {
    pub fn new(offer: SessionDescription) -> Self {
        Self {
            kind: "CALL_REQUEST".to_string(),
            offer: Some(offer),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallLogStatus {
    Started,
    Ended,
}

/// Typed message content, decided once at the ingestion boundary.
///
/// Anything that is not a recognized JSON object ingests as `Text`; two
/// contents are equal exactly when their canonical serialized forms are.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageContent {
    Text {
        body: String,
    },
    File {
        name: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
        data: String,
    },
    Audio {
        data: String,
        #[serde(rename = "durationMs", default)]
        duration_ms: u64,
    },
    CallLog {
        status: CallLogStatus,
        #[serde(rename = "durationMs", default)]
        duration_ms: u64,
    },
}

impl MessageContent {
    pub fn text(body: impl Into<String>) -> Self {
        Self::Text { body: body.into() }
    }

    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.starts_with('{') {
            if let Ok(content) = serde_json::from_str::<MessageContent>(trimmed) {
                return content;
            }
        }
        Self::Text {
            body: raw.to_string(),
        }
    }

    /// Wire form: the bare body for text, canonical JSON for everything else.
    pub fn render(&self) -> String {
        match self {
            Self::Text { body } => body.clone(),
            other => serde_json::to_string(other).unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallInfo {
    pub call_id: CallId,
    pub caller: UserId,
    pub callee: UserId,
    #[serde(default)]
    pub active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum RpcRequest {
    SendMessage {
        receiver: String,
        content: String,
    },
    SendAudio {
        receiver: String,
        payload_b64: String,
    },
    StartCall {
        caller: UserId,
        callee: UserId,
    },
    EndCall {
        call_id: CallId,
    },
    GetActiveCalls {
        user_id: UserId,
    },
    GetHistory {
        target: String,
    },
    Subscribe {
        user_id: UserId,
        subscriber_id: String,
    },
}

impl RpcRequest {
    pub fn op_name(&self) -> &'static str {
        match self {
            Self::SendMessage { .. } => "send_message",
            Self::SendAudio { .. } => "send_audio",
            Self::StartCall { .. } => "start_call",
            Self::EndCall { .. } => "end_call",
            Self::GetActiveCalls { .. } => "get_active_calls",
            Self::GetHistory { .. } => "get_history",
            Self::Subscribe { .. } => "subscribe",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum RpcReply {
    Ack,
    CallStarted { call: CallInfo },
    ActiveCalls { calls: Vec<CallInfo> },
    History { entries: Vec<String> },
    Error(ApiError),
}

/// Events pushed by the middleware to a subscribed client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum RpcPush {
    NewMessage {
        sender: UserId,
        receiver: String,
        content: String,
        #[serde(default)]
        timestamp: Option<DateTime<Utc>>,
    },
    CallStarted {
        call: CallInfo,
    },
    CallEnded {
        call_id: CallId,
    },
}

/// One record from the gateway's pending-message poll endpoint:
/// `MSG|from|content` or `GROUP|groupName|from|content`. Content may
/// contain `|` and is kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingRecord {
    Direct {
        from: UserId,
        content: String,
    },
    Group {
        group: GroupName,
        from: UserId,
        content: String,
    },
}

impl PendingRecord {
    pub fn parse(raw: &str) -> Result<Self, FrameError> {
        let (tag, rest) = raw.split_once('|').ok_or(FrameError::Empty)?;
        match tag {
            "MSG" => {
                let (from, content) = rest
                    .split_once('|')
                    .ok_or(FrameError::MissingField("content"))?;
                if from.is_empty() {
                    return Err(FrameError::MissingField("from"));
                }
                Ok(Self::Direct {
                    from: UserId::new(from),
                    content: content.to_string(),
                })
            }
            "GROUP" => {
                let (group, rest) = rest
                    .split_once('|')
                    .ok_or(FrameError::MissingField("from"))?;
                let (from, content) = rest
                    .split_once('|')
                    .ok_or(FrameError::MissingField("content"))?;
                if group.is_empty() || from.is_empty() {
                    return Err(FrameError::MissingField("from"));
                }
                Ok(Self::Group {
                    group: GroupName::new(group),
                    from: UserId::new(from),
                    content: content.to_string(),
                })
            }
            other => Err(FrameError::UnknownEnvelope(other.to_string())),
        }
    }
}

/// One backend history entry, formatted by the server as
/// `{type:text,from:X,target:Y,isGroup:b,msg:M,ts:T}`. The format is not
/// JSON; fields are scanned tolerantly and unparseable entries skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryRecord {
    pub from: UserId,
    pub target: String,
    pub is_group: bool,
    pub message: String,
    pub timestamp: Option<DateTime<Utc>>,
}

impl HistoryRecord {
    pub fn parse(raw: &str) -> Option<Self> {
        let from = scan_field(raw, "from:")?;
        let target = scan_field(raw, "target:")?;
        let is_group = raw.contains("isGroup:true");

        let msg_start = raw.find("msg:")? + "msg:".len();
        let msg_end = raw[msg_start..].find(",ts:").map(|i| msg_start + i)?;
        let message = raw[msg_start..msg_end].to_string();

        let ts_raw = raw[msg_end + ",ts:".len()..].trim_end_matches(['}', ']']);
        let timestamp = DateTime::parse_from_rfc3339(ts_raw)
            .ok()
            .map(|t| t.with_timezone(&Utc));

        Some(Self {
            from: UserId::new(from),
            target,
            is_group,
            message,
            timestamp,
        })
    }
}

fn scan_field(raw: &str, key: &str) -> Option<String> {
    let start = raw.find(key)? + key.len();
    let rest = &raw[start..];
    let end = rest.find(',').unwrap_or(rest.len());
    let value = rest[..end].trim().trim_end_matches(['}', ']']);
    (!value.is_empty()).then(|| value.to_string())
}
