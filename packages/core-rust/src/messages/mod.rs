//! Terminal message envelope and the fragments a service pushes back to callers.
//!
//! A single [`TerminalMessage`] shape carries requests, interim frames, terminal
//! responses and heartbeats. Which of these a message is follows from which
//! optional body fields are present.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// ResponseBody
// ---------------------------------------------------------------------------

/// Terminal response carried in the `res` field of a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseBody {
    pub code: u16,
    pub message: String,
    /// Optional structured result attached by the handler.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub data: Option<Value>,
}

impl ResponseBody {
    #[must_use]
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Attaches a structured result to the response.
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

// ---------------------------------------------------------------------------
// TerminalMessage
// ---------------------------------------------------------------------------

/// Envelope exchanged between terminals on the bus.
///
/// Inbound requests carry `method` and `req`. Replies carry the same `trace_id`
/// and `method` plus exactly one of: nothing (heartbeat), `frame`, or `res`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TerminalMessage {
    pub trace_id: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub req: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub res: Option<ResponseBody>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub frame: Option<Value>,
    pub source_terminal_id: String,
    pub target_terminal_id: String,
}

impl TerminalMessage {
    /// Builds a request message addressed from `source` to `target`.
    #[must_use]
    pub fn request(
        trace_id: impl Into<String>,
        method: impl Into<String>,
        req: Value,
        source_terminal_id: impl Into<String>,
        target_terminal_id: impl Into<String>,
    ) -> Self {
        Self {
            trace_id: trace_id.into(),
            method: Some(method.into()),
            req: Some(req),
            res: None,
            frame: None,
            source_terminal_id: source_terminal_id.into(),
            target_terminal_id: target_terminal_id.into(),
        }
    }

    /// Returns `true` if this message opens a new request.
    ///
    /// A request needs a non-empty `method` and a non-null `req` payload, and
    /// must be neither a continuation frame nor a response.
    #[must_use]
    pub fn is_request(&self) -> bool {
        let has_method = self.method.as_deref().is_some_and(|m| !m.is_empty());
        let has_payload = self.req.as_ref().is_some_and(|req| !req.is_null());
        has_method && has_payload && self.frame.is_none() && self.res.is_none()
    }

    /// Returns `true` if the message carries no body at all (a keepalive).
    #[must_use]
    pub fn is_heartbeat(&self) -> bool {
        self.req.is_none() && self.res.is_none() && self.frame.is_none()
    }

    /// Method name, or the empty string when absent.
    #[must_use]
    pub fn method_name(&self) -> &str {
        self.method.as_deref().unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// ServiceOutput
// ---------------------------------------------------------------------------

/// A single fragment a service emits towards the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceOutput {
    /// Empty keepalive fragment.
    Heartbeat,
    /// Interim payload; more output follows.
    Frame(Value),
    /// Terminal response.
    Response(ResponseBody),
}

impl ServiceOutput {
    #[must_use]
    pub fn response(code: u16, message: impl Into<String>) -> Self {
        Self::Response(ResponseBody::new(code, message))
    }

    /// The response body, if this fragment is a terminal response.
    #[must_use]
    pub fn as_response(&self) -> Option<&ResponseBody> {
        match self {
            Self::Response(res) => Some(res),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// ReplyEnvelope
// ---------------------------------------------------------------------------

/// Addressing stamped onto every fragment sent back for one request.
///
/// Source and target are reversed relative to the request so the bus can
/// route the reply back to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyEnvelope {
    pub trace_id: String,
    pub method: Option<String>,
    pub source_terminal_id: String,
    pub target_terminal_id: String,
}

impl ReplyEnvelope {
    /// Derives the reply addressing for `request` as seen by `own_terminal_id`.
    #[must_use]
    pub fn for_request(request: &TerminalMessage, own_terminal_id: &str) -> Self {
        Self {
            trace_id: request.trace_id.clone(),
            method: request.method.clone(),
            source_terminal_id: own_terminal_id.to_string(),
            target_terminal_id: request.source_terminal_id.clone(),
        }
    }

    /// Wraps a fragment into a full outbound message.
    #[must_use]
    pub fn wrap(&self, output: ServiceOutput) -> TerminalMessage {
        let mut msg = TerminalMessage {
            trace_id: self.trace_id.clone(),
            method: self.method.clone(),
            req: None,
            res: None,
            frame: None,
            source_terminal_id: self.source_terminal_id.clone(),
            target_terminal_id: self.target_terminal_id.clone(),
        };
        match output {
            ServiceOutput::Heartbeat => {}
            ServiceOutput::Frame(frame) => msg.frame = Some(frame),
            ServiceOutput::Response(res) => msg.res = Some(res),
        }
        msg
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use serde_json::json;

    use super::*;

    fn sample_request() -> TerminalMessage {
        TerminalMessage::request("t-1", "Echo", json!({ "x": 1 }), "caller", "host")
    }

    #[test]
    fn request_classification() {
        assert!(sample_request().is_request());

        let mut no_method = sample_request();
        no_method.method = None;
        assert!(!no_method.is_request());

        let mut empty_method = sample_request();
        empty_method.method = Some(String::new());
        assert!(!empty_method.is_request());

        let mut no_payload = sample_request();
        no_payload.req = None;
        assert!(!no_payload.is_request());

        let mut frame = sample_request();
        frame.frame = Some(json!(1));
        assert!(!frame.is_request());

        let mut response = sample_request();
        response.res = Some(ResponseBody::new(0, "OK"));
        assert!(!response.is_request());
    }

    #[test]
    fn null_payload_is_not_a_request() {
        let raw = json!({
            "trace_id": "t",
            "method": "Echo",
            "req": null,
            "source_terminal_id": "a",
            "target_terminal_id": "b",
        });
        let msg: TerminalMessage = serde_json::from_value(raw).unwrap();
        assert!(!msg.is_request());
    }

    #[test]
    fn heartbeat_serializes_without_body_fields() {
        let envelope = ReplyEnvelope::for_request(&sample_request(), "host");
        let msg = envelope.wrap(ServiceOutput::Heartbeat);
        assert!(msg.is_heartbeat());

        let value = serde_json::to_value(&msg).unwrap();
        let obj = value.as_object().unwrap();
        assert!(!obj.contains_key("req"));
        assert!(!obj.contains_key("res"));
        assert!(!obj.contains_key("frame"));
        assert_eq!(obj["method"], json!("Echo"));
    }

    #[test]
    fn response_wraps_into_res_field() {
        let envelope = ReplyEnvelope::for_request(&sample_request(), "host");
        let msg = envelope.wrap(ServiceOutput::response(503, "Service Unavailable"));
        let res = msg.res.unwrap();
        assert_eq!(res.code, 503);
        assert_eq!(res.message, "Service Unavailable");
        assert!(msg.frame.is_none());
    }

    proptest! {
        #[test]
        fn reply_reverses_direction(
            trace in "[a-z0-9]{1,12}",
            caller in "[a-z]{1,8}",
            own in "[a-z]{1,8}",
            target in "[a-z]{1,8}",
        ) {
            let request =
                TerminalMessage::request(trace.clone(), "M", json!(null), caller.clone(), target);
            let envelope = ReplyEnvelope::for_request(&request, &own);
            let reply = envelope.wrap(ServiceOutput::Frame(json!(1)));

            prop_assert_eq!(reply.trace_id, trace);
            prop_assert_eq!(reply.method.as_deref(), Some("M"));
            prop_assert_eq!(reply.source_terminal_id, own);
            prop_assert_eq!(reply.target_terminal_id, caller);
        }
    }
}
