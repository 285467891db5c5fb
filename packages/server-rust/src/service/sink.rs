//! Per-request output sink.
//!
//! Every fragment written here is stamped with the request's reply envelope
//! and handed to the terminal transport. The sink remembers the last response
//! code it carried and is closed exactly once, at finalization.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use terminal_core::{ReplyEnvelope, ResponseBody, ServiceOutput};

use crate::traits::{OutboundSink, TransportError};

/// Error returned when a fragment cannot be delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SinkError {
    /// The request has been finalized; no further fragments are accepted.
    #[error("output sink is closed")]
    Closed,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, Default)]
struct SinkState {
    closed: bool,
    last_response_code: Option<u16>,
}

struct SinkInner {
    envelope: ReplyEnvelope,
    outbound: Arc<dyn OutboundSink>,
    state: Mutex<SinkState>,
}

/// Write-only handle to one request's output stream.
///
/// Cheap to clone; handlers receive a clone and may keep writing until the
/// dispatcher closes the sink.
#[derive(Clone)]
pub struct OutputSink {
    inner: Arc<SinkInner>,
}

impl OutputSink {
    pub(crate) fn new(envelope: ReplyEnvelope, outbound: Arc<dyn OutboundSink>) -> Self {
        Self {
            inner: Arc::new(SinkInner {
                envelope,
                outbound,
                state: Mutex::new(SinkState::default()),
            }),
        }
    }

    /// Pushes one fragment to the caller.
    ///
    /// # Errors
    ///
    /// Returns `SinkError::Closed` after finalization, or the transport error
    /// if the terminal output refused the message.
    pub fn send(&self, output: ServiceOutput) -> Result<(), SinkError> {
        // The state lock is held across the transport send so a concurrent
        // close cannot interleave with an in-progress write.
        let mut state = self.inner.state.lock();
        if state.closed {
            return Err(SinkError::Closed);
        }
        let code = output.as_response().map(|res| res.code);
        self.inner.outbound.send(self.inner.envelope.wrap(output))?;
        // Only delivered responses count.
        if code.is_some() {
            state.last_response_code = code;
        }
        Ok(())
    }

    /// Pushes an interim frame.
    ///
    /// # Errors
    ///
    /// See [`OutputSink::send`].
    pub fn frame(&self, frame: Value) -> Result<(), SinkError> {
        self.send(ServiceOutput::Frame(frame))
    }

    /// Pushes a terminal response.
    ///
    /// # Errors
    ///
    /// See [`OutputSink::send`].
    pub fn respond(&self, response: ResponseBody) -> Result<(), SinkError> {
        self.send(ServiceOutput::Response(response))
    }

    #[must_use]
    pub fn trace_id(&self) -> &str {
        &self.inner.envelope.trace_id
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Code of the most recent response written, if any.
    #[must_use]
    pub fn last_response_code(&self) -> Option<u16> {
        self.inner.state.lock().last_response_code
    }

    /// Closes the sink. Returns `false` if it was already closed.
    pub(crate) fn close(&self) -> bool {
        let mut state = self.inner.state.lock();
        !std::mem::replace(&mut state.closed, true)
    }
}

impl fmt::Debug for OutputSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputSink")
            .field("envelope", &self.inner.envelope)
            .field("state", &*self.inner.state.lock())
            .finish_non_exhaustive()
    }
}
