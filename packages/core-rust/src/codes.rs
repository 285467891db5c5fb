//! Numeric response codes exchanged with callers.
//!
//! Handlers are free to emit any code in their own responses; the codes below
//! are the ones the dispatch layer itself produces.

/// Bad request: unknown method, no validator accepts the payload, or more
/// than one validator accepts it.
pub const BAD_REQUEST: u16 = 400;

/// Internal error: the handler failed, timed out, or a runtime invariant broke.
pub const INTERNAL_SERVER_ERROR: u16 = 500;

/// The service's pending queue is at capacity.
pub const SERVICE_UNAVAILABLE: u16 = 503;

/// Sentinel recorded in duration metrics when a request finalized without any
/// response having been emitted. Never sent on the wire by the dispatcher.
pub const NO_RESPONSE: u16 = 520;
