//! # Request Envelope
//!
//! Purpose: Bundle the outgoing payload, its optional deadline, and the
//! callback that receives the outcome.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;

use fkv_common::{TransportError, TransportResult};

/// Callback receiving the response payload or the reason the request failed.
///
/// Invoked exactly once per accepted request. Error outcomes carry no
/// response bytes.
pub type ResponseHandler = Box<dyn FnOnce(TransportResult<Bytes>) + Send + 'static>;

/// One outgoing request and the handler for its response.
pub struct Request {
    payload: Bytes,
    deadline: Option<Duration>,
    handler: ResponseHandler,
}

impl Request {
    /// Builds a request with a millisecond deadline.
    ///
    /// A negative `deadline_ms` means the request never times out.
    pub fn new<F>(payload: impl Into<Bytes>, deadline_ms: i64, on_complete: F) -> Self
    where
        F: FnOnce(TransportResult<Bytes>) + Send + 'static,
    {
        let deadline = u64::try_from(deadline_ms).ok().map(Duration::from_millis);
        Self::with_deadline(payload, deadline, on_complete)
    }

    /// Builds a request with an optional deadline.
    pub fn with_deadline<F>(payload: impl Into<Bytes>, deadline: Option<Duration>, on_complete: F) -> Self
    where
        F: FnOnce(TransportResult<Bytes>) + Send + 'static,
    {
        Request {
            payload: payload.into(),
            deadline,
            handler: Box::new(on_complete),
        }
    }

    /// Outgoing payload, without the length prefix.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Time allowed from the moment the connection picks the request up.
    pub fn deadline(&self) -> Option<Duration> {
        self.deadline
    }

    /// Wraps the completion handler, e.g. to release pool resources first.
    pub(crate) fn map_handler<F>(self, wrap: F) -> Self
    where
        F: FnOnce(ResponseHandler) -> ResponseHandler,
    {
        Request {
            payload: self.payload,
            deadline: self.deadline,
            handler: wrap(self.handler),
        }
    }

    /// Completes the request without sending it.
    pub(crate) fn fail(self, error: TransportError) {
        (self.handler)(Err(error));
    }

    pub(crate) fn into_parts(self) -> (Bytes, Option<Duration>, ResponseHandler) {
        (self.payload, self.deadline, self.handler)
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("payload_len", &self.payload.len())
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}
