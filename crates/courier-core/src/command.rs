//! Command — the decoded unit exchanged over a connection.
//!
//! A command is either a request (carrying a request code) or a response
//! (carrying a result code). Both share one shape. The `opaque` field is
//! the correlation id: whoever answers a request must copy it verbatim
//! into the response so the caller can match the reply to its pending call.

use std::fmt;

use bytes::Bytes;

/// Result codes carried by responses.
///
/// Handlers may answer with any other code for business-specific failures;
/// the runtime itself only ever produces these.
pub mod codes {
    pub const SUCCESS: i32 = 0;
    pub const SYSTEM_ERROR: i32 = 1;
    /// Overload. The request was not executed and may be retried.
    pub const SYSTEM_BUSY: i32 = 2;
    pub const REQUEST_CODE_NOT_SUPPORTED: i32 = 3;
}

/// Flag bits.
const RESPONSE_BIT: i32 = 0b01;
const ONEWAY_BIT: i32 = 0b10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Correlation id. Assigned by the sender of the request.
    pub opaque: i32,
    /// Request code for requests, result code for responses.
    pub code: i32,
    /// Bit 0: response. Bit 1: oneway (no response expected).
    pub flag: i32,
    /// Human-readable diagnostics.
    pub remark: Option<String>,
    pub body: Bytes,
}

impl Command {
    /// A request with the given code and payload. `opaque` starts at 0;
    /// the caller assigns it before sending.
    pub fn request(code: i32, body: impl Into<Bytes>) -> Self {
        Self {
            opaque: 0,
            code,
            flag: 0,
            remark: None,
            body: body.into(),
        }
    }

    /// A response with the given result code and remark.
    ///
    /// The opaque is left at 0. Use [`Command::response_to`] when the
    /// request being answered is at hand.
    pub fn response(code: i32, remark: impl Into<String>) -> Self {
        Self {
            opaque: 0,
            code,
            flag: RESPONSE_BIT,
            remark: Some(remark.into()),
            body: Bytes::new(),
        }
    }

    /// A response answering `request`, with its opaque already copied.
    pub fn response_to(request: &Command, code: i32, remark: impl Into<String>) -> Self {
        Self::response(code, remark).with_opaque(request.opaque)
    }

    pub fn with_opaque(mut self, opaque: i32) -> Self {
        self.opaque = opaque;
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn is_response(&self) -> bool {
        self.flag & RESPONSE_BIT != 0
    }

    pub fn mark_response(&mut self) {
        self.flag |= RESPONSE_BIT;
    }

    pub fn is_oneway(&self) -> bool {
        self.flag & ONEWAY_BIT != 0
    }

    pub fn mark_oneway(&mut self) {
        self.flag |= ONEWAY_BIT;
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.is_response() { "response" } else { "request" };
        write!(
            f,
            "{kind}(opaque={}, code={}, body={}B",
            self.opaque,
            self.code,
            self.body.len()
        )?;
        if let Some(remark) = &self.remark {
            write!(f, ", remark={remark:?}")?;
        }
        f.write_str(")")
    }
}
