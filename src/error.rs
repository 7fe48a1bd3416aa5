use std::{fmt::Display, str::Utf8Error, string::FromUtf8Error};

use actix_web::{http::StatusCode, HttpResponse, HttpResponseBuilder, ResponseError};
use displaydoc::Display;
use serde_json::{json, Error as JsonError};
use tracing_error::SpanTrace;

use crate::{canonical::NonCanonicalizable, util::MxidError};

// All-seeing all-knowing error type
#[derive(Debug)]
pub struct Error {
    inner: ErrorKind,
    spantrace: SpanTrace,
}

impl Error {
    pub fn kind(&self) -> &ErrorKind {
        &self.inner
    }
}

impl<T: Into<ErrorKind>> From<T> for Error {
    fn from(inner: T) -> Self {
        let spantrace = SpanTrace::capture();
        Error { inner: inner.into(), spantrace }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}\n{}", self.inner, self.spantrace)
    }
}

#[derive(Debug, Display)]
pub enum ErrorKind {
    /// Forbidden access, e.g. a PDU denied by a server ACL or auth rules.
    Forbidden,
    /// The request carried no usable X-Matrix authorization: {0}
    Unauthorized(String),
    /// Request contained valid JSON, but it was malformed in some way, e.g. missing required keys,
    /// invalid values for keys: {0}
    BadJson(String),
    /// Request did not contain valid JSON: {0}
    NotJson(String),
    /// No resource was found for this request.
    NotFound,
    /// The specified room was not found on this server: {0}
    RoomNotFound(String),
    /// The request exceeded a transaction or payload limit: {0}
    TooLarge(String),
    /// A required URL parameter was missing from the request: {0}
    MissingParam(String),
    /// A specified URL parameter has an invalid value: {0}
    InvalidParam(String),
    /// The specified room version is not supported.
    UnsupportedRoomVersion,
    /// An event failed validation before any state was touched: {0}
    InvalidEvent(String),
    /// An event's declared content hash did not match its contents.
    HashMismatch,
    /// No valid signature by {0} could be verified.
    SignatureInvalid(String),
    /// The event is not allowed by the authorization rules: {0}
    AuthFailed(String),
    /// The value could not be canonicalized: {0}
    NotCanonical(NonCanonicalizable),
    /// A remote server could not be reached after retries: {0}
    Unreachable(String),
    /// A federation request hit its deadline.
    Timeout,
    /// The remote server answered with an error: {0}
    RemoteError(String),

    /// An encoded string in the URL was not valid UTF-8: {0}
    UrlNotUtf8(Utf8Error),
    /// A database error occurred: {0}
    DbError(String),
    /// An unknown error occurred: {0}
    Unknown(String),
}

impl ResponseError for Error {
    fn status_code(&self) -> StatusCode {
        use ErrorKind::*;
        match self.inner {
            Forbidden | AuthFailed(_) => StatusCode::FORBIDDEN,
            Unauthorized(_) | SignatureInvalid(_) => StatusCode::UNAUTHORIZED,
            NotFound | RoomNotFound(_) => StatusCode::NOT_FOUND,
            TooLarge(_) | BadJson(_) | NotJson(_) | MissingParam(_) | InvalidParam(_)
                | UnsupportedRoomVersion | InvalidEvent(_) | HashMismatch | NotCanonical(_)
                | UrlNotUtf8(_) => StatusCode::BAD_REQUEST,
            Unreachable(_) | Timeout | RemoteError(_) => StatusCode::BAD_GATEWAY,
            DbError(_) | Unknown(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        use ErrorKind::*;
        let errcode = match self.inner {
            Forbidden | AuthFailed(_) => "M_FORBIDDEN",
            Unauthorized(_) | SignatureInvalid(_) => "M_UNAUTHORIZED",
            BadJson(_) | InvalidEvent(_) | HashMismatch | NotCanonical(_) => "M_BAD_JSON",
            NotJson(_) => "M_NOT_JSON",
            NotFound | RoomNotFound(_) => "M_NOT_FOUND",
            TooLarge(_) => "M_TOO_LARGE",
            MissingParam(_) => "M_MISSING_PARAM",
            InvalidParam(_) => "M_INVALID_PARAM",
            UnsupportedRoomVersion => "M_UNSUPPORTED_ROOM_VERSION",
            Unreachable(_) | Timeout | RemoteError(_) | UrlNotUtf8(_) | DbError(_)
                | Unknown(_) => "M_UNKNOWN",
        };
        let error = format!("{}", self.inner);
        HttpResponseBuilder::new(self.status_code()).json(json!({
            "errcode": errcode,
            "error": error
        }))
    }
}

impl std::error::Error for Error {}

impl From<Utf8Error> for ErrorKind {
    fn from(e: Utf8Error) -> Self {
        ErrorKind::UrlNotUtf8(e)
    }
}

impl From<FromUtf8Error> for ErrorKind {
    fn from(e: FromUtf8Error) -> Self {
        ErrorKind::NotJson(format!("{}", e))
    }
}

impl From<JsonError> for ErrorKind {
    fn from(e: JsonError) -> Self {
        use serde_json::error::Category;
        match e.classify() {
            Category::Data => ErrorKind::BadJson(format!("{}", e)),
            _ => ErrorKind::NotJson(format!("{}", e)),
        }
    }
}

impl From<NonCanonicalizable> for ErrorKind {
    fn from(e: NonCanonicalizable) -> Self {
        ErrorKind::NotCanonical(e)
    }
}

impl From<MxidError> for ErrorKind {
    fn from(e: MxidError) -> Self {
        ErrorKind::InvalidEvent(format!("{}", e))
    }
}
