use std::time::Duration;

use http::{Method, StatusCode, Uri};
use thiserror::Error;

use crate::BoxError;

/// Client error type.
///
/// Every failed call ends up in exactly one of these variants. Callers are
/// expected to branch on the variant (or on [`Error::kind`]) rather than on
/// the message, e.g. treating [`Error::NotFound`] as an absent resource.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The server answered 404.
    #[error("resource not found")]
    NotFound,

    /// The server answered 401 or 403.
    #[error("unauthorized resource")]
    Unauthorized {
        /// Either 401 or 403.
        status: StatusCode,
    },

    /// The server answered 422.
    #[error("unprocessable request")]
    UnprocessableEntity,

    /// Any other status of 300 or above.
    #[error("error executing {method} {uri} - {} - {body}", .status.as_u16())]
    Status {
        /// Method of the failed request.
        method: Method,
        /// Target of the failed request.
        uri: Uri,
        /// Status returned by the server.
        status: StatusCode,
        /// Response body, as text.
        body: String,
    },

    /// No well-formed response was obtained: DNS, dial, TLS, I/O or the
    /// attempt timeout.
    #[error("{method} {uri}: {source}")]
    Transport {
        /// Method of the failed request.
        method: Method,
        /// Target of the failed request.
        uri: Uri,
        /// Underlying cause.
        #[source]
        source: BoxError,
    },

    /// The response head arrived but its body could not be read, either
    /// because the connection failed or because the attempt timed out.
    #[error("{method} {uri}: reading {} response body: {source}", .status.as_u16())]
    Body {
        /// Method of the failed request.
        method: Method,
        /// Target of the failed request.
        uri: Uri,
        /// Status of the response whose body was lost.
        status: StatusCode,
        /// Underlying cause.
        #[source]
        source: BoxError,
    },

    /// A successful response carried a body which is not the expected JSON.
    #[error("decoding response: {0}")]
    Decode(#[source] serde_json::Error),

    /// The request could not be built.
    #[error("invalid request: {0}")]
    InvalidRequest(#[source] http::Error),

    /// The URL could not be parsed.
    #[error("invalid url: {0}")]
    InvalidUri(#[from] http::uri::InvalidUri),

    /// The client could not be constructed.
    #[error("client setup: {0}")]
    Setup(#[source] BoxError),
}

/// The class of an [`Error`], without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    /// See [`Error::NotFound`].
    NotFound,
    /// See [`Error::Unauthorized`].
    Unauthorized,
    /// See [`Error::UnprocessableEntity`].
    UnprocessableEntity,
    /// See [`Error::Status`].
    Status,
    /// See [`Error::Transport`].
    Transport,
    /// See [`Error::Body`].
    Body,
    /// See [`Error::Decode`].
    Decode,
    /// See [`Error::InvalidRequest`] and [`Error::InvalidUri`].
    InvalidRequest,
    /// See [`Error::Setup`].
    Setup,
}

impl Error {
    pub(crate) fn transport<E>(method: &Method, uri: &Uri, source: E) -> Self
    where
        E: Into<BoxError>,
    {
        Error::Transport {
            method: method.clone(),
            uri: uri.clone(),
            source: source.into(),
        }
    }

    pub(crate) fn body<E>(method: &Method, uri: &Uri, status: StatusCode, source: E) -> Self
    where
        E: Into<BoxError>,
    {
        Error::Body {
            method: method.clone(),
            uri: uri.clone(),
            status,
            source: source.into(),
        }
    }

    /// The class of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound => ErrorKind::NotFound,
            Error::Unauthorized { .. } => ErrorKind::Unauthorized,
            Error::UnprocessableEntity => ErrorKind::UnprocessableEntity,
            Error::Status { .. } => ErrorKind::Status,
            Error::Transport { .. } => ErrorKind::Transport,
            Error::Body { .. } => ErrorKind::Body,
            Error::Decode(_) => ErrorKind::Decode,
            Error::InvalidRequest(_) | Error::InvalidUri(_) => ErrorKind::InvalidRequest,
            Error::Setup(_) => ErrorKind::Setup,
        }
    }

    /// Returns `true` for failures which happened before a response was
    /// obtained. Only these are retried.
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Transport { .. })
    }

    /// Returns `true` if the attempt ran out of time.
    pub fn is_timeout(&self) -> bool {
        match self {
            Error::Transport { source, .. } | Error::Body { source, .. } => {
                source.is::<AttemptTimeout>()
            }
            _ => false,
        }
    }

    /// The response status behind this error, if one was received.
    ///
    /// For [`Error::Body`] this is the status of the response whose body
    /// could not be read.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Error::NotFound => Some(StatusCode::NOT_FOUND),
            Error::Unauthorized { status }
            | Error::Status { status, .. }
            | Error::Body { status, .. } => Some(*status),
            Error::UnprocessableEntity => Some(StatusCode::UNPROCESSABLE_ENTITY),
            _ => None,
        }
    }
}

/// The per-attempt timeout expired before a response was read.
#[derive(Debug, Clone, Copy, Error)]
#[error("attempt timed out after {}ms", .0.as_millis())]
pub struct AttemptTimeout(pub Duration);
