//! Response status classification.
//!
//! Statuses with a dedicated class are listed in [`CLASSES`], checked in
//! order. Anything else is a success below 300 and a generic failure from
//! 300 up. Adding a class means adding a row.

use bytes::Bytes;
use http::{Method, StatusCode, Uri};

use super::Error;

/// How a received response is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    /// 2xx: decode the body, if a destination was given.
    Success,
    /// 404.
    NotFound,
    /// 401 and 403.
    Unauthorized,
    /// 422.
    UnprocessableEntity,
    /// Any other status of 300 or above.
    Failure,
}

/// Statuses with a dedicated class, in priority order.
pub const CLASSES: &[(StatusCode, Outcome)] = &[
    (StatusCode::NOT_FOUND, Outcome::NotFound),
    (StatusCode::UNAUTHORIZED, Outcome::Unauthorized),
    (StatusCode::FORBIDDEN, Outcome::Unauthorized),
    (StatusCode::UNPROCESSABLE_ENTITY, Outcome::UnprocessableEntity),
];

/// Classify a response status.
pub fn classify(status: StatusCode) -> Outcome {
    CLASSES
        .iter()
        .find(|(code, _)| *code == status)
        .map(|(_, outcome)| *outcome)
        .unwrap_or(if status.as_u16() >= 300 {
            Outcome::Failure
        } else {
            Outcome::Success
        })
}

impl Outcome {
    /// Returns `true` for [`Outcome::Success`].
    pub fn is_success(self) -> bool {
        self == Outcome::Success
    }

    /// The error for a response in this class, or `None` for a success.
    pub(crate) fn into_error(
        self,
        method: &Method,
        uri: &Uri,
        status: StatusCode,
        body: &Bytes,
    ) -> Option<Error> {
        match self {
            Outcome::Success => None,
            Outcome::NotFound => Some(Error::NotFound),
            Outcome::Unauthorized => Some(Error::Unauthorized { status }),
            Outcome::UnprocessableEntity => Some(Error::UnprocessableEntity),
            Outcome::Failure => Some(Error::Status {
                method: method.clone(),
                uri: uri.clone(),
                status,
                body: String::from_utf8_lossy(body).into_owned(),
            }),
        }
    }
}
