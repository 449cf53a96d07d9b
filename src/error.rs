//! Error taxonomy for the gateway
//!
//! Every error kind carries an HTTP status. `Pass` is an internal sentinel
//! ("not applicable, try the next handler in the chain") and is rewritten to
//! `NotFound` before it can reach the HTTP boundary.

use serde::Serialize;
use thiserror::Error;

/// Gateway error kinds with HTTP status mapping
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Not applicable; try the next loader/processor. Never user-visible.
    #[error("pass")]
    Pass,

    /// No loader produced bytes
    #[error("not-found")]
    NotFound,

    /// URL signature verification failed
    #[error("signature-mismatch")]
    SignatureMismatch,

    /// Codec does not recognise the input
    #[error("unsupported-format")]
    UnsupportedFormat,

    /// A stage exceeded its budget
    #[error("timeout")]
    Timeout,

    /// Fallthrough
    #[error("internal")]
    Internal,

    /// Normalised error with an explicit status, e.g. from the image library
    /// or an upstream HTTP response
    #[error("{message}")]
    Custom { message: String, code: u16 },
}

/// Serialized error body: `{"code":404,"message":"not-found"}`
#[derive(Debug, Serialize)]
struct ErrorBody {
    code: u16,
    message: String,
}

impl Error {
    pub fn custom(message: impl Into<String>, code: u16) -> Self {
        Error::Custom {
            message: message.into(),
            code,
        }
    }

    /// HTTP status code for this error
    pub fn status(&self) -> u16 {
        match self {
            Error::Pass => 400,
            Error::NotFound => 404,
            Error::SignatureMismatch => 403,
            Error::UnsupportedFormat => 406,
            Error::Timeout => 408,
            Error::Internal => 500,
            Error::Custom { code, .. } => *code,
        }
    }

    pub fn is_pass(&self) -> bool {
        matches!(self, Error::Pass)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout)
    }

    /// Soft errors are expected while walking a chain and log at debug only
    pub fn is_soft(&self) -> bool {
        matches!(self, Error::Pass | Error::NotFound | Error::Timeout)
    }

    /// JSON body for an error response
    pub fn to_json(&self) -> String {
        let body = ErrorBody {
            code: self.status(),
            message: self.to_string(),
        };
        serde_json::to_string(&body).unwrap_or_else(|_| r#"{"code":500,"message":"internal"}"#.into())
    }
}

impl From<image::ImageError> for Error {
    /// Normalise image-library failures: unrecognised input maps to 406,
    /// decoder limit violations keep their message at 406, the rest is 500.
    fn from(err: image::ImageError) -> Self {
        use image::ImageError;
        match err {
            ImageError::Unsupported(_) => Error::UnsupportedFormat,
            ImageError::Decoding(_) => Error::UnsupportedFormat,
            ImageError::Limits(e) => Error::custom(e.to_string(), 406),
            _ => Error::Internal,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            Error::NotFound
        } else {
            Error::Internal
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(Error::NotFound.status(), 404);
        assert_eq!(Error::SignatureMismatch.status(), 403);
        assert_eq!(Error::UnsupportedFormat.status(), 406);
        assert_eq!(Error::Timeout.status(), 408);
        assert_eq!(Error::Internal.status(), 500);
        assert_eq!(Error::custom("bad gateway", 502).status(), 502);
    }

    #[test]
    fn test_json_body() {
        let json = Error::SignatureMismatch.to_json();
        let v: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(v["code"], 403);
        assert_eq!(v["message"], "signature-mismatch");
    }

    #[test]
    fn test_soft_errors() {
        assert!(Error::Pass.is_soft());
        assert!(Error::NotFound.is_soft());
        assert!(!Error::Internal.is_soft());
        assert!(!Error::SignatureMismatch.is_soft());
    }

    #[test]
    fn test_io_not_found() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        assert_eq!(Error::from(io), Error::NotFound);
    }
}
