//! Error types and result status mapping.
//!
//! All LDAP operation failures are classified here, at the session/search
//! boundary, into the small set of statuses the rest of the daemon deals
//! in. Raw LDAP result codes do not travel beyond this module except as
//! text inside log messages.

use std::io;

use ldap3::LdapError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, NsdError>;

/// Errors produced by the daemon.
#[derive(Debug, Error)]
pub enum NsdError {
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
    /// The client closed the connection before sending a complete request.
    #[error("end of stream")]
    Disconnect,
    /// Malformed data on the local socket; the connection is dropped.
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("LDAP error: {source}")]
    Ldap {
        #[from]
        source: LdapError,
    },
    #[error("configuration error: {0}")]
    Config(String),
    /// No directory server could be contacted.
    #[error("no available LDAP server")]
    Unavailable,
}

impl NsdError {
    pub fn proto(msg: impl Into<String>) -> NsdError {
        NsdError::Protocol(msg.into())
    }
}

/// Outcome classification for directory lookups.
///
/// `Success` covers size-limit and time-limit truncation: the entries
/// received before the limit hit are delivered and the stream ends as if
/// complete. `NotFound` is silent at the log level, `Unavailable` warns
/// and triggers URI fail-over.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LookupStatus {
    Success,
    NotFound,
    TryAgain,
    Unavailable,
}

impl LookupStatus {
    pub fn is_success(self) -> bool {
        self == LookupStatus::Success
    }
}

/// Classify an LDAP result code.
pub fn status_of_rc(rc: u32) -> LookupStatus {
    match rc {
        // success, timeLimitExceeded, sizeLimitExceeded
        0 | 3 | 4 => LookupStatus::Success,
        // noSuchAttribute, undefinedAttributeType, inappropriateMatching,
        // invalidAttributeSyntax, noSuchObject, invalidDNSyntax
        16 | 17 | 18 | 21 | 32 | 34 => LookupStatus::NotFound,
        // busy, unavailable, invalidCredentials and everything else leave
        // the session unusable
        _ => LookupStatus::Unavailable,
    }
}

/// Classify a client library error.
pub fn status_of(err: &LdapError) -> LookupStatus {
    match err {
        LdapError::LdapResult { result } => status_of_rc(result.rc),
        LdapError::FilterParsing => LookupStatus::NotFound,
        _ => LookupStatus::Unavailable,
    }
}

/// True if the error indicates the server (or the connection to it) is
/// gone and the session should fail over to the next URI.
pub fn is_unavailable(err: &LdapError) -> bool {
    status_of(err) == LookupStatus::Unavailable
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn truncation_is_success() {
        assert_eq!(status_of_rc(0), LookupStatus::Success);
        assert_eq!(status_of_rc(3), LookupStatus::Success);
        assert_eq!(status_of_rc(4), LookupStatus::Success);
    }

    #[test]
    fn schema_misses_are_not_found() {
        for rc in [16, 17, 18, 21, 32, 34] {
            assert_eq!(status_of_rc(rc), LookupStatus::NotFound);
        }
    }

    #[test]
    fn outage_codes_are_unavailable() {
        // busy, unavailable, unwillingToPerform, invalidCredentials
        for rc in [49, 51, 52, 53, 80] {
            assert_eq!(status_of_rc(rc), LookupStatus::Unavailable);
        }
    }
}
