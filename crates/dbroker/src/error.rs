//! 🏷️ The typed failures of the broker, for when "something went wrong" is not enough.
//!
//! Everything in this crate returns `anyhow::Result`, same as always. The variants
//! below ride inside the `anyhow::Error` so callers that care can pull them back out:
//!
//! ```ignore
//! match err.downcast_ref::<BrokerError>() {
//!     Some(BrokerError::MissingParameter { .. }) => { /* fix your request */ }
//!     _ => { /* the backend is having a day */ }
//! }
//! ```
//!
//! 🦆 Configuration errors are raised before any native call. Always. The duck checked.

use std::time::Duration;

use thiserror::Error;

use crate::common::BackendKind;

#[derive(Debug, Error)]
pub enum BrokerError {
    /// 🚫 Not mongo, not elasticsearch, not splunk, not odbc. Not invited.
    #[error("💀 Unsupported backend '{0}'. We speak mongo, elasticsearch, splunk and odbc. That's the whole menu.")]
    UnsupportedBackend(String),

    /// 📭 A locator the backend cannot live without was left at home.
    #[error("💀 {backend} requires '{parameter}', and it was not provided")]
    MissingParameter {
        backend: BackendKind,
        parameter: &'static str,
    },

    /// 🙅 The backend exists, it just does not do that.
    #[error("💀 {backend} does not support {operation} in this broker")]
    UnsupportedOperation {
        backend: BackendKind,
        operation: &'static str,
    },

    /// 🔌 Asked for one backend, handed the plug of another.
    #[error("💀 Request targets {requested}, but the client handle is for {actual}")]
    ClientMismatch {
        requested: BackendKind,
        actual: BackendKind,
    },

    /// 🔧 A parameter that exists but makes no sense (page_size = 0, we see you).
    #[error("💀 Invalid parameter '{parameter}': {reason}")]
    InvalidParameter {
        parameter: &'static str,
        reason: String,
    },

    /// 📐 ODBC bulk insert: every row must carry the first row's columns, exactly.
    #[error(
        "💀 Record at position {position} has columns {found:?}, expected the first record's columns {expected:?}"
    )]
    InconsistentColumns {
        position: usize,
        expected: Vec<String>,
        found: Vec<String>,
    },

    /// 🔥 Splunk reported the job as failed. It tried. It failed. It told us.
    #[error("💀 Splunk search job '{sid}' failed: {reason}")]
    JobFailed { sid: String, reason: String },

    /// ⏱️ Polled, polled, polled again. The job never finished.
    #[error("💀 Splunk search job '{sid}' was not done after {waited:?}")]
    PollTimeout { sid: String, waited: Duration },

    /// 🧩 The backend answered, but not in a shape we understand.
    #[error("💀 Malformed {backend} response: {detail}")]
    MalformedResponse {
        backend: BackendKind,
        detail: String,
    },
}

impl BrokerError {
    /// ✅ Configuration errors are never retried and never reach the network.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            BrokerError::UnsupportedBackend(_)
                | BrokerError::MissingParameter { .. }
                | BrokerError::UnsupportedOperation { .. }
                | BrokerError::ClientMismatch { .. }
                | BrokerError::InvalidParameter { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn the_one_where_typed_errors_survive_the_anyhow_round_trip() {
        let err: anyhow::Error = BrokerError::MissingParameter {
            backend: BackendKind::Mongo,
            parameter: "collection",
        }
        .into();
        let err = err.context("🔧 while dispatching");

        let typed = err
            .downcast_ref::<BrokerError>()
            .expect("💀 the typed error should still be in the chain");
        assert!(typed.is_configuration());
        assert!(typed.to_string().contains("collection"));
    }

    #[test]
    fn the_one_where_a_timeout_is_not_a_config_problem() {
        let err = BrokerError::PollTimeout {
            sid: "1234.5".into(),
            waited: Duration::from_secs(3),
        };
        assert!(!err.is_configuration());
    }
}
