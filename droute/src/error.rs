//! Error types for configuration loading and upstream dispatch.

use thiserror::Error;

/// Errors raised while loading and validating `config.json`.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read from disk.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// Path that failed to read.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration JSON failed to parse or deserialize.
    #[error("failed to parse config JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// An upstream referenced an invalid protocol name.
    #[error("upstream {upstream} has unknown preferred_protocol {protocol:?}")]
    UnknownProtocol {
        /// The offending upstream's name.
        upstream: String,
        /// The raw protocol string provided.
        protocol: String,
    },

    /// No upstreams were configured at all.
    #[error("config must declare at least one upstream")]
    NoUpstreams,

    /// `default` named zero upstreams, or one that doesn't exist.
    #[error("default upstream list must name at least one known upstream, found unknown name {0:?}")]
    UnknownDefault(String),

    /// A forwarding-rule group named an unknown upstream.
    #[error("forwarding rule group {0:?} does not name a known upstream")]
    UnknownForwardingGroup(String),

    /// A rule-file slot's filename did not end in `.txt`.
    #[error("rule file {0:?} must have a .txt extension")]
    BadRuleFileExtension(String),
}

/// Errors raised while dispatching a query to an upstream.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// I/O failure talking to the upstream (connect/send/recv).
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The per-attempt deadline elapsed.
    #[error("upstream query timed out")]
    Timeout(#[from] tokio::time::error::Elapsed),

    /// A DoH request returned a non-success HTTP status.
    #[error("upstream returned unsuccessful HTTP status: {0}")]
    Http(reqwest::StatusCode),

    /// The `reqwest` client itself failed.
    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),

    /// Wire-format encode/decode failure.
    #[error("failed to encode or decode a DNS message: {0}")]
    Wire(String),

    /// The requested address family has no candidate IPs on this upstream.
    #[error("upstream {0} has no addresses for the requested address family")]
    NoAddressForFamily(String),

    /// The named upstream does not exist in the configuration.
    #[error("unknown upstream: {0}")]
    UnknownUpstream(String),

    /// A TLS handshake or configuration failure.
    #[error("TLS error: {0}")]
    Tls(String),
}

impl DispatchError {
    /// The curated set of failure kinds §7 treats as expected/transient
    /// and therefore logs at a lower severity than `warn`/`error`.
    pub fn is_transient(&self) -> bool {
        match self {
            DispatchError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::NotConnected
                    | std::io::ErrorKind::UnexpectedEof
            ),
            DispatchError::Timeout(_) => true,
            DispatchError::Reqwest(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }

    /// Render the `<error-type>: <message>` chain the request log stores
    /// in its `error` field, newline-joined from the outermost failure
    /// down through every `source()`.
    pub fn error_chain(&self) -> String {
        let mut lines = vec![format!("{}: {}", error_type_name(self), self)];
        let mut cause: Option<&(dyn std::error::Error + 'static)> = std::error::Error::source(self);
        while let Some(e) = cause {
            lines.push(format!("caused by: {e}"));
            cause = e.source();
        }
        lines.join("\n")
    }
}

fn error_type_name(e: &DispatchError) -> &'static str {
    match e {
        DispatchError::Io(_) => "IoError",
        DispatchError::Timeout(_) => "TimeoutError",
        DispatchError::Http(_) => "HttpStatusError",
        DispatchError::Reqwest(_) => "ReqwestError",
        DispatchError::Wire(_) => "WireFormatError",
        DispatchError::NoAddressForFamily(_) => "NoAddressForFamilyError",
        DispatchError::UnknownUpstream(_) => "UnknownUpstreamError",
        DispatchError::Tls(_) => "TlsError",
    }
}
