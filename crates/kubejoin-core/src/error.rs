//! Error categories shared by every kubejoin crate.

use std::fmt;

/// Category of a failure, used to decide how it is surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed token, empty endpoint list, missing discovery inputs.
    Configuration,
    /// Unreadable trust anchor, failed PKI asset write.
    Io,
    /// Denied request, closed watch stream, unreachable endpoint.
    Protocol,
    /// The approval watch exceeded its bound.
    Timeout,
    /// Key or certificate generation failure.
    Crypto,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Configuration => "configuration",
            Self::Io => "io",
            Self::Protocol => "protocol",
            Self::Timeout => "timeout",
            Self::Crypto => "crypto",
        };
        f.write_str(name)
    }
}
