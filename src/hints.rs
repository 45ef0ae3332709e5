//! Connection hints: strings of the form `tcp:<host>:<port>` describing a
//! socket either side might be reachable on. Scaled down from the JSON
//! `Hint::DirectTcpV1`/`Hint::RelayV1` envelope (`src/transit.rs::Hint`) to
//! the bare string grammar this layer actually receives; unrecognised
//! schemes round-trip as `Hint::Other` instead of being silently dropped, so
//! they can still be logged or relayed upstream.

use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DirectHint {
    pub host: String,
    pub port: u16,
}

impl DirectHint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        DirectHint {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for DirectHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tcp:{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Hint {
    DirectTcp(DirectHint),
    /// Any hint whose scheme we don't understand. Kept verbatim rather than
    /// dropped, in case a caller wants to relay it onward unexamined.
    Other(String),
}

impl Hint {
    pub fn direct(host: impl Into<String>, port: u16) -> Self {
        Hint::DirectTcp(DirectHint::new(host, port))
    }

    pub fn as_direct(&self) -> Option<&DirectHint> {
        match self {
            Hint::DirectTcp(hint) => Some(hint),
            Hint::Other(_) => None,
        }
    }
}

impl FromStr for Hint {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, ':');
        if let (Some("tcp"), Some(host), Some(port)) = (parts.next(), parts.next(), parts.next())
        {
            if !host.is_empty() && !host.contains(':') {
                if let Ok(port) = port.parse::<u16>() {
                    return Ok(Hint::DirectTcp(DirectHint::new(host, port)));
                }
            }
        }
        Ok(Hint::Other(s.to_string()))
    }
}

impl fmt::Display for Hint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Hint::DirectTcp(hint) => write!(f, "{hint}"),
            Hint::Other(raw) => write!(f, "{raw}"),
        }
    }
}
