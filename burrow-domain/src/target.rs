use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

// ---

use super::error::TunnelError;

// ---------------------------------------------------------------------------
// Target
// ---------------------------------------------------------------------------

/// A `host:port` destination.
///
/// `host` is kept as written (name or IP literal, brackets stripped from
/// IPv6 literals). Used both for the SSH server address and for every
/// destination a front-end asks the tunnel to reach.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    // ---
    pub host: String,
    pub port: u16,
}

// ---

impl Target {
    // ---
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        // ---
        let host = host.into();
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .map(str::to_owned)
            .unwrap_or(host);
        Self { host, port }
    }

    // ---

    /// Parse `host:port`, `[v6]:port` or `v4:port`.
    pub fn parse(s: &str) -> Result<Self, TunnelError> {
        // ---
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| TunnelError::InvalidTarget(s.to_owned()))?;

        // A bare IPv6 literal without brackets has more than one ':'; reject
        // it rather than guess where the port starts.
        if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
            return Err(TunnelError::InvalidTarget(s.to_owned()));
        }

        let port: u16 = port
            .parse()
            .map_err(|_| TunnelError::InvalidTarget(s.to_owned()))?;

        if host.is_empty() || host == "[]" {
            return Err(TunnelError::InvalidTarget(s.to_owned()));
        }

        Ok(Self::new(host, port))
    }

    // ---

    /// `Some` when the host is an IP literal.
    pub fn ip(&self) -> Option<IpAddr> {
        self.host.parse().ok()
    }
}

// ---

impl fmt::Display for Target {
    // ---
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // ---
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

// ---

impl FromStr for Target {
    // ---
    type Err = TunnelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Target::parse(s)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use super::Target;

    #[test]
    fn parses_name_v4_and_bracketed_v6() {
        // ---
        let t = Target::parse("example.com:443").unwrap();
        assert_eq!(t.host, "example.com");
        assert_eq!(t.port, 443);
        assert!(t.ip().is_none());

        let t = Target::parse("10.0.0.1:22").unwrap();
        assert!(t.ip().unwrap().is_ipv4());

        let t = Target::parse("[2001:db8::1]:8080").unwrap();
        assert_eq!(t.host, "2001:db8::1");
        assert!(t.ip().unwrap().is_ipv6());
        assert_eq!(t.to_string(), "[2001:db8::1]:8080");
    }

    #[test]
    fn rejects_malformed() {
        // ---
        assert!(Target::parse("no-port").is_err());
        assert!(Target::parse("host:notaport").is_err());
        assert!(Target::parse(":80").is_err());
        assert!(Target::parse("2001:db8::1:80").is_err());
        assert!(Target::parse("host:70000").is_err());
    }
}
