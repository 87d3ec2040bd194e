use std::fmt;

use http::Uri;
use smol_str::SmolStr;

use crate::FromUriError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    #[inline]
    pub const fn default_port(self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }

    #[inline]
    pub const fn as_str(self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

/// Scheme, lowercased host and port. Channels, pool counters and the
/// Alt-Svc cache are all keyed by this.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Origin {
    pub scheme: Scheme,
    pub host: SmolStr,
    pub port: u16,
}

impl Origin {
    pub fn new(scheme: Scheme, host: &str, port: u16) -> Self {
        Self {
            scheme,
            host: SmolStr::new(host.to_ascii_lowercase()),
            port,
        }
    }

    #[inline]
    pub fn is_tls(&self) -> bool {
        self.scheme == Scheme::Https
    }

    /// Host as it appears in an authority, bracketing IPv6 literals.
    pub fn host_literal(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.to_string()
        }
    }

    /// `host:port`, as sent in `alt-used`.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host_literal(), self.port)
    }

    /// Same origin with a different host/port, keeping the scheme.
    pub fn with_authority(&self, host: &str, port: u16) -> Self {
        Self::new(self.scheme, host, port)
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.port == self.scheme.default_port() {
            write!(f, "{}://{}", self.scheme.as_str(), self.host_literal())
        } else {
            write!(f, "{}://{}", self.scheme.as_str(), self.authority())
        }
    }
}

impl TryFrom<&Uri> for Origin {
    type Error = FromUriError;

    #[inline]
    fn try_from(uri: &Uri) -> Result<Self, Self::Error> {
        let host = match uri.host() {
            Some(a) => a,
            None => return Err(FromUriError::NoAuthority),
        };
        let scheme = match uri.scheme() {
            Some(scheme) if scheme == &http::uri::Scheme::HTTP => Scheme::Http,
            Some(scheme) if scheme == &http::uri::Scheme::HTTPS => Scheme::Https,
            _ => return Err(FromUriError::UnsupportScheme),
        };
        // IPv6 literals come back bracketed
        let host = host.trim_start_matches('[').trim_end_matches(']');
        let port = uri.port_u16().unwrap_or(scheme.default_port());
        Ok(Origin::new(scheme, host, port))
    }
}

impl TryFrom<Uri> for Origin {
    type Error = FromUriError;

    #[inline]
    fn try_from(value: Uri) -> Result<Self, Self::Error> {
        Self::try_from(&value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_uri_defaults() {
        let uri: Uri = "https://Example.COM/path".parse().unwrap();
        let origin = Origin::try_from(&uri).unwrap();
        assert_eq!(origin.host, "example.com");
        assert_eq!(origin.port, 443);
        assert!(origin.is_tls());
        assert_eq!(origin.to_string(), "https://example.com");
        assert_eq!(origin.authority(), "example.com:443");

        let uri: Uri = "http://[::1]:8080/".parse().unwrap();
        let origin = Origin::try_from(&uri).unwrap();
        assert_eq!(origin.host, "::1");
        assert_eq!(origin.to_string(), "http://[::1]:8080");
    }

    #[test]
    fn test_from_uri_rejects() {
        let uri: Uri = "/relative".parse().unwrap();
        assert!(matches!(
            Origin::try_from(&uri),
            Err(FromUriError::NoAuthority)
        ));
        let uri: Uri = "ftp://example.com/".parse().unwrap();
        assert!(matches!(
            Origin::try_from(&uri),
            Err(FromUriError::UnsupportScheme)
        ));
    }
}
