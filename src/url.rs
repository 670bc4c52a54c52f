use url::{Host, Url};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Ws,
    Wss,
}

impl Scheme {
    pub fn default_port(self) -> u16 {
        match self {
            Scheme::Ws => 80,
            Scheme::Wss => 443,
        }
    }

    pub fn is_secure(self) -> bool {
        matches!(self, Scheme::Wss)
    }
}

/// A parsed `ws://` or `wss://` target.
///
/// `host` is the bare host used for dialing (IPv6 literals without brackets);
/// [`WsUrl::authority`] renders the form that goes into the `Host` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WsUrl {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    pub path_and_query: String,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum UrlError {
    #[error("URL must start with ws://, wss:// or https://")]
    Scheme,
    #[error("URL has no host")]
    Host,
    #[error(transparent)]
    Parse(#[from] url::ParseError),
}

impl WsUrl {
    pub fn authority(&self) -> String {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        if self.port == self.scheme.default_port() {
            host
        } else {
            format!("{host}:{}", self.port)
        }
    }
}

/// Parses a WebSocket URL. An `https` scheme is treated as `wss`.
pub fn parse_ws_or_wss(input: &str) -> Result<WsUrl, UrlError> {
    let parsed = Url::parse(input.trim())?;

    let scheme = match parsed.scheme() {
        "ws" => Scheme::Ws,
        "wss" | "https" => Scheme::Wss,
        _ => return Err(UrlError::Scheme),
    };

    let host = match parsed.host() {
        Some(Host::Domain(d)) => d.to_owned(),
        Some(Host::Ipv4(a)) => a.to_string(),
        Some(Host::Ipv6(a)) => a.to_string(),
        None => return Err(UrlError::Host),
    };
    if host.is_empty() {
        return Err(UrlError::Host);
    }

    let mut path_and_query = parsed.path().to_owned();
    if path_and_query.is_empty() {
        path_and_query.push('/');
    }
    if let Some(q) = parsed.query() {
        path_and_query.push('?');
        path_and_query.push_str(q);
    }

    Ok(WsUrl {
        scheme,
        port: parsed.port().unwrap_or(scheme.default_port()),
        host,
        path_and_query,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_url_with_explicit_port() {
        let u = parse_ws_or_wss("ws://example.com:8080/chat?room=1").unwrap();
        assert_eq!(u.scheme, Scheme::Ws);
        assert_eq!(u.host, "example.com");
        assert_eq!(u.port, 8080);
        assert_eq!(u.path_and_query, "/chat?room=1");
        assert_eq!(u.authority(), "example.com:8080");
    }

    #[test]
    fn https_is_rewritten_to_wss() {
        let u = parse_ws_or_wss("https://example.com").unwrap();
        assert_eq!(u.scheme, Scheme::Wss);
        assert!(u.scheme.is_secure());
        assert_eq!(u.port, 443);
        assert_eq!(u.path_and_query, "/");
        assert_eq!(u.authority(), "example.com");
    }

    #[test]
    fn ipv6_hosts_are_bracketed_in_authority() {
        let u = parse_ws_or_wss("ws://[::1]:9001/").unwrap();
        assert_eq!(u.host, "::1");
        assert_eq!(u.authority(), "[::1]:9001");
    }

    #[test]
    fn rejects_other_schemes() {
        assert_eq!(parse_ws_or_wss("ftp://example.com/"), Err(UrlError::Scheme));
        assert!(matches!(parse_ws_or_wss("not a url"), Err(UrlError::Parse(_))));
    }
}
