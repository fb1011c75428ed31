use std::fmt;

/// Target of a CONNECT request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelTarget {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectError {
    MalformedRequestLine,
    InvalidAuthority,
    InvalidPort,
}

impl fmt::Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MalformedRequestLine => write!(f, "malformed CONNECT request line"),
            Self::InvalidAuthority => write!(f, "invalid CONNECT authority"),
            Self::InvalidPort => write!(f, "invalid CONNECT port"),
        }
    }
}

impl std::error::Error for ConnectError {}

/// Parses the authority of a `CONNECT host:port` target. A missing port
/// defaults to 443, matching what proxied HTTPS clients mean by it.
pub fn parse_connect_authority(authority: &str) -> Result<TunnelTarget, ConnectError> {
    if authority.is_empty() {
        return Err(ConnectError::InvalidAuthority);
    }

    if let Some(rest) = authority.strip_prefix('[') {
        let close = rest.find(']').ok_or(ConnectError::InvalidAuthority)?;
        let host = &rest[..close];
        if host.is_empty() {
            return Err(ConnectError::InvalidAuthority);
        }
        let port = match &rest[close + 1..] {
            "" => 443,
            suffix => suffix
                .strip_prefix(':')
                .ok_or(ConnectError::InvalidAuthority)?
                .parse::<u16>()
                .map_err(|_| ConnectError::InvalidPort)?,
        };
        return Ok(TunnelTarget {
            host: host.to_string(),
            port,
        });
    }

    match authority.rsplit_once(':') {
        Some((host, port_text)) => {
            if host.is_empty() || host.contains(':') {
                return Err(ConnectError::InvalidAuthority);
            }
            let port = port_text
                .parse::<u16>()
                .map_err(|_| ConnectError::InvalidPort)?;
            Ok(TunnelTarget {
                host: host.to_string(),
                port,
            })
        }
        None => Ok(TunnelTarget {
            host: authority.to_string(),
            port: 443,
        }),
    }
}

/// First line of an already-read request head.
pub fn request_line(head: &[u8]) -> Result<(String, String), ConnectError> {
    let text = std::str::from_utf8(head).map_err(|_| ConnectError::MalformedRequestLine)?;
    let line = text
        .split("\r\n")
        .next()
        .ok_or(ConnectError::MalformedRequestLine)?;
    let mut parts = line.split_whitespace();
    let method = parts.next().ok_or(ConnectError::MalformedRequestLine)?;
    let target = parts.next().ok_or(ConnectError::MalformedRequestLine)?;
    let version = parts.next().ok_or(ConnectError::MalformedRequestLine)?;
    if !version.starts_with("HTTP/") || parts.next().is_some() {
        return Err(ConnectError::MalformedRequestLine);
    }
    Ok((method.to_string(), target.to_string()))
}

#[cfg(test)]
mod tests {
    use super::{parse_connect_authority, request_line, ConnectError};

    #[test]
    fn parses_domain_authority() {
        let target = parse_connect_authority("api.example.com:443").expect("parse");
        assert_eq!(target.host, "api.example.com");
        assert_eq!(target.port, 443);
    }

    #[test]
    fn missing_port_defaults_to_https() {
        let target = parse_connect_authority("api.example.com").expect("parse");
        assert_eq!(target.port, 443);
    }

    #[test]
    fn parses_bracketed_ipv6_authority() {
        let target = parse_connect_authority("[2001:db8::1]:8443").expect("parse");
        assert_eq!(target.host, "2001:db8::1");
        assert_eq!(target.port, 8443);
    }

    #[test]
    fn rejects_unbracketed_ipv6_authority() {
        assert_eq!(
            parse_connect_authority("2001:db8::1:443").expect_err("must fail"),
            ConnectError::InvalidAuthority
        );
    }

    #[test]
    fn rejects_bad_port() {
        assert_eq!(
            parse_connect_authority("host:99999").expect_err("must fail"),
            ConnectError::InvalidPort
        );
    }

    #[test]
    fn request_line_splits_method_and_target() {
        let (method, target) =
            request_line(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com\r\n\r\n")
                .expect("parse");
        assert_eq!(method, "CONNECT");
        assert_eq!(target, "example.com:443");
    }

    #[test]
    fn request_line_rejects_garbage() {
        assert!(request_line(b"\xff\xfe\r\n\r\n").is_err());
        assert!(request_line(b"GET\r\n\r\n").is_err());
        assert!(request_line(b"GET / HTTP/1.1 extra\r\n\r\n").is_err());
    }
}
