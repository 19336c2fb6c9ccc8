// src/websocket/target.rs

use crate::error::TransportError;
use crate::net::TlsMode;

use url::Url;

/// A validated WebSocket destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
  pub host: String,
  pub port: u16,
  /// Path plus query, as sent on the request line.
  pub resource: String,
  pub tls: TlsMode,
  /// The URL as given, for logs.
  pub url: String,
}

impl Target {
  /// Value for the `Host` header; the port is omitted when it is the scheme default.
  pub fn host_header(&self) -> String {
    let default_port = match self.tls {
      TlsMode::None => 80,
      TlsMode::Verified | TlsMode::Insecure => 443,
    };
    let host = if self.host.contains(':') {
      format!("[{}]", self.host)
    } else {
      self.host.clone()
    };
    if self.port == default_port {
      host
    } else {
      format!("{}:{}", host, self.port)
    }
  }
}

/// Parses and validates a `ws://`, `wss://` or `wss+insecure://` URL.
pub fn parse_target(url_str: &str) -> Result<Target, TransportError> {
  let invalid_url_err = |why: &str| TransportError::InvalidUrl(format!("{}: {}", url_str, why));

  // Check the scheme before handing off, so unknown schemes are reported as such
  // even when the rest of the URL would not parse.
  let Some(separator_pos) = url_str.find("://") else {
    return Err(invalid_url_err("missing scheme"));
  };
  let tls = match url_str[..separator_pos].to_ascii_lowercase().as_str() {
    "ws" => TlsMode::None,
    "wss" => TlsMode::Verified,
    "wss+insecure" => TlsMode::Insecure,
    _ => return Err(TransportError::UnsupportedScheme(url_str.to_string())),
  };

  // `url` only knows default ports for the standard schemes; parse the
  // insecure variant as plain `wss`.
  let normalized = match tls {
    TlsMode::Insecure => format!("wss{}", &url_str[separator_pos..]),
    _ => url_str.to_string(),
  };
  let parsed = Url::parse(&normalized).map_err(|e| {
    tracing::debug!("Failed to parse WebSocket URL {}: {}", url_str, e);
    invalid_url_err(&e.to_string())
  })?;

  let host = match parsed.host() {
    Some(url::Host::Domain(d)) => d.to_string(),
    Some(url::Host::Ipv4(ip)) => ip.to_string(),
    Some(url::Host::Ipv6(ip)) => ip.to_string(),
    None => return Err(invalid_url_err("missing host")),
  };
  let port = parsed
    .port_or_known_default()
    .ok_or_else(|| invalid_url_err("missing port"))?;

  let mut resource = parsed.path().to_string();
  if resource.is_empty() {
    resource.push('/');
  }
  if let Some(query) = parsed.query() {
    resource.push('?');
    resource.push_str(query);
  }

  Ok(Target {
    host,
    port,
    resource,
    tls,
    url: url_str.to_string(),
  })
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn accepts_the_three_schemes() {
    let t = parse_target("ws://echo.example/socket").unwrap();
    assert_eq!((t.host.as_str(), t.port, t.resource.as_str(), t.tls), ("echo.example", 80, "/socket", TlsMode::None));

    let t = parse_target("wss://echo.example:8443/a?b=c").unwrap();
    assert_eq!((t.port, t.resource.as_str(), t.tls), (8443, "/a?b=c", TlsMode::Verified));
    assert_eq!(t.host_header(), "echo.example:8443");

    let t = parse_target("wss+insecure://127.0.0.1").unwrap();
    assert_eq!((t.port, t.resource.as_str(), t.tls), (443, "/", TlsMode::Insecure));
    assert_eq!(t.host_header(), "127.0.0.1");
  }

  #[test]
  fn rejects_other_schemes_with_protocol_message() {
    let err = parse_target("ftp://bad.example").unwrap_err();
    assert!(matches!(err, TransportError::UnsupportedScheme(_)));
    assert!(err.to_string().contains("protocol"));

    assert!(matches!(parse_target("http://x/"), Err(TransportError::UnsupportedScheme(_))));
  }

  #[test]
  fn rejects_malformed_urls() {
    assert!(matches!(parse_target("echo.example"), Err(TransportError::InvalidUrl(_))));
    assert!(matches!(parse_target("ws://"), Err(TransportError::InvalidUrl(_))));
  }

  #[test]
  fn ipv6_hosts_are_bracketed_in_host_header() {
    let t = parse_target("ws://[::1]:9000/").unwrap();
    assert_eq!(t.host, "::1");
    assert_eq!(t.host_header(), "[::1]:9000");
  }
}
