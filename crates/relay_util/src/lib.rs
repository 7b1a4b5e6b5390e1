#![forbid(unsafe_code)]

pub mod endpoint {
	use std::net::SocketAddr;

	use thiserror::Error;

	#[derive(Debug, Error, Clone, PartialEq, Eq)]
	pub enum EndpointError {
		#[error("endpoint must be non-empty (expected quic://host:port)")]
		Empty,
		#[error("invalid endpoint (expected quic://host:port): {0}")]
		Scheme(String),
		#[error("invalid endpoint (expected quic://host:port without path/query/fragment): {0}")]
		Trailing(String),
		#[error("invalid endpoint host: {0}")]
		Host(String),
		#[error("invalid endpoint port (expected 1..=65535): {0}")]
		Port(String),
		#[error("host must be an IP literal here: {0}")]
		NotIpLiteral(String),
	}

	/// Parsed `quic://host:port` endpoint used for the hub bind address and
	/// for peer links to backend services.
	#[derive(Debug, Clone, PartialEq, Eq, Hash)]
	pub struct QuicEndpoint {
		pub host: String,
		pub port: u16,
	}

	impl QuicEndpoint {
		pub fn parse(s: &str) -> Result<Self, EndpointError> {
			let s = s.trim();
			if s.is_empty() {
				return Err(EndpointError::Empty);
			}

			let rest = s
				.strip_prefix("quic://")
				.ok_or_else(|| EndpointError::Scheme(s.to_string()))?;

			if rest.contains(['/', '?', '#']) {
				return Err(EndpointError::Trailing(s.to_string()));
			}

			let (host, port_str) = rest.rsplit_once(':').ok_or_else(|| EndpointError::Port(s.to_string()))?;

			let host = host.trim();
			if host.is_empty() {
				return Err(EndpointError::Host(s.to_string()));
			}
			// IPv6 literals must be bracketed so the port split is unambiguous.
			if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
				return Err(EndpointError::Host(s.to_string()));
			}

			let port = match port_str.trim().parse::<u16>() {
				Ok(0) | Err(_) => return Err(EndpointError::Port(s.to_string())),
				Ok(p) => p,
			};

			Ok(Self {
				host: host.to_string(),
				port,
			})
		}

		/// `host:port`, IPv6 stays bracketed. Suitable for DNS resolution.
		pub fn hostport(&self) -> String {
			format!("{}:{}", self.host, self.port)
		}

		/// Host without IPv6 brackets, for TLS server-name checks.
		pub fn server_name(&self) -> &str {
			self.host.trim_start_matches('[').trim_end_matches(']')
		}

		pub fn to_socket_addr_if_ip_literal(&self) -> Result<SocketAddr, EndpointError> {
			self.hostport()
				.parse()
				.map_err(|_| EndpointError::NotIpLiteral(self.host.clone()))
		}
	}

	impl std::fmt::Display for QuicEndpoint {
		fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
			write!(f, "quic://{}:{}", self.host, self.port)
		}
	}

	#[cfg(test)]
	mod tests {
		use super::*;

		#[test]
		fn parses_dns_hostname() {
			let e = QuicEndpoint::parse("quic://rooms.internal:7443").unwrap();
			assert_eq!(e.host, "rooms.internal");
			assert_eq!(e.port, 7443);
			assert_eq!(e.server_name(), "rooms.internal");
			assert_eq!(e.to_string(), "quic://rooms.internal:7443");
		}

		#[test]
		fn parses_bracketed_ipv6() {
			let e = QuicEndpoint::parse("quic://[::1]:18300").unwrap();
			assert_eq!(e.hostport(), "[::1]:18300");
			assert_eq!(e.server_name(), "::1");
			assert_eq!(e.to_socket_addr_if_ip_literal().unwrap().to_string(), "[::1]:18300");
		}

		#[test]
		fn rejects_malformed_endpoints() {
			assert_eq!(QuicEndpoint::parse("  "), Err(EndpointError::Empty));
			assert!(matches!(QuicEndpoint::parse("http://h:1"), Err(EndpointError::Scheme(_))));
			assert!(matches!(QuicEndpoint::parse("quic://h:1/x"), Err(EndpointError::Trailing(_))));
			assert!(matches!(QuicEndpoint::parse("quic://::1:1"), Err(EndpointError::Host(_))));
			assert!(matches!(QuicEndpoint::parse("quic://h:0"), Err(EndpointError::Port(_))));
			assert!(matches!(QuicEndpoint::parse("quic://h"), Err(EndpointError::Port(_))));
		}

		#[test]
		fn dns_name_is_not_a_socket_addr() {
			let e = QuicEndpoint::parse("quic://identity.internal:443").unwrap();
			assert!(matches!(e.to_socket_addr_if_ip_literal(), Err(EndpointError::NotIpLiteral(_))));
		}
	}
}

pub mod time {
	use std::time::{Duration, SystemTime, UNIX_EPOCH};

	/// Current Unix time in milliseconds.
	#[inline]
	pub fn unix_ms_now() -> i64 {
		SystemTime::now()
			.duration_since(UNIX_EPOCH)
			.unwrap_or(Duration::from_secs(0))
			.as_millis() as i64
	}
}
