#![forbid(unsafe_code)]

pub mod endpoint {
	use std::net::SocketAddr;

	/// Scheme accepted for the realtime listener bind string.
	pub const REALTIME_SCHEME: &str = "quic";

	/// Parsed `quic://host:port` bind endpoint.
	#[derive(Debug, Clone, PartialEq, Eq, Hash)]
	pub struct RealtimeEndpoint {
		pub host: String,
		pub port: u16,
	}

	impl RealtimeEndpoint {
		/// Returns `host:port` (IPv6 hosts stay bracketed).
		pub fn hostport(&self) -> String {
			format!("{}:{}", self.host, self.port)
		}

		/// Convert to `SocketAddr`; the host must be an IP literal.
		pub fn socket_addr(&self) -> Result<SocketAddr, String> {
			self.hostport()
				.parse()
				.map_err(|_| format!("bind host must be an IP literal (got {})", self.host))
		}

		/// Parse a bind string of the form `quic://host:port`.
		pub fn parse(s: &str) -> Result<Self, String> {
			let s = s.trim();
			if s.is_empty() {
				return Err(format!("bind endpoint must be non-empty (expected {REALTIME_SCHEME}://host:port)"));
			}

			let rest = s
				.strip_prefix(REALTIME_SCHEME)
				.and_then(|r| r.strip_prefix("://"))
				.ok_or_else(|| format!("invalid bind endpoint (expected {REALTIME_SCHEME}://host:port): {s}"))?;

			if rest.contains(['/', '?', '#']) {
				return Err(format!("bind endpoint must not carry a path/query/fragment: {s}"));
			}

			let (host, port_str) = rest
				.rsplit_once(':')
				.ok_or_else(|| format!("bind endpoint is missing :port: {s}"))?;

			let host = host.trim();
			if host.is_empty() {
				return Err(format!("bind endpoint is missing a host: {s}"));
			}

			if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
				return Err(format!("IPv6 bind hosts must be bracketed, like {REALTIME_SCHEME}://[::1]:18450: {s}"));
			}

			let port: u16 = port_str
				.trim()
				.parse()
				.ok()
				.filter(|p| *p != 0)
				.ok_or_else(|| format!("invalid bind port (expected 1..=65535): {s}"))?;

			Ok(Self {
				host: host.to_string(),
				port,
			})
		}
	}

}
