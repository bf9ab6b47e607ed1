#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, anyhow};
use serde::Deserialize;
use tracing::{info, warn};

use crate::server::secret::SecretString;

/// Default config path: `~/.banter/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".banter").join("config.toml"))
}

/// Load the server config from TOML and env overrides.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);
	apply_env_overrides(&mut cfg);
	Ok(cfg)
}

/// Server config (v1).
#[derive(Debug, Clone)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub engine: EngineSettings,
}

/// Transport/operational settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
	/// PEM-encoded certificate path for QUIC/TLS.
	pub tls_cert_path: Option<PathBuf>,
	/// PEM-encoded private key path for QUIC/TLS.
	pub tls_key_path: Option<PathBuf>,
	/// HTTP gateway bind address (host:port).
	pub http_bind: String,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// HMAC secret for stateless session tokens. When absent, an
	/// ephemeral secret is generated at startup and minted tokens stop
	/// verifying on restart.
	pub auth_hmac_secret: Option<SecretString>,
	/// Command rate limiting: per-connection burst size; 0 disables.
	pub command_rate_limit_burst: u32,
	/// Command rate limiting: per-connection commands per minute.
	pub command_rate_limit_per_minute: u32,
}

impl Default for ServerSettings {
	fn default() -> Self {
		Self {
			tls_cert_path: None,
			tls_key_path: None,
			http_bind: "127.0.0.1:5000".to_string(),
			metrics_bind: None,
			auth_hmac_secret: None,
			command_rate_limit_burst: 20,
			command_rate_limit_per_minute: 120,
		}
	}
}

/// Engine tunables.
#[derive(Debug, Clone)]
pub struct EngineSettings {
	/// Retained messages per room before FIFO eviction.
	pub history_capacity: usize,
	pub page_limit_max: usize,
	pub page_limit_default: usize,
	pub search_limit_max: usize,
	/// Outbound queue capacity per connection.
	pub peer_queue_capacity: usize,
	/// Minted session token lifetime, in hours.
	pub session_ttl_hours: u64,
	/// Rooms that exist from the start.
	pub seed_rooms: Vec<String>,
	/// Room carrying connect/disconnect notices and room-less commands.
	pub system_room: String,
}

impl Default for EngineSettings {
	fn default() -> Self {
		Self {
			history_capacity: 2000,
			page_limit_max: 100,
			page_limit_default: 20,
			search_limit_max: 200,
			peer_queue_capacity: 1024,
			session_ttl_hours: 12,
			seed_rooms: vec!["global".to_string(), "general".to_string(), "random".to_string()],
			system_room: "global".to_string(),
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	engine: FileEngineSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	tls_cert_path: Option<String>,
	tls_key_path: Option<String>,
	http_bind: Option<String>,
	metrics_bind: Option<String>,
	auth_hmac_secret: Option<String>,
	command_rate_limit_burst: Option<u32>,
	command_rate_limit_per_minute: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileEngineSettings {
	history_capacity: Option<usize>,
	page_limit_max: Option<usize>,
	page_limit_default: Option<usize>,
	search_limit_max: Option<usize>,
	peer_queue_capacity: Option<usize>,
	session_ttl_hours: Option<u64>,
	seed_rooms: Option<Vec<String>>,
	system_room: Option<String>,
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		let defaults = ServerSettings::default();
		let engine_defaults = EngineSettings::default();

		Self {
			server: ServerSettings {
				tls_cert_path: file.server.tls_cert_path.filter(|s| !s.trim().is_empty()).map(PathBuf::from),
				tls_key_path: file.server.tls_key_path.filter(|s| !s.trim().is_empty()).map(PathBuf::from),
				http_bind: file
					.server
					.http_bind
					.filter(|s| !s.trim().is_empty())
					.unwrap_or(defaults.http_bind),
				metrics_bind: file.server.metrics_bind.filter(|s| !s.trim().is_empty()),
				auth_hmac_secret: file
					.server
					.auth_hmac_secret
					.filter(|s| !s.trim().is_empty())
					.map(SecretString::new),
				command_rate_limit_burst: file.server.command_rate_limit_burst.unwrap_or(defaults.command_rate_limit_burst),
				command_rate_limit_per_minute: file
					.server
					.command_rate_limit_per_minute
					.unwrap_or(defaults.command_rate_limit_per_minute),
			},
			engine: EngineSettings {
				history_capacity: file.engine.history_capacity.filter(|c| *c > 0).unwrap_or(engine_defaults.history_capacity),
				page_limit_max: file.engine.page_limit_max.filter(|c| *c > 0).unwrap_or(engine_defaults.page_limit_max),
				page_limit_default: file
					.engine
					.page_limit_default
					.filter(|c| *c > 0)
					.unwrap_or(engine_defaults.page_limit_default),
				search_limit_max: file.engine.search_limit_max.filter(|c| *c > 0).unwrap_or(engine_defaults.search_limit_max),
				peer_queue_capacity: file
					.engine
					.peer_queue_capacity
					.filter(|c| *c > 0)
					.unwrap_or(engine_defaults.peer_queue_capacity),
				session_ttl_hours: file
					.engine
					.session_ttl_hours
					.filter(|h| *h > 0)
					.unwrap_or(engine_defaults.session_ttl_hours),
				seed_rooms: file
					.engine
					.seed_rooms
					.filter(|rooms| !rooms.is_empty())
					.unwrap_or(engine_defaults.seed_rooms),
				system_room: file
					.engine
					.system_room
					.filter(|s| !s.trim().is_empty())
					.unwrap_or(engine_defaults.system_room),
			},
		}
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn apply_env_overrides(cfg: &mut ServerConfig) {
	if let Ok(v) = std::env::var("BANTER_TLS_CERT") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.tls_cert_path = Some(PathBuf::from(v));
			info!("server config: tls_cert_path overridden by env");
		}
	}

	if let Ok(v) = std::env::var("BANTER_TLS_KEY") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.tls_key_path = Some(PathBuf::from(v));
			info!("server config: tls_key_path overridden by env");
		}
	}

	if let Ok(v) = std::env::var("BANTER_HTTP_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.http_bind = v;
			info!("server config: http_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("BANTER_METRICS_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.metrics_bind = Some(v);
			info!("server config: metrics_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("BANTER_AUTH_HMAC_SECRET") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.auth_hmac_secret = Some(SecretString::new(v));
			info!("server auth: auth_hmac_secret overridden by env");
		}
	}

	if let Ok(v) = std::env::var("BANTER_COMMAND_RATE_LIMIT_BURST")
		&& let Ok(burst) = v.trim().parse::<u32>()
	{
		cfg.server.command_rate_limit_burst = burst;
		info!(burst, "server config: command_rate_limit_burst overridden by env");
	}

	if let Ok(v) = std::env::var("BANTER_COMMAND_RATE_LIMIT_PER_MINUTE")
		&& let Ok(rate) = v.trim().parse::<u32>()
	{
		cfg.server.command_rate_limit_per_minute = rate;
		info!(rate, "server config: command_rate_limit_per_minute overridden by env");
	}

	if let Ok(v) = std::env::var("BANTER_HISTORY_CAPACITY")
		&& let Ok(capacity) = v.trim().parse::<usize>()
		&& capacity > 0
	{
		cfg.engine.history_capacity = capacity;
		info!(capacity, "engine config: history_capacity overridden by env");
	}

	if let Ok(v) = std::env::var("BANTER_SESSION_TTL_HOURS")
		&& let Ok(hours) = v.trim().parse::<u64>()
		&& hours > 0
	{
		cfg.engine.session_ttl_hours = hours;
		info!(hours, "engine config: session_ttl_hours overridden by env");
	}

	if cfg.server.auth_hmac_secret.is_none() {
		warn!("no auth_hmac_secret configured; an ephemeral secret will be generated and tokens will not survive restarts");
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn empty_file_yields_defaults() {
		let cfg = ServerConfig::from_file(FileConfig::default());
		assert_eq!(cfg.server.http_bind, "127.0.0.1:5000");
		assert_eq!(cfg.engine.history_capacity, 2000);
		assert_eq!(cfg.engine.page_limit_max, 100);
		assert_eq!(cfg.engine.search_limit_max, 200);
		assert_eq!(cfg.engine.seed_rooms, ["global", "general", "random"]);
		assert!(cfg.server.auth_hmac_secret.is_none());
	}

	#[test]
	fn file_values_override_defaults() {
		let file: FileConfig = toml::from_str(
			r#"
			[server]
			http_bind = "0.0.0.0:8080"
			auth_hmac_secret = "super-secret"
			command_rate_limit_burst = 5

			[engine]
			history_capacity = 50
			seed_rooms = ["lobby"]
			system_room = "lobby"
			"#,
		)
		.unwrap();

		let cfg = ServerConfig::from_file(file);
		assert_eq!(cfg.server.http_bind, "0.0.0.0:8080");
		assert_eq!(cfg.server.command_rate_limit_burst, 5);
		assert_eq!(cfg.server.auth_hmac_secret.as_ref().unwrap().expose(), "super-secret");
		assert_eq!(cfg.engine.history_capacity, 50);
		assert_eq!(cfg.engine.seed_rooms, ["lobby"]);
		assert_eq!(cfg.engine.system_room, "lobby");
	}

	#[test]
	fn blank_strings_are_treated_as_absent() {
		let file: FileConfig = toml::from_str(
			r#"
			[server]
			http_bind = "  "
			auth_hmac_secret = ""
			"#,
		)
		.unwrap();

		let cfg = ServerConfig::from_file(file);
		assert_eq!(cfg.server.http_bind, "127.0.0.1:5000");
		assert!(cfg.server.auth_hmac_secret.is_none());
	}
}
