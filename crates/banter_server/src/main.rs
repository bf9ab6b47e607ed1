#![forbid(unsafe_code)]

mod config;
mod quic;
mod server;
mod util;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use banter_domain::RoomName;
use banter_util::endpoint::RealtimeEndpoint;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::quic::config::RealtimeListener;
use crate::server::connection::{ConnectionSettings, handle_connection};
use crate::server::engine::{Engine, EngineConfig};
use crate::server::gateway::{ReadyState, spawn_gateway};
use crate::server::history::HistoryConfig;
use crate::server::secret::SecretString;

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: banter_server [--bind quic://host:port]\n\
\n\
Options:\n\
\t--bind    Realtime bind endpoint (default: quic://127.0.0.1:18450)\n\
\t         Format: quic://host:port\n\
\t--help   Show this help\n\
"
	);
	std::process::exit(2)
}

fn parse_args() -> SocketAddr {
	let mut bind_endpoint = "quic://127.0.0.1:18450".to_string();

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--bind" | "--listen" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--bind must be non-empty (expected quic://host:port)");
					usage_and_exit();
				}
				bind_endpoint = v;
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	let bind = RealtimeEndpoint::parse(&bind_endpoint).unwrap_or_else(|e| {
		eprintln!("{e}");
		usage_and_exit();
	});

	bind.socket_addr().unwrap_or_else(|e| {
		eprintln!("{e}");
		usage_and_exit();
	})
}

fn init_rustls_crypto_provider() {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,banter_server=debug".to_string());

	tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false))
		.init();
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

fn engine_config(settings: &config::EngineSettings) -> EngineConfig {
	let seed_rooms: Vec<RoomName> = settings
		.seed_rooms
		.iter()
		.filter_map(|name| match RoomName::new(name.clone()) {
			Ok(room) => Some(room),
			Err(e) => {
				warn!(error = %e, name = %name, "skipping invalid seed room");
				None
			}
		})
		.collect();

	let system_room = RoomName::new(settings.system_room.clone()).unwrap_or_else(|e| {
		warn!(error = %e, "invalid system room in config; using \"global\"");
		RoomName::new("global").expect("fallback system room")
	});

	EngineConfig {
		seed_rooms,
		system_room,
		history: HistoryConfig {
			room_capacity: settings.history_capacity,
			page_limit_max: settings.page_limit_max,
			page_limit_default: settings.page_limit_default,
			search_limit_max: settings.search_limit_max,
		},
		peer_queue_capacity: settings.peer_queue_capacity,
		session_ttl: Duration::from_secs(settings.session_ttl_hours * 60 * 60),
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_rustls_crypto_provider();
	init_tracing();

	let bind_addr = parse_args();

	let config_path = crate::config::default_config_path()?;
	let server_cfg = crate::config::load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	init_metrics(server_cfg.server.metrics_bind.as_deref());

	let secret = server_cfg
		.server
		.auth_hmac_secret
		.clone()
		.unwrap_or_else(|| SecretString::new(uuid::Uuid::new_v4().simple().to_string()));

	// One engine for the whole process; every connection handler and the
	// HTTP gateway share it.
	let engine = Arc::new(Engine::new(engine_config(&server_cfg.engine), secret));

	let ready = ReadyState::new();
	match server_cfg.server.http_bind.parse::<SocketAddr>() {
		Ok(addr) => {
			spawn_gateway(addr, Arc::clone(&engine), ready.clone());
			info!(%addr, "http gateway listening");
		}
		Err(e) => warn!(error = %e, bind = %server_cfg.server.http_bind, "invalid http bind address (expected host:port)"),
	}

	let listener = RealtimeListener::new(bind_addr);
	let tls = server_cfg
		.server
		.tls_cert_path
		.as_deref()
		.zip(server_cfg.server.tls_key_path.as_deref());
	let endpoint = listener.bind(tls)?;
	info!(bind = %bind_addr, "realtime endpoint ready");

	ready.mark_ready();

	let conn_settings = ConnectionSettings {
		command_rate_limit_burst: server_cfg.server.command_rate_limit_burst,
		command_rate_limit_per_minute: server_cfg.server.command_rate_limit_per_minute,
		..ConnectionSettings::default()
	};

	let mut next_conn_id: u64 = 1;

	loop {
		let Some(connecting) = endpoint.accept().await else {
			break;
		};

		let conn_id = next_conn_id;
		next_conn_id += 1;
		metrics::counter!("banter_server_connections_total").increment(1);

		let engine = Arc::clone(&engine);
		let conn_settings = conn_settings.clone();

		tokio::spawn(async move {
			match connecting.await {
				Ok(connection) => {
					info!(conn_id, remote = %connection.remote_address(), "accepted connection");

					if let Err(e) = handle_connection(conn_id, connection, engine, conn_settings).await {
						warn!(conn_id, error = %e, "connection handler exited with error");
					}
				}
				Err(e) => {
					warn!(conn_id, error = %e, "failed to establish connection");
				}
			}
		});
	}

	Ok(())
}
