#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::warn;

use crate::server::engine::{Engine, EngineError};

/// Liveness/readiness flag surfaced on `/readyz`.
#[derive(Clone, Default)]
pub struct ReadyState {
	ready: Arc<AtomicBool>,
}

impl ReadyState {
	pub fn new() -> Self {
		Self {
			ready: Arc::new(AtomicBool::new(false)),
		}
	}

	pub fn mark_ready(&self) {
		self.ready.store(true, Ordering::Relaxed);
	}

	pub fn is_ready(&self) -> bool {
		self.ready.load(Ordering::Relaxed)
	}
}

/// Run the HTTP gateway (REST surface + health endpoints) in the
/// background.
pub fn spawn_gateway(bind: SocketAddr, engine: Arc<Engine>, ready: ReadyState) {
	tokio::spawn(async move {
		if let Err(err) = run_gateway(bind, engine, ready).await {
			warn!(error = %err, "http gateway stopped");
		}
	});
}

async fn run_gateway(bind: SocketAddr, engine: Arc<Engine>, ready: ReadyState) -> anyhow::Result<()> {
	let listener = TcpListener::bind(bind).await?;
	loop {
		let (stream, _addr) = listener.accept().await?;
		let io = TokioIo::new(stream);
		let engine = Arc::clone(&engine);
		let ready = ready.clone();
		tokio::spawn(async move {
			let service = service_fn(move |req| handle_request(req, Arc::clone(&engine), ready.clone()));
			if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
				warn!(error = %err, "gateway connection error");
			}
		});
	}
}

async fn handle_request(
	req: Request<Incoming>,
	engine: Arc<Engine>,
	ready: ReadyState,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
	let method = req.method().clone();
	let uri = req.uri().clone();

	match (&method, uri.path()) {
		(&Method::GET, "/healthz") => Ok(text_response(StatusCode::OK, "ok")),

		(&Method::GET, "/readyz") => {
			if ready.is_ready() {
				Ok(text_response(StatusCode::OK, "ready"))
			} else {
				Ok(text_response(StatusCode::SERVICE_UNAVAILABLE, "not-ready"))
			}
		}

		(&Method::POST, "/api/login") => {
			let body = req.into_body().collect().await?.to_bytes();
			let username = serde_json::from_slice::<serde_json::Value>(&body)
				.ok()
				.and_then(|v| v.get("username").and_then(|u| u.as_str()).map(str::to_string))
				.unwrap_or_default();

			match engine.login(&username).await {
				Ok(grant) => Ok(json_response(
					StatusCode::OK,
					&json!({
						"token": grant.token,
						"username": grant.username,
						"userId": grant.user_id,
					}),
				)),
				Err(e) => Ok(engine_error_response(&e)),
			}
		}

		(&Method::GET, "/api/messages") => {
			let room = query_param(&uri, "room").unwrap_or_default();
			let before = query_param(&uri, "before").unwrap_or_default();
			let limit = query_param(&uri, "limit").and_then(|l| l.parse::<usize>().ok());

			match engine.fetch_history(&room, &before, limit).await {
				Ok((_, page)) => Ok(json_response(StatusCode::OK, &json!(page))),
				Err(e) => Ok(engine_error_response(&e)),
			}
		}

		(&Method::GET, "/api/rooms") => {
			let rooms: Vec<String> = engine.rooms().await.into_iter().map(|r| r.into_string()).collect();
			Ok(json_response(StatusCode::OK, &json!(rooms)))
		}

		(&Method::GET, "/api/users") => {
			let roster = engine.roster().await;
			Ok(json_response(StatusCode::OK, &json!(roster)))
		}

		(&Method::GET, "/api/search") => {
			let query = query_param(&uri, "q").unwrap_or_default();
			let results = engine.search(&query).await;
			Ok(json_response(StatusCode::OK, &json!(results)))
		}

		(_, "/healthz" | "/readyz" | "/api/login" | "/api/messages" | "/api/rooms" | "/api/users" | "/api/search") => {
			Ok(text_response(StatusCode::METHOD_NOT_ALLOWED, ""))
		}

		_ => Ok(text_response(StatusCode::NOT_FOUND, "")),
	}
}

/// Decode one query parameter; `+` and percent escapes are unwrapped.
fn query_param(uri: &Uri, key: &str) -> Option<String> {
	let query = uri.query()?;
	for pair in query.split('&') {
		let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
		if k != key {
			continue;
		}
		let v = v.replace('+', " ");
		return Some(urlencoding::decode(&v).map(|s| s.into_owned()).unwrap_or(v));
	}
	None
}

fn engine_error_response(e: &EngineError) -> Response<Full<Bytes>> {
	json_response(StatusCode::BAD_REQUEST, &json!({ "error": e.to_string() }))
}

fn json_response(status: StatusCode, value: &serde_json::Value) -> Response<Full<Bytes>> {
	Response::builder()
		.status(status)
		.header("content-type", "application/json")
		.body(Full::new(Bytes::from(value.to_string())))
		.unwrap()
}

fn text_response(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
	Response::builder().status(status).body(Full::new(Bytes::from_static(body.as_bytes()))).unwrap()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn query_param_decodes_escapes() {
		let uri: Uri = "/api/search?q=hello+world&limit=20".parse().unwrap();
		assert_eq!(query_param(&uri, "q").as_deref(), Some("hello world"));
		assert_eq!(query_param(&uri, "limit").as_deref(), Some("20"));
		assert_eq!(query_param(&uri, "missing"), None);

		let uri: Uri = "/api/messages?room=caf%C3%A9".parse().unwrap();
		assert_eq!(query_param(&uri, "room").as_deref(), Some("café"));
	}

	#[test]
	fn ready_state_flips_once() {
		let ready = ReadyState::new();
		assert!(!ready.is_ready());
		ready.mark_ready();
		assert!(ready.is_ready());
	}
}
