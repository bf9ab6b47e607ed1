#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context as _, anyhow};
use banter_domain::Attachment;
use banter_protocol::version::PROTOCOL_VERSION;
use banter_protocol::{FramingError, MAX_FRAME_SIZE, decode_frame, encode_frame, pb};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::server::dispatch::{wire_message, wire_presence};
use crate::server::engine::{Engine, EngineError};
use crate::util::time::unix_ms_now;

/// Per-connection server settings.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
	pub max_frame_bytes: u32,

	/// Command rate limiting; 0 disables.
	pub command_rate_limit_burst: u32,
	pub command_rate_limit_per_minute: u32,
}

impl Default for ConnectionSettings {
	fn default() -> Self {
		Self {
			max_frame_bytes: MAX_FRAME_SIZE as u32,
			command_rate_limit_burst: 0,
			command_rate_limit_per_minute: 0,
		}
	}
}

#[derive(Debug, Clone)]
struct TokenBucket {
	capacity: f64,
	tokens: f64,
	refill_per_sec: f64,
	last: Instant,
}

impl TokenBucket {
	fn new(capacity: u32, refill_per_minute: u32) -> Option<Self> {
		if capacity == 0 || refill_per_minute == 0 {
			return None;
		}
		Some(Self {
			capacity: capacity as f64,
			tokens: capacity as f64,
			refill_per_sec: refill_per_minute as f64 / 60.0,
			last: Instant::now(),
		})
	}

	fn allow(&mut self) -> bool {
		let now = Instant::now();
		let elapsed = now.duration_since(self.last).as_secs_f64();
		if elapsed > 0.0 {
			self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
			self.last = now;
		}
		if self.tokens >= 1.0 {
			self.tokens -= 1.0;
			true
		} else {
			false
		}
	}
}

/// Drive one client connection: handshake, command loop, teardown.
pub async fn handle_connection(
	conn_id: u64,
	connection: quinn::Connection,
	engine: Arc<Engine>,
	settings: ConnectionSettings,
) -> anyhow::Result<()> {
	struct ConnectionGaugeGuard;
	impl Drop for ConnectionGaugeGuard {
		fn drop(&mut self) {
			metrics::gauge!("banter_server_active_connections").decrement(1.0);
		}
	}

	metrics::gauge!("banter_server_active_connections").increment(1.0);
	let _conn_guard = ConnectionGaugeGuard;

	let max_frame = settings.max_frame_bytes as usize;

	let (mut control_send, mut control_recv) =
		connection.accept_bi().await.context("accept control bidirectional stream")?;

	let (ctrl_tx, mut ctrl_rx) = mpsc::unbounded_channel::<pb::Envelope>();
	let reader_task = tokio::spawn(async move {
		let mut buf = Vec::<u8>::with_capacity(16 * 1024);
		let mut tmp = [0u8; 8192];

		loop {
			let n = match control_recv.read(&mut tmp).await {
				Ok(Some(n)) => n,
				Ok(None) => return Ok::<(), anyhow::Error>(()),
				Err(e) => return Err(anyhow!(e).context("control stream read failed")),
			};

			metrics::counter!("banter_server_control_bytes_in_total").increment(n as u64);
			buf.extend_from_slice(&tmp[..n]);

			loop {
				match decode_frame::<pb::Envelope>(&buf, max_frame) {
					Ok((msg, used)) => {
						buf.drain(0..used);
						metrics::counter!("banter_server_envelopes_in_total").increment(1);

						if ctrl_tx.send(msg).is_err() {
							return Ok(());
						}
					}
					Err(FramingError::InsufficientData { .. }) => break,
					Err(e) => {
						metrics::counter!("banter_server_control_decode_errors_total").increment(1);
						return Err(anyhow!(e).context("failed to decode control frame"));
					}
				}
			}
		}
	});

	let hello = match wait_for_hello(&mut ctrl_rx).await {
		Ok(hello) => hello,
		Err(e) => {
			let env = error_reply("", "PROTOCOL", "expected Hello as the first frame", "");
			send_envelope(&mut control_send, &env, max_frame).await.ok();
			reader_task.abort();
			return Err(e);
		}
	};

	// Absent or invalid credentials degrade to a guest identity; the
	// handshake never rejects.
	let who = engine.authenticate(&hello.auth_token).await;
	info!(
		conn_id,
		client_name = %hello.client_name,
		identity = %who.id,
		guest = who.id.is_guest(),
		"received Hello"
	);

	let mut outbound_rx = engine.attach(conn_id, &who).await;

	let result = async {
		let welcome = pb::Envelope {
			version: PROTOCOL_VERSION,
			request_id: String::new(),
			msg: Some(pb::envelope::Msg::Welcome(pb::Welcome {
				server_name: format!("banter-server/{}", env!("CARGO_PKG_VERSION")),
				identity_id: who.id.as_str().to_string(),
				display_name: who.display_name.clone(),
				is_guest: who.id.is_guest(),
				server_time_unix_ms: unix_ms_now(),
				max_frame_bytes: settings.max_frame_bytes,
			})),
		};
		send_envelope(&mut control_send, &welcome, max_frame).await.context("send Welcome")?;

		// All replies and events share one ordered writer.
		let mut writer_task = tokio::spawn(async move {
			while let Some(env) = outbound_rx.recv().await {
				let frame = encode_frame(&env, max_frame).context("encode outbound frame")?;
				control_send.write_all(&frame).await.context("control stream write failed")?;
			}
			Ok::<(), anyhow::Error>(())
		});

		let mut limiter = TokenBucket::new(settings.command_rate_limit_burst, settings.command_rate_limit_per_minute);

		loop {
			tokio::select! {
				maybe_env = ctrl_rx.recv() => {
					let Some(env) = maybe_env else {
						debug!(conn_id, "control stream ended");
						break;
					};
					handle_envelope(conn_id, &engine, limiter.as_mut(), env).await;
				}
				res = &mut writer_task => {
					return match res {
						Ok(Ok(())) => Ok(()),
						Ok(Err(e)) => Err(e.context("events writer failed")),
						Err(e) => Err(anyhow!(e).context("events writer panicked")),
					};
				}
			}
		}

		writer_task.abort();
		Ok(())
	}
	.await;

	engine.detach(conn_id).await;
	reader_task.abort();
	result
}

async fn wait_for_hello(ctrl_rx: &mut mpsc::UnboundedReceiver<pb::Envelope>) -> anyhow::Result<pb::Hello> {
	let Some(env) = ctrl_rx.recv().await else {
		return Err(anyhow!("connection closed before Hello"));
	};

	match env.msg {
		Some(pb::envelope::Msg::Hello(hello)) => Ok(hello),
		other => Err(anyhow!("expected Hello as the first frame, got {other:?}")),
	}
}

async fn handle_envelope(conn_id: u64, engine: &Arc<Engine>, limiter: Option<&mut TokenBucket>, env: pb::Envelope) {
	let request_id = env.request_id;

	let Some(msg) = env.msg else {
		engine.reply(conn_id, error_reply(&request_id, "PROTOCOL", "empty envelope", "")).await;
		return;
	};

	if let Some(bucket) = limiter
		&& !bucket.allow()
	{
		metrics::counter!("banter_server_commands_rate_limited_total").increment(1);
		engine
			.reply(conn_id, error_reply(&request_id, "RATE_LIMITED", "too many commands", ""))
			.await;
		return;
	}

	use pb::envelope::Msg;
	match msg {
		Msg::JoinRoom(cmd) => {
			let reply = match engine.join_room(conn_id, &cmd.room).await {
				Ok(members) => reply_envelope(
					&request_id,
					Msg::MemberList(pb::MemberList {
						room: cmd.room,
						members: members.iter().map(wire_presence).collect(),
					}),
				),
				Err(e) => engine_error_reply(&request_id, &e, &cmd.room),
			};
			engine.reply(conn_id, reply).await;
		}

		Msg::LeaveRoom(cmd) => {
			let reply = match engine.leave_room(conn_id, &cmd.room).await {
				Ok(()) => reply_envelope(&request_id, Msg::Ack(pb::Ack { detail: String::new() })),
				Err(e) => engine_error_reply(&request_id, &e, &cmd.room),
			};
			engine.reply(conn_id, reply).await;
		}

		Msg::SendMessage(cmd) => {
			let attachment = if cmd.file_url.is_empty() {
				None
			} else {
				Some(Attachment {
					url: cmd.file_url,
					name: cmd.file_name,
				})
			};

			let reply = match engine.send_message(conn_id, &cmd.room, &cmd.target_id, &cmd.text, attachment).await {
				Ok(stored) => reply_envelope(
					&request_id,
					Msg::SendMessageAck(pb::SendMessageAck {
						message_id: stored.id.to_string(),
						created_at_unix_ms: stored.created_at_unix_ms,
					}),
				),
				Err(e) => engine_error_reply(&request_id, &e, &cmd.room),
			};
			engine.reply(conn_id, reply).await;
		}

		Msg::React(cmd) => {
			engine.toggle_reaction(conn_id, &cmd.room, &cmd.message_id, &cmd.symbol).await;
			maybe_ack(conn_id, engine, &request_id).await;
		}

		Msg::MarkRead(cmd) => {
			engine.mark_read(conn_id, &cmd.room, &cmd.message_id).await;
			maybe_ack(conn_id, engine, &request_id).await;
		}

		Msg::MarkDelivered(cmd) => {
			engine.mark_delivered(conn_id, &cmd.room, &cmd.message_id).await;
			maybe_ack(conn_id, engine, &request_id).await;
		}

		Msg::SetTyping(cmd) => {
			engine.set_typing(conn_id, &cmd.room, cmd.is_typing).await;
			maybe_ack(conn_id, engine, &request_id).await;
		}

		Msg::FetchHistory(cmd) => {
			let limit = if cmd.limit == 0 { None } else { Some(cmd.limit as usize) };
			let reply = match engine.fetch_history(&cmd.room, &cmd.before, limit).await {
				Ok((room, page)) => reply_envelope(
					&request_id,
					Msg::HistoryPage(pb::HistoryPage {
						room: room.into_string(),
						messages: page.iter().map(wire_message).collect(),
					}),
				),
				Err(e) => engine_error_reply(&request_id, &e, &cmd.room),
			};
			engine.reply(conn_id, reply).await;
		}

		Msg::Search(cmd) => {
			let results = engine.search(&cmd.query).await;
			let reply = reply_envelope(
				&request_id,
				Msg::SearchResults(pb::SearchResults {
					messages: results.iter().map(wire_message).collect(),
				}),
			);
			engine.reply(conn_id, reply).await;
		}

		Msg::ListRooms(_) => {
			let rooms = engine.rooms().await;
			let reply = reply_envelope(
				&request_id,
				Msg::RoomList(pb::RoomList {
					rooms: rooms.into_iter().map(|r| r.into_string()).collect(),
				}),
			);
			engine.reply(conn_id, reply).await;
		}

		Msg::ListMembers(cmd) => {
			let reply = match engine.members(&cmd.room).await {
				Ok(members) => reply_envelope(
					&request_id,
					Msg::MemberList(pb::MemberList {
						room: cmd.room,
						members: members.iter().map(wire_presence).collect(),
					}),
				),
				Err(e) => engine_error_reply(&request_id, &e, &cmd.room),
			};
			engine.reply(conn_id, reply).await;
		}

		Msg::Hello(_) => {
			warn!(conn_id, "duplicate Hello after handshake");
			engine
				.reply(conn_id, error_reply(&request_id, "PROTOCOL", "duplicate Hello", ""))
				.await;
		}

		Msg::Welcome(_)
		| Msg::Ack(_)
		| Msg::Error(_)
		| Msg::SendMessageAck(_)
		| Msg::HistoryPage(_)
		| Msg::SearchResults(_)
		| Msg::RoomList(_)
		| Msg::MemberList(_)
		| Msg::MessageEvent(_)
		| Msg::SystemNotice(_)
		| Msg::TypingEvent(_)
		| Msg::PresenceRoster(_)
		| Msg::RoomRoster(_)
		| Msg::DeliveryReceipt(_)
		| Msg::ReadReceipt(_)
		| Msg::ReactionUpdate(_) => {
			engine
				.reply(
					conn_id,
					error_reply(&request_id, "PROTOCOL", "server-to-client message sent by client", ""),
				)
				.await;
		}
	}
}

/// Fire-and-forget commands get a lightweight ack only when the client
/// asked for correlation.
async fn maybe_ack(conn_id: u64, engine: &Arc<Engine>, request_id: &str) {
	if request_id.is_empty() {
		return;
	}
	engine
		.reply(conn_id, reply_envelope(request_id, pb::envelope::Msg::Ack(pb::Ack { detail: String::new() })))
		.await;
}

fn reply_envelope(request_id: &str, msg: pb::envelope::Msg) -> pb::Envelope {
	pb::Envelope {
		version: PROTOCOL_VERSION,
		request_id: request_id.to_string(),
		msg: Some(msg),
	}
}

fn error_reply(request_id: &str, code: &str, message: &str, room: &str) -> pb::Envelope {
	reply_envelope(
		request_id,
		pb::envelope::Msg::Error(pb::Error {
			code: code.to_string(),
			message: message.to_string(),
			room: room.to_string(),
		}),
	)
}

fn engine_error_reply(request_id: &str, e: &EngineError, room: &str) -> pb::Envelope {
	error_reply(request_id, e.code(), &e.to_string(), room)
}

async fn send_envelope(send: &mut quinn::SendStream, env: &pb::Envelope, max_frame: usize) -> anyhow::Result<()> {
	let frame = encode_frame(env, max_frame).context("encode envelope")?;
	send.write_all(&frame).await.context("write envelope")?;
	Ok(())
}
