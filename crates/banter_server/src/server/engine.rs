#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use banter_domain::{Attachment, ChatMessage, Identity, IdentityId, MessageId, RoomName};
use banter_protocol::pb;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::info;

use crate::server::auth::{AuthClaims, CredentialVerifier, HmacVerifier, VerifiedIdentity, mint_token};
use crate::server::dispatch::Dispatcher;
use crate::server::history::{HistoryConfig, MessageStore};
use crate::server::hub::Hub;
use crate::server::secret::SecretString;
use crate::server::sessions::Sessions;
use crate::util::time::unix_ms_now;

/// Engine tunables, resolved from config at startup.
#[derive(Debug, Clone)]
pub struct EngineConfig {
	/// Rooms that exist from the start, in listing order.
	pub seed_rooms: Vec<RoomName>,
	/// Room every connection is joined to on attach and that carries
	/// connect/disconnect notices.
	pub system_room: RoomName,
	pub history: HistoryConfig,
	/// Outbound queue capacity per connection.
	pub peer_queue_capacity: usize,
	/// Lifetime of minted session tokens.
	pub session_ttl: Duration,
}

impl Default for EngineConfig {
	fn default() -> Self {
		Self {
			seed_rooms: ["global", "general", "random"]
				.into_iter()
				.map(|r| RoomName::new(r).expect("seed room name"))
				.collect(),
			system_room: RoomName::new("global").expect("system room name"),
			history: HistoryConfig::default(),
			peer_queue_capacity: 1024,
			session_ttl: Duration::from_secs(12 * 60 * 60),
		}
	}
}

/// Synchronously rejected requests; nothing was mutated.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EngineError {
	#[error("username required")]
	EmptyUsername,
	#[error("room name required")]
	EmptyRoom,
	#[error("message requires text or an attachment")]
	EmptyMessage,
	#[error("invalid target identity")]
	BadTarget,
	#[error("invalid history cursor: {0}")]
	BadCursor(String),
	#[error("connection is not attached")]
	UnknownConnection,
	#[error("internal error: {0}")]
	Internal(String),
}

impl EngineError {
	/// Stable wire code for `pb::Error.code`.
	pub fn code(&self) -> &'static str {
		match self {
			EngineError::EmptyUsername => "EMPTY_USERNAME",
			EngineError::EmptyRoom => "EMPTY_ROOM",
			EngineError::EmptyMessage => "EMPTY_MESSAGE",
			EngineError::BadTarget => "BAD_TARGET",
			EngineError::BadCursor(_) => "BAD_CURSOR",
			EngineError::UnknownConnection => "UNKNOWN_CONNECTION",
			EngineError::Internal(_) => "INTERNAL",
		}
	}
}

/// Reply to a successful login.
#[derive(Debug, Clone)]
pub struct LoginGrant {
	pub token: String,
	pub username: String,
	pub user_id: String,
}

/// The in-memory authority over rooms, identities, messages, and delivery
/// state. Constructed once at startup and shared by every connection
/// handler and the HTTP gateway; all mutation goes through its operations.
pub struct Engine {
	cfg: EngineConfig,
	sessions: Arc<Sessions>,
	store: Arc<MessageStore>,
	hub: Arc<Hub>,
	dispatcher: Dispatcher,
	verifier: Arc<dyn CredentialVerifier>,
	secret: SecretString,
}

impl Engine {
	pub fn new(cfg: EngineConfig, secret: SecretString) -> Self {
		let verifier = Arc::new(HmacVerifier::new(secret.clone()));
		Self::with_verifier(cfg, secret, verifier)
	}

	/// Engine with an injected credential verifier (the seam external
	/// credential systems plug into).
	pub fn with_verifier(cfg: EngineConfig, secret: SecretString, verifier: Arc<dyn CredentialVerifier>) -> Self {
		let sessions = Arc::new(Sessions::new(&cfg.seed_rooms));
		let store = Arc::new(MessageStore::new(cfg.history.clone()));
		let hub = Arc::new(Hub::new(cfg.peer_queue_capacity));
		let dispatcher = Dispatcher::new(Arc::clone(&sessions), Arc::clone(&store), Arc::clone(&hub));

		Self {
			cfg,
			sessions,
			store,
			hub,
			dispatcher,
			verifier,
			secret,
		}
	}

	/// Resolve a raw token to an identity. Absent or invalid credentials
	/// degrade to a fresh guest identity; the handshake never fails here.
	pub async fn authenticate(&self, token: &str) -> VerifiedIdentity {
		let token = token.trim();
		if !token.is_empty()
			&& let Some(verified) = self.verifier.verify(token).await
		{
			return verified;
		}

		let id = IdentityId::new_guest();
		let suffix: String = id.as_str().trim_start_matches("guest-").chars().take(5).collect();
		VerifiedIdentity {
			display_name: format!("Guest_{suffix}"),
			id,
		}
	}

	/// Mint a session token for a login request. Token issuance is the
	/// only part of login the engine owns; verification stays behind the
	/// [`CredentialVerifier`] seam.
	pub async fn login(&self, username: &str) -> Result<LoginGrant, EngineError> {
		let username = username.trim();
		if username.is_empty() {
			return Err(EngineError::EmptyUsername);
		}

		let sanitized: String = username.split_whitespace().collect::<Vec<_>>().join("_");
		let user_id = format!("{sanitized}_{}", unix_ms_now());

		let claims = AuthClaims {
			sub: user_id.clone(),
			name: username.to_string(),
			exp: (unix_ms_now() / 1000) as u64 + self.cfg.session_ttl.as_secs(),
		};
		let token = mint_token(&claims, self.secret.expose()).map_err(|e| EngineError::Internal(e.to_string()))?;

		info!(user_id = %user_id, "minted session token");
		Ok(LoginGrant {
			token,
			username: username.to_string(),
			user_id,
		})
	}

	/// Register a connection: bind the identity, join the system room,
	/// announce presence, and hand back the connection's outbound queue.
	pub async fn attach(&self, conn_id: u64, who: &VerifiedIdentity) -> mpsc::Receiver<pb::Envelope> {
		let rx = self.hub.register(conn_id).await;

		self.sessions.attach(conn_id, &who.id, &who.display_name).await;
		self.sessions.join(conn_id, &self.cfg.system_room).await;

		self.dispatcher.notify_presence().await;
		self.dispatcher
			.notify_system(&self.cfg.system_room, format!("{} joined", who.display_name))
			.await;

		let rooms = self.sessions.rooms().await;
		let room_list = crate::server::dispatch::event(pb::envelope::Msg::RoomList(pb::RoomList {
			rooms: rooms.into_iter().map(RoomName::into_string).collect(),
		}));
		self.hub.send_to(conn_id, room_list).await;

		info!(conn_id, identity = %who.id, "connection attached");
		rx
	}

	/// Tear down a connection: drop memberships, mark the identity offline
	/// (unless superseded by a reconnect), and announce the departure.
	pub async fn detach(&self, conn_id: u64) {
		self.hub.unregister(conn_id).await;

		let Some(outcome) = self.sessions.detach(conn_id).await else {
			return;
		};

		self.dispatcher.notify_presence().await;
		if outcome.went_offline {
			self.dispatcher
				.notify_system(&self.cfg.system_room, format!("{} left", outcome.identity.display_name))
				.await;
		}

		info!(conn_id, identity = %outcome.identity.id, went_offline = outcome.went_offline, "connection detached");
	}

	/// Join a room (creating it on first reference) and return the member
	/// roster. Prior members get a system notice about the join.
	pub async fn join_room(&self, conn_id: u64, room: &str) -> Result<Vec<Identity>, EngineError> {
		let room = RoomName::new(room).map_err(|_| EngineError::EmptyRoom)?;
		let who = self.sessions.identity_for_conn(conn_id).await.ok_or(EngineError::UnknownConnection)?;

		let outcome = self.sessions.join(conn_id, &room).await;
		if outcome.newly_joined {
			self.dispatcher
				.notify_system_conns(&room, &outcome.prior_members, format!("{} joined {}", who.display_name, room))
				.await;
			self.dispatcher.notify_room_roster(&room).await;
		}

		Ok(self.sessions.member_presences(&room).await)
	}

	/// Leave a room; a no-op (still acknowledged) when not a member.
	pub async fn leave_room(&self, conn_id: u64, room: &str) -> Result<(), EngineError> {
		let room = RoomName::new(room).map_err(|_| EngineError::EmptyRoom)?;
		let who = self.sessions.identity_for_conn(conn_id).await.ok_or(EngineError::UnknownConnection)?;

		if self.sessions.leave(conn_id, &room).await {
			self.dispatcher
				.notify_system(&room, format!("{} left {}", who.display_name, room))
				.await;
			self.dispatcher.notify_room_roster(&room).await;
		}
		Ok(())
	}

	/// Store and route one outgoing message: broadcast to the room unless
	/// a target identity makes it private.
	pub async fn send_message(
		&self,
		conn_id: u64,
		room: &str,
		target_id: &str,
		text: &str,
		attachment: Option<Attachment>,
	) -> Result<ChatMessage, EngineError> {
		let who = self.sessions.identity_for_conn(conn_id).await.ok_or(EngineError::UnknownConnection)?;

		let text = if text.is_empty() { None } else { Some(text.to_string()) };
		if text.is_none() && attachment.is_none() {
			return Err(EngineError::EmptyMessage);
		}

		let room = if room.trim().is_empty() {
			self.cfg.system_room.clone()
		} else {
			RoomName::new(room).map_err(|_| EngineError::EmptyRoom)?
		};

		let stored = if target_id.trim().is_empty() {
			let draft = ChatMessage::broadcast(room, who.id, who.display_name, text, attachment);
			self.dispatcher.send_broadcast(draft).await
		} else {
			let target = IdentityId::new(target_id).map_err(|_| EngineError::BadTarget)?;
			let draft = ChatMessage::private(room, who.id, who.display_name, target, text, attachment);
			self.dispatcher.send_private(conn_id, draft).await
		};

		Ok(stored)
	}

	/// Record a delivery receipt; stale references are silent no-ops.
	pub async fn mark_delivered(&self, conn_id: u64, room: &str, message_id: &str) {
		let Some((who, room, id)) = self.resolve_receipt(conn_id, room, message_id).await else {
			return;
		};

		if self.store.record_delivered(&room, id, &who.id).await {
			self.dispatcher.broadcast_delivery(&room, id, &who.id).await;
		}
	}

	/// Record a read receipt; re-broadcasts the full read-by set on change.
	pub async fn mark_read(&self, conn_id: u64, room: &str, message_id: &str) {
		let Some((who, room, id)) = self.resolve_receipt(conn_id, room, message_id).await else {
			return;
		};

		if let Some(read_by) = self.store.record_read(&room, id, &who.id).await {
			self.dispatcher.broadcast_read(&room, id, &read_by).await;
		}
	}

	/// Toggle a reaction and broadcast the updated map on success.
	pub async fn toggle_reaction(&self, conn_id: u64, room: &str, message_id: &str, symbol: &str) {
		let Some((who, room, id)) = self.resolve_receipt(conn_id, room, message_id).await else {
			return;
		};

		if let Some(reactions) = self.store.toggle_reaction(&room, id, symbol, &who.id).await {
			self.dispatcher.broadcast_reaction(&room, id, &reactions).await;
		}
	}

	/// Ephemeral typing signal; defaults to the system room like the
	/// other room-less commands.
	pub async fn set_typing(&self, conn_id: u64, room: &str, is_typing: bool) {
		let Some(who) = self.sessions.identity_for_conn(conn_id).await else {
			return;
		};

		let room = if room.trim().is_empty() {
			self.cfg.system_room.clone()
		} else {
			match RoomName::new(room) {
				Ok(room) => room,
				Err(_) => return,
			}
		};

		self.dispatcher.notify_typing(&room, conn_id, &who, is_typing).await;
	}

	/// Cursor-paginated history, oldest-first. Returns the resolved room
	/// alongside the page (a room-less request defaults to the system
	/// room).
	pub async fn fetch_history(
		&self,
		room: &str,
		before: &str,
		limit: Option<usize>,
	) -> Result<(RoomName, Vec<ChatMessage>), EngineError> {
		let room = if room.trim().is_empty() {
			self.cfg.system_room.clone()
		} else {
			RoomName::new(room).map_err(|_| EngineError::EmptyRoom)?
		};

		let before = match before.trim() {
			"" => None,
			cursor => Some(
				cursor
					.parse::<MessageId>()
					.map_err(|_| EngineError::BadCursor(cursor.to_string()))?,
			),
		};

		let page = self.store.page(&room, before, limit).await;
		Ok((room, page))
	}

	/// Substring search across all rooms, capped at the configured limit.
	pub async fn search(&self, query: &str) -> Vec<ChatMessage> {
		self.store.search(query, self.cfg.history.search_limit_max).await
	}

	pub async fn rooms(&self) -> Vec<RoomName> {
		self.sessions.rooms().await
	}

	pub async fn roster(&self) -> Vec<Identity> {
		self.sessions.roster().await
	}

	pub async fn members(&self, room: &str) -> Result<Vec<Identity>, EngineError> {
		let room = RoomName::new(room).map_err(|_| EngineError::EmptyRoom)?;
		Ok(self.sessions.member_presences(&room).await)
	}

	/// Queue a reply envelope on a connection's ordered outbound channel.
	pub async fn reply(&self, conn_id: u64, env: pb::Envelope) {
		self.hub.send_to(conn_id, env).await;
	}

	/// Shared parse/lookup for the receipt and reaction paths. `None`
	/// covers both unattached connections and unparseable references; the
	/// latter count as stale.
	async fn resolve_receipt(&self, conn_id: u64, room: &str, message_id: &str) -> Option<(Identity, RoomName, MessageId)> {
		let who = self.sessions.identity_for_conn(conn_id).await?;

		let (Ok(room), Ok(id)) = (RoomName::new(room), message_id.parse::<MessageId>()) else {
			metrics::counter!("banter_server_stale_references_total").increment(1);
			return None;
		};

		Some((who, room, id))
	}
}
