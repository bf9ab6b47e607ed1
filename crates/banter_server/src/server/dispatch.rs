#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use banter_domain::{ChatMessage, Identity, IdentityId, MessageId, RoomName};
use banter_protocol::pb;
use banter_protocol::version::PROTOCOL_VERSION;
use tracing::debug;

use crate::server::history::MessageStore;
use crate::server::hub::Hub;
use crate::server::sessions::Sessions;
use crate::util::time::unix_ms_now;

/// Routes outgoing messages to a room's membership or a single identity and
/// emits the ephemeral presence/typing/system notifications.
#[derive(Clone)]
pub struct Dispatcher {
	sessions: Arc<Sessions>,
	store: Arc<MessageStore>,
	hub: Arc<Hub>,
}

impl Dispatcher {
	pub fn new(sessions: Arc<Sessions>, store: Arc<MessageStore>, hub: Arc<Hub>) -> Self {
		Self { sessions, store, hub }
	}

	/// Store a broadcast message and fan it out to the room's current
	/// membership. `delivered_to` is seeded from one atomic snapshot of
	/// that membership taken at send time.
	pub async fn send_broadcast(&self, mut draft: ChatMessage) -> ChatMessage {
		let snapshot = self.sessions.delivery_snapshot(&draft.room).await;
		draft.delivered_to = snapshot.identities;

		let stored = self.store.append(draft).await;
		let env = event(pb::envelope::Msg::MessageEvent(pb::MessageEvent {
			message: Some(wire_message(&stored)),
		}));
		self.hub.send_to_many(&snapshot.conns, env).await;
		stored
	}

	/// Store a private message; deliver to the target's live connection if
	/// online, and always echo to the sender so their own timeline stays
	/// in order.
	pub async fn send_private(&self, sender_conn: u64, mut draft: ChatMessage) -> ChatMessage {
		let target_conn = match draft.target.as_ref() {
			Some(target) => self.sessions.conn_for(target).await,
			None => None,
		};

		if target_conn.is_some()
			&& let Some(target) = draft.target.clone()
		{
			draft.record_delivered(&target);
		}

		let stored = self.store.append(draft).await;
		let env = event(pb::envelope::Msg::MessageEvent(pb::MessageEvent {
			message: Some(wire_message(&stored)),
		}));

		if let Some(conn) = target_conn
			&& conn != sender_conn
		{
			self.hub.send_to(conn, env.clone()).await;
		} else if target_conn.is_none() {
			debug!(message_id = %stored.id, "private target offline; stored without delivery");
		}
		self.hub.send_to(sender_conn, env).await;

		stored
	}

	/// Ephemeral room notice; never persisted to the message log.
	pub async fn notify_system(&self, room: &RoomName, text: impl Into<String>) {
		let members = self.sessions.members_of(room).await;
		self.notify_system_conns(room, &members, text).await;
	}

	/// Same as [`notify_system`], for a pre-computed recipient snapshot
	/// (e.g. a room's members prior to a join).
	pub async fn notify_system_conns(&self, room: &RoomName, conns: &[u64], text: impl Into<String>) {
		let env = event(pb::envelope::Msg::SystemNotice(pb::SystemNotice {
			room: room.as_str().to_string(),
			text: text.into(),
			server_time_unix_ms: unix_ms_now(),
		}));
		self.hub.send_to_many(conns, env).await;
	}

	/// Ephemeral typing signal to the room, excluding the typist's own
	/// connection.
	pub async fn notify_typing(&self, room: &RoomName, typist_conn: u64, identity: &Identity, is_typing: bool) {
		let members: Vec<u64> = self
			.sessions
			.members_of(room)
			.await
			.into_iter()
			.filter(|conn| *conn != typist_conn)
			.collect();

		let env = event(pb::envelope::Msg::TypingEvent(pb::TypingEvent {
			room: room.as_str().to_string(),
			identity_id: identity.id.as_str().to_string(),
			display_name: identity.display_name.clone(),
			is_typing,
		}));
		self.hub.send_to_many(&members, env).await;
	}

	/// Full identity roster to every connection; sent on any
	/// connect/disconnect.
	pub async fn notify_presence(&self) {
		let roster = self.sessions.roster().await;
		let env = event(pb::envelope::Msg::PresenceRoster(pb::PresenceRoster {
			identities: roster.iter().map(wire_presence).collect(),
		}));
		self.hub.broadcast(env).await;
	}

	/// Current member roster of a room, to that room's members.
	pub async fn notify_room_roster(&self, room: &RoomName) {
		let members = self.sessions.members_of(room).await;
		let presences = self.sessions.member_presences(room).await;
		let env = event(pb::envelope::Msg::RoomRoster(pb::RoomRoster {
			room: room.as_str().to_string(),
			members: presences.iter().map(wire_presence).collect(),
		}));
		self.hub.send_to_many(&members, env).await;
	}

	pub async fn broadcast_delivery(&self, room: &RoomName, id: MessageId, identity: &IdentityId) {
		let members = self.sessions.members_of(room).await;
		let env = event(pb::envelope::Msg::DeliveryReceipt(pb::DeliveryReceipt {
			room: room.as_str().to_string(),
			message_id: id.to_string(),
			identity_id: identity.as_str().to_string(),
		}));
		self.hub.send_to_many(&members, env).await;
	}

	pub async fn broadcast_read(&self, room: &RoomName, id: MessageId, read_by: &[IdentityId]) {
		let members = self.sessions.members_of(room).await;
		let env = event(pb::envelope::Msg::ReadReceipt(pb::ReadReceipt {
			room: room.as_str().to_string(),
			message_id: id.to_string(),
			read_by: read_by.iter().map(|id| id.as_str().to_string()).collect(),
		}));
		self.hub.send_to_many(&members, env).await;
	}

	pub async fn broadcast_reaction(&self, room: &RoomName, id: MessageId, reactions: &BTreeMap<String, Vec<IdentityId>>) {
		let members = self.sessions.members_of(room).await;
		let env = event(pb::envelope::Msg::ReactionUpdate(pb::ReactionUpdate {
			room: room.as_str().to_string(),
			message_id: id.to_string(),
			reactions: wire_reactions(reactions),
		}));
		self.hub.send_to_many(&members, env).await;
	}
}

/// Wrap a server-initiated event payload; events carry no request id.
pub(crate) fn event(msg: pb::envelope::Msg) -> pb::Envelope {
	pb::Envelope {
		version: PROTOCOL_VERSION,
		request_id: String::new(),
		msg: Some(msg),
	}
}

pub(crate) fn wire_message(msg: &ChatMessage) -> pb::Message {
	pb::Message {
		id: msg.id.to_string(),
		room: msg.room.as_str().to_string(),
		sender_id: msg.sender_id.as_str().to_string(),
		sender_name: msg.sender_name.clone(),
		text: msg.text.clone().unwrap_or_default(),
		file_url: msg.attachment.as_ref().map(|a| a.url.clone()).unwrap_or_default(),
		file_name: msg.attachment.as_ref().map(|a| a.name.clone()).unwrap_or_default(),
		is_private: msg.is_private,
		target_id: msg.target.as_ref().map(|t| t.as_str().to_string()).unwrap_or_default(),
		created_at_unix_ms: msg.created_at_unix_ms,
		delivered_to: msg.delivered_to.iter().map(|id| id.as_str().to_string()).collect(),
		read_by: msg.read_by.iter().map(|id| id.as_str().to_string()).collect(),
		reactions: wire_reactions(&msg.reactions),
	}
}

pub(crate) fn wire_presence(identity: &Identity) -> pb::Presence {
	pb::Presence {
		identity_id: identity.id.as_str().to_string(),
		display_name: identity.display_name.clone(),
		online: identity.online,
	}
}

fn wire_reactions(reactions: &BTreeMap<String, Vec<IdentityId>>) -> Vec<pb::ReactionEntry> {
	reactions
		.iter()
		.map(|(symbol, members)| pb::ReactionEntry {
			symbol: symbol.clone(),
			identity_ids: members.iter().map(|id| id.as_str().to_string()).collect(),
		})
		.collect()
}
