#![forbid(unsafe_code)]

//! Wire messages for the banter v1 protocol.
//!
//! Every frame on the control stream is one [`Envelope`]. The envelope's
//! tagged `msg` variant carries the actual command, reply, or
//! server-initiated event, so payload shapes are checked once at the
//! boundary and handlers match exhaustively.

/// Top-level frame payload.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Envelope {
	#[prost(uint32, tag = "1")]
	pub version: u32,

	/// Correlates replies with commands; empty on server-initiated events.
	#[prost(string, tag = "2")]
	pub request_id: String,

	#[prost(
		oneof = "envelope::Msg",
		tags = "10, 11, 12, 13, 20, 21, 22, 23, 24, 25, 26, 27, 28, 29, 30, 40, 41, 42, 43, 44, 50, 51, 52, 53, 54, 55, 56, 57"
	)]
	pub msg: Option<envelope::Msg>,
}

pub mod envelope {
	/// The tagged payload of an [`super::Envelope`].
	#[derive(Clone, PartialEq, ::prost::Oneof)]
	pub enum Msg {
		// Session establishment.
		#[prost(message, tag = "10")]
		Hello(super::Hello),
		#[prost(message, tag = "11")]
		Welcome(super::Welcome),
		#[prost(message, tag = "12")]
		Error(super::Error),
		#[prost(message, tag = "13")]
		Ack(super::Ack),

		// Client commands.
		#[prost(message, tag = "20")]
		JoinRoom(super::JoinRoom),
		#[prost(message, tag = "21")]
		LeaveRoom(super::LeaveRoom),
		#[prost(message, tag = "22")]
		SendMessage(super::SendMessage),
		#[prost(message, tag = "23")]
		React(super::React),
		#[prost(message, tag = "24")]
		MarkRead(super::MarkRead),
		#[prost(message, tag = "25")]
		MarkDelivered(super::MarkDelivered),
		#[prost(message, tag = "26")]
		SetTyping(super::SetTyping),
		#[prost(message, tag = "27")]
		FetchHistory(super::FetchHistory),
		#[prost(message, tag = "28")]
		Search(super::Search),
		#[prost(message, tag = "29")]
		ListRooms(super::ListRooms),
		#[prost(message, tag = "30")]
		ListMembers(super::ListMembers),

		// Replies.
		#[prost(message, tag = "40")]
		SendMessageAck(super::SendMessageAck),
		#[prost(message, tag = "41")]
		HistoryPage(super::HistoryPage),
		#[prost(message, tag = "42")]
		SearchResults(super::SearchResults),
		#[prost(message, tag = "43")]
		RoomList(super::RoomList),
		#[prost(message, tag = "44")]
		MemberList(super::MemberList),

		// Server-initiated events.
		#[prost(message, tag = "50")]
		MessageEvent(super::MessageEvent),
		#[prost(message, tag = "51")]
		SystemNotice(super::SystemNotice),
		#[prost(message, tag = "52")]
		TypingEvent(super::TypingEvent),
		#[prost(message, tag = "53")]
		PresenceRoster(super::PresenceRoster),
		#[prost(message, tag = "54")]
		RoomRoster(super::RoomRoster),
		#[prost(message, tag = "55")]
		DeliveryReceipt(super::DeliveryReceipt),
		#[prost(message, tag = "56")]
		ReadReceipt(super::ReadReceipt),
		#[prost(message, tag = "57")]
		ReactionUpdate(super::ReactionUpdate),
	}
}

/// First frame a client must send. `auth_token` may be empty or invalid;
/// the server then degrades the session to a guest identity instead of
/// rejecting the handshake.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Hello {
	#[prost(string, tag = "1")]
	pub client_name: String,
	#[prost(string, tag = "2")]
	pub auth_token: String,
	#[prost(string, tag = "3")]
	pub client_instance_id: String,
}

/// Server reply to `Hello`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Welcome {
	#[prost(string, tag = "1")]
	pub server_name: String,
	#[prost(string, tag = "2")]
	pub identity_id: String,
	#[prost(string, tag = "3")]
	pub display_name: String,
	#[prost(bool, tag = "4")]
	pub is_guest: bool,
	#[prost(int64, tag = "5")]
	pub server_time_unix_ms: i64,
	#[prost(uint32, tag = "6")]
	pub max_frame_bytes: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Error {
	#[prost(string, tag = "1")]
	pub code: String,
	#[prost(string, tag = "2")]
	pub message: String,
	#[prost(string, tag = "3")]
	pub room: String,
}

/// Lightweight positive acknowledgement for commands without a richer reply.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Ack {
	#[prost(string, tag = "1")]
	pub detail: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct JoinRoom {
	#[prost(string, tag = "1")]
	pub room: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LeaveRoom {
	#[prost(string, tag = "1")]
	pub room: String,
}

/// Outgoing message. `target_id` empty means broadcast to `room`;
/// non-empty means private to that identity. Empty strings stand for
/// absent optional fields.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SendMessage {
	#[prost(string, tag = "1")]
	pub room: String,
	#[prost(string, tag = "2")]
	pub target_id: String,
	#[prost(string, tag = "3")]
	pub text: String,
	#[prost(string, tag = "4")]
	pub file_url: String,
	#[prost(string, tag = "5")]
	pub file_name: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct React {
	#[prost(string, tag = "1")]
	pub room: String,
	#[prost(string, tag = "2")]
	pub message_id: String,
	#[prost(string, tag = "3")]
	pub symbol: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MarkRead {
	#[prost(string, tag = "1")]
	pub room: String,
	#[prost(string, tag = "2")]
	pub message_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MarkDelivered {
	#[prost(string, tag = "1")]
	pub room: String,
	#[prost(string, tag = "2")]
	pub message_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SetTyping {
	#[prost(string, tag = "1")]
	pub room: String,
	#[prost(bool, tag = "2")]
	pub is_typing: bool,
}

/// Cursor-paginated history request. An empty `before` asks for the most
/// recent page.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FetchHistory {
	#[prost(string, tag = "1")]
	pub room: String,
	#[prost(string, tag = "2")]
	pub before: String,
	#[prost(uint32, tag = "3")]
	pub limit: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Search {
	#[prost(string, tag = "1")]
	pub query: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ListRooms {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ListMembers {
	#[prost(string, tag = "1")]
	pub room: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SendMessageAck {
	#[prost(string, tag = "1")]
	pub message_id: String,
	#[prost(int64, tag = "2")]
	pub created_at_unix_ms: i64,
}

/// A stored message on the wire.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Message {
	#[prost(string, tag = "1")]
	pub id: String,
	#[prost(string, tag = "2")]
	pub room: String,
	#[prost(string, tag = "3")]
	pub sender_id: String,
	#[prost(string, tag = "4")]
	pub sender_name: String,
	#[prost(string, tag = "5")]
	pub text: String,
	#[prost(string, tag = "6")]
	pub file_url: String,
	#[prost(string, tag = "7")]
	pub file_name: String,
	#[prost(bool, tag = "8")]
	pub is_private: bool,
	#[prost(string, tag = "9")]
	pub target_id: String,
	#[prost(int64, tag = "10")]
	pub created_at_unix_ms: i64,
	#[prost(string, repeated, tag = "11")]
	pub delivered_to: Vec<String>,
	#[prost(string, repeated, tag = "12")]
	pub read_by: Vec<String>,
	#[prost(message, repeated, tag = "13")]
	pub reactions: Vec<ReactionEntry>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReactionEntry {
	#[prost(string, tag = "1")]
	pub symbol: String,
	#[prost(string, repeated, tag = "2")]
	pub identity_ids: Vec<String>,
}

/// Oldest-first window of messages for one room.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HistoryPage {
	#[prost(string, tag = "1")]
	pub room: String,
	#[prost(message, repeated, tag = "2")]
	pub messages: Vec<Message>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SearchResults {
	#[prost(message, repeated, tag = "1")]
	pub messages: Vec<Message>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RoomList {
	#[prost(string, repeated, tag = "1")]
	pub rooms: Vec<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Presence {
	#[prost(string, tag = "1")]
	pub identity_id: String,
	#[prost(string, tag = "2")]
	pub display_name: String,
	#[prost(bool, tag = "3")]
	pub online: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MemberList {
	#[prost(string, tag = "1")]
	pub room: String,
	#[prost(message, repeated, tag = "2")]
	pub members: Vec<Presence>,
}

/// A newly stored message fanned out to recipients (room broadcast or
/// private delivery/echo).
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MessageEvent {
	#[prost(message, optional, tag = "1")]
	pub message: Option<Message>,
}

/// Ephemeral server notice; never persisted to any room log.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SystemNotice {
	#[prost(string, tag = "1")]
	pub room: String,
	#[prost(string, tag = "2")]
	pub text: String,
	#[prost(int64, tag = "3")]
	pub server_time_unix_ms: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TypingEvent {
	#[prost(string, tag = "1")]
	pub room: String,
	#[prost(string, tag = "2")]
	pub identity_id: String,
	#[prost(string, tag = "3")]
	pub display_name: String,
	#[prost(bool, tag = "4")]
	pub is_typing: bool,
}

/// Full identity roster, broadcast on any connect/disconnect.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PresenceRoster {
	#[prost(message, repeated, tag = "1")]
	pub identities: Vec<Presence>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RoomRoster {
	#[prost(string, tag = "1")]
	pub room: String,
	#[prost(message, repeated, tag = "2")]
	pub members: Vec<Presence>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeliveryReceipt {
	#[prost(string, tag = "1")]
	pub room: String,
	#[prost(string, tag = "2")]
	pub message_id: String,
	#[prost(string, tag = "3")]
	pub identity_id: String,
}

/// Full read-by set for a message, re-broadcast after each new read.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReadReceipt {
	#[prost(string, tag = "1")]
	pub room: String,
	#[prost(string, tag = "2")]
	pub message_id: String,
	#[prost(string, repeated, tag = "3")]
	pub read_by: Vec<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReactionUpdate {
	#[prost(string, tag = "1")]
	pub room: String,
	#[prost(string, tag = "2")]
	pub message_id: String,
	#[prost(message, repeated, tag = "3")]
	pub reactions: Vec<ReactionEntry>,
}
