#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;
use std::collections::BTreeMap;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

/// Stable identifier for a logical chat participant.
///
/// Distinct from any single live connection: an identity survives
/// reconnects, and an offline identity remains a valid private-message
/// target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct IdentityId(String);

impl IdentityId {
	/// Create a non-empty `IdentityId`.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(id))
	}

	/// Synthesize a fresh guest identity.
	pub fn new_guest() -> Self {
		Self(format!("guest-{}", uuid::Uuid::new_v4().simple()))
	}

	pub fn is_guest(&self) -> bool {
		self.0.starts_with("guest-")
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for IdentityId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for IdentityId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		IdentityId::new(s.to_string())
	}
}

/// Named broadcast scope. Rooms are created implicitly on first reference
/// and never deleted.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct RoomName(String);

impl RoomName {
	/// Create a non-empty `RoomName`; surrounding whitespace is stripped.
	pub fn new(name: impl Into<String>) -> Result<Self, ParseIdError> {
		let name = name.into();
		let trimmed = name.trim();
		if trimmed.is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(trimmed.to_string()))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for RoomName {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for RoomName {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		RoomName::new(s.to_string())
	}
}

/// Server-assigned message identifier.
///
/// Timestamp-derived with a same-millisecond sequence tiebreak; the derived
/// `Ord` follows `(unix_ms, seq)`, so ids assigned by one process are
/// strictly monotonic and pagination cursors are well defined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId {
	pub unix_ms: i64,
	pub seq: u32,
}

impl MessageId {
	pub fn new(unix_ms: i64, seq: u32) -> Self {
		Self { unix_ms, seq }
	}
}

impl fmt::Display for MessageId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}-{}", self.unix_ms, self.seq)
	}
}

impl FromStr for MessageId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		let (ms_s, seq_s) = s
			.split_once('-')
			.ok_or_else(|| ParseIdError::InvalidFormat("expected <unix_ms>-<seq>".into()))?;

		let unix_ms: i64 = ms_s
			.parse()
			.map_err(|_| ParseIdError::InvalidFormat(format!("bad millis in message id: {s}")))?;
		let seq: u32 = seq_s
			.parse()
			.map_err(|_| ParseIdError::InvalidFormat(format!("bad seq in message id: {s}")))?;

		Ok(Self { unix_ms, seq })
	}
}

#[cfg(feature = "serde")]
impl Serialize for MessageId {
	fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.collect_str(self)
	}
}

#[cfg(feature = "serde")]
impl<'de> Deserialize<'de> for MessageId {
	fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		let s = String::deserialize(deserializer)?;
		s.parse().map_err(serde::de::Error::custom)
	}
}

/// A logical chat participant as exposed in presence rosters.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Identity {
	#[cfg_attr(feature = "serde", serde(rename = "userId"))]
	pub id: IdentityId,
	#[cfg_attr(feature = "serde", serde(rename = "username"))]
	pub display_name: String,
	pub online: bool,
}

/// Opaque reference to an uploaded attachment. The engine only ever carries
/// the URL handed back by the external store; reachability is not checked.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Attachment {
	pub url: String,
	pub name: String,
}

/// A stored chat message.
///
/// Immutable after creation except for the delivery/read receipt sets
/// (monotone, deduplicated) and the reaction map (toggle semantics).
/// Exactly one of broadcast-to-room / private-to-target holds.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ChatMessage {
	pub id: MessageId,
	pub room: RoomName,
	#[cfg_attr(feature = "serde", serde(rename = "senderId"))]
	pub sender_id: IdentityId,
	#[cfg_attr(feature = "serde", serde(rename = "sender"))]
	pub sender_name: String,
	pub text: Option<String>,
	#[cfg_attr(feature = "serde", serde(rename = "file"))]
	pub attachment: Option<Attachment>,
	#[cfg_attr(feature = "serde", serde(rename = "isPrivate"))]
	pub is_private: bool,
	#[cfg_attr(feature = "serde", serde(rename = "to"))]
	pub target: Option<IdentityId>,
	#[cfg_attr(feature = "serde", serde(rename = "timestamp"))]
	pub created_at_unix_ms: i64,
	#[cfg_attr(feature = "serde", serde(rename = "deliveredTo"))]
	pub delivered_to: Vec<IdentityId>,
	#[cfg_attr(feature = "serde", serde(rename = "readBy"))]
	pub read_by: Vec<IdentityId>,
	pub reactions: BTreeMap<String, Vec<IdentityId>>,
}

impl ChatMessage {
	/// A message addressed to every member of `room`. The id and creation
	/// time are placeholders until the log assigns them on append.
	pub fn broadcast(
		room: RoomName,
		sender_id: IdentityId,
		sender_name: impl Into<String>,
		text: Option<String>,
		attachment: Option<Attachment>,
	) -> Self {
		Self {
			id: MessageId::new(0, 0),
			room,
			sender_id,
			sender_name: sender_name.into(),
			text,
			attachment,
			is_private: false,
			target: None,
			created_at_unix_ms: 0,
			delivered_to: Vec::new(),
			read_by: Vec::new(),
			reactions: BTreeMap::new(),
		}
	}

	/// A message addressed to a single identity.
	pub fn private(
		room: RoomName,
		sender_id: IdentityId,
		sender_name: impl Into<String>,
		target: IdentityId,
		text: Option<String>,
		attachment: Option<Attachment>,
	) -> Self {
		let mut msg = Self::broadcast(room, sender_id, sender_name, text, attachment);
		msg.is_private = true;
		msg.target = Some(target);
		msg
	}

	/// Idempotent delivery receipt. Returns whether state changed.
	pub fn record_delivered(&mut self, identity: &IdentityId) -> bool {
		if self.delivered_to.contains(identity) {
			return false;
		}
		self.delivered_to.push(identity.clone());
		true
	}

	/// Idempotent read receipt. Returns whether state changed.
	pub fn record_read(&mut self, identity: &IdentityId) -> bool {
		if self.read_by.contains(identity) {
			return false;
		}
		self.read_by.push(identity.clone());
		true
	}

	/// Toggle `identity`'s reaction under `symbol`: add if absent, remove if
	/// present. Symbols are opaque; an emptied member list is retained.
	pub fn toggle_reaction(&mut self, symbol: &str, identity: &IdentityId) -> &BTreeMap<String, Vec<IdentityId>> {
		let members = self.reactions.entry(symbol.to_string()).or_default();
		match members.iter().position(|m| m == identity) {
			Some(idx) => {
				members.remove(idx);
			}
			None => members.push(identity.clone()),
		}
		&self.reactions
	}

	/// Case-insensitive substring match against the text or the sender name.
	/// `needle` must already be lowercased.
	pub fn matches(&self, needle: &str) -> bool {
		if let Some(text) = self.text.as_deref()
			&& text.to_lowercase().contains(needle)
		{
			return true;
		}
		self.sender_name.to_lowercase().contains(needle)
	}
}
