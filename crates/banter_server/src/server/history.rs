#![forbid(unsafe_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use banter_domain::{ChatMessage, IdentityId, MessageId, RoomName};
use tokio::sync::Mutex;

use crate::util::time::unix_ms_now;

/// Tunables for the message log.
#[derive(Debug, Clone)]
pub struct HistoryConfig {
	/// Maximum retained messages per room; the oldest entry is evicted
	/// first once exceeded.
	pub room_capacity: usize,
	pub page_limit_max: usize,
	pub page_limit_default: usize,
	pub search_limit_max: usize,
}

impl Default for HistoryConfig {
	fn default() -> Self {
		Self {
			room_capacity: 2000,
			page_limit_max: 100,
			page_limit_default: 20,
			search_limit_max: 200,
		}
	}
}

/// Per-room bounded, ordered, append-only message store.
///
/// Ids are assigned under a dedicated clock lock, so they are strictly
/// monotonic process-wide even when two rooms append in the same
/// millisecond; each room's log has its own lock, so appends to distinct
/// rooms do not contend.
pub struct MessageStore {
	cfg: HistoryConfig,
	clock: Mutex<IdClock>,
	rooms: Mutex<RoomIndex>,
}

#[derive(Debug, Default)]
struct IdClock {
	last_ms: i64,
	seq: u32,
}

impl IdClock {
	/// Next id for `now_ms`. A clock that stands still (or steps backwards)
	/// keeps the previous millisecond and bumps the tiebreak sequence.
	fn next(&mut self, now_ms: i64) -> MessageId {
		if now_ms > self.last_ms {
			self.last_ms = now_ms;
			self.seq = 0;
		} else {
			self.seq += 1;
		}
		MessageId::new(self.last_ms, self.seq)
	}
}

#[derive(Default)]
struct RoomIndex {
	logs: HashMap<RoomName, Arc<Mutex<RoomLog>>>,
	/// Rooms in the order their logs were created; search scans in this
	/// order.
	order: Vec<RoomName>,
}

#[derive(Default)]
struct RoomLog {
	entries: VecDeque<ChatMessage>,
}

impl MessageStore {
	pub fn new(cfg: HistoryConfig) -> Self {
		Self {
			cfg,
			clock: Mutex::new(IdClock::default()),
			rooms: Mutex::new(RoomIndex::default()),
		}
	}

	async fn log_for_append(&self, room: &RoomName) -> Arc<Mutex<RoomLog>> {
		let mut rooms = self.rooms.lock().await;
		match rooms.logs.get(room) {
			Some(log) => Arc::clone(log),
			None => {
				let log = Arc::new(Mutex::new(RoomLog::default()));
				rooms.logs.insert(room.clone(), Arc::clone(&log));
				rooms.order.push(room.clone());
				log
			}
		}
	}

	async fn existing_log(&self, room: &RoomName) -> Option<Arc<Mutex<RoomLog>>> {
		self.rooms.lock().await.logs.get(room).map(Arc::clone)
	}

	/// Assign id and creation time, append to the room's log, evict the
	/// oldest entry beyond capacity, and return the stored message.
	pub async fn append(&self, mut msg: ChatMessage) -> ChatMessage {
		let id = {
			let mut clock = self.clock.lock().await;
			clock.next(unix_ms_now())
		};
		msg.id = id;
		msg.created_at_unix_ms = id.unix_ms;

		let log = self.log_for_append(&msg.room).await;
		let mut log = log.lock().await;
		log.entries.push_back(msg.clone());
		while log.entries.len() > self.cfg.room_capacity {
			log.entries.pop_front();
		}

		metrics::counter!("banter_server_messages_total").increment(1);
		msg
	}

	/// Cursor-paginated history, oldest-first.
	///
	/// No cursor: the most recent `limit` entries. Cursor found: the
	/// `limit` entries immediately preceding it, never including it.
	/// Cursor unknown (evicted or never existed): the oldest retained
	/// page.
	pub async fn page(&self, room: &RoomName, before: Option<MessageId>, limit: Option<usize>) -> Vec<ChatMessage> {
		let limit = limit
			.filter(|l| *l > 0)
			.unwrap_or(self.cfg.page_limit_default)
			.min(self.cfg.page_limit_max);

		let Some(log) = self.existing_log(room).await else {
			return Vec::new();
		};
		let log = log.lock().await;

		let (start, end) = match before {
			None => (log.entries.len().saturating_sub(limit), log.entries.len()),
			Some(cursor) => match log.entries.iter().position(|m| m.id == cursor) {
				Some(idx) => (idx.saturating_sub(limit), idx),
				None => {
					metrics::counter!("banter_server_stale_references_total").increment(1);
					(0, limit.min(log.entries.len()))
				}
			},
		};

		log.entries.iter().skip(start).take(end - start).cloned().collect()
	}

	/// Case-insensitive substring search over text and sender names across
	/// every room, in room-creation then chronological order.
	pub async fn search(&self, query: &str, limit: usize) -> Vec<ChatMessage> {
		let needle = query.to_lowercase();

		let logs: Vec<Arc<Mutex<RoomLog>>> = {
			let rooms = self.rooms.lock().await;
			rooms.order.iter().filter_map(|room| rooms.logs.get(room).map(Arc::clone)).collect()
		};

		let mut out = Vec::new();
		for log in logs {
			let log = log.lock().await;
			for msg in &log.entries {
				if msg.matches(&needle) {
					out.push(msg.clone());
					if out.len() >= limit {
						return out;
					}
				}
			}
		}
		out
	}

	/// Idempotent delivery receipt. Returns whether state changed; an
	/// unknown room or message id is a silent no-op.
	pub async fn record_delivered(&self, room: &RoomName, id: MessageId, identity: &IdentityId) -> bool {
		self.with_message(room, id, |msg| msg.record_delivered(identity)).await.unwrap_or(false)
	}

	/// Idempotent read receipt. Returns the updated read-by set only when
	/// state changed, so callers broadcast at most once per reader.
	pub async fn record_read(&self, room: &RoomName, id: MessageId, identity: &IdentityId) -> Option<Vec<IdentityId>> {
		self.with_message(room, id, |msg| {
			if msg.record_read(identity) {
				Some(msg.read_by.clone())
			} else {
				None
			}
		})
		.await
		.flatten()
	}

	/// Toggle a reaction and return the updated reaction map, or `None`
	/// for a stale reference.
	pub async fn toggle_reaction(
		&self,
		room: &RoomName,
		id: MessageId,
		symbol: &str,
		identity: &IdentityId,
	) -> Option<std::collections::BTreeMap<String, Vec<IdentityId>>> {
		self.with_message(room, id, |msg| msg.toggle_reaction(symbol, identity).clone()).await
	}

	/// Run `f` against one stored message; `None` (plus the stale-reference
	/// counter) when the room or message is gone.
	async fn with_message<T>(&self, room: &RoomName, id: MessageId, f: impl FnOnce(&mut ChatMessage) -> T) -> Option<T> {
		let Some(log) = self.existing_log(room).await else {
			metrics::counter!("banter_server_stale_references_total").increment(1);
			return None;
		};

		let mut log = log.lock().await;
		match log.entries.iter_mut().find(|m| m.id == id) {
			Some(msg) => Some(f(msg)),
			None => {
				metrics::counter!("banter_server_stale_references_total").increment(1);
				None
			}
		}
	}
}
