#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};

use banter_domain::{Identity, IdentityId, RoomName};
use tokio::sync::RwLock;
use tracing::debug;

/// Identity and room-membership indexes, guarded by a single lock.
///
/// Identity rows are retained after disconnect (`online = false`) so an
/// offline identity remains a valid private-message target. Rooms are
/// created implicitly and never deleted; room order is creation order.
#[derive(Debug, Default)]
pub struct Sessions {
	inner: RwLock<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
	identities: HashMap<IdentityId, IdentityEntry>,
	identity_order: Vec<IdentityId>,

	conn_identity: HashMap<u64, IdentityId>,
	/// Reverse lookup; at most one live connection per identity
	/// (most-recent-connection-wins on reconnect).
	identity_conn: HashMap<IdentityId, u64>,

	rooms: HashMap<RoomName, HashSet<u64>>,
	room_order: Vec<RoomName>,
	conn_rooms: HashMap<u64, HashSet<RoomName>>,
}

#[derive(Debug)]
struct IdentityEntry {
	display_name: String,
	online: bool,
}

/// Result of a `join` call: whether membership actually changed, plus a
/// snapshot of the members that were present before the join.
#[derive(Debug)]
pub struct JoinOutcome {
	pub newly_joined: bool,
	pub prior_members: Vec<u64>,
}

/// Result of a `detach` call.
#[derive(Debug)]
pub struct DetachOutcome {
	pub identity: Identity,
	/// False when the identity had already re-attached on a newer
	/// connection, in which case it stays online.
	pub went_offline: bool,
	pub rooms_left: Vec<RoomName>,
}

/// One atomic view of a room taken at send time: the live member
/// connections and the distinct identities behind them.
#[derive(Debug)]
pub struct DeliverySnapshot {
	pub conns: Vec<u64>,
	pub identities: Vec<IdentityId>,
}

impl Sessions {
	pub fn new(seed_rooms: &[RoomName]) -> Self {
		let mut inner = Inner::default();
		for room in seed_rooms {
			inner.ensure_room(room);
		}
		Self {
			inner: RwLock::new(inner),
		}
	}

	/// Bind a connection to an identity and mark it online. A repeated
	/// attach for the same identity overwrites the reverse mapping.
	pub async fn attach(&self, conn_id: u64, identity: &IdentityId, display_name: &str) {
		let mut inner = self.inner.write().await;

		if !inner.identities.contains_key(identity) {
			inner.identity_order.push(identity.clone());
		}
		inner.identities.insert(
			identity.clone(),
			IdentityEntry {
				display_name: display_name.to_string(),
				online: true,
			},
		);

		inner.conn_identity.insert(conn_id, identity.clone());
		if let Some(prev) = inner.identity_conn.insert(identity.clone(), conn_id)
			&& prev != conn_id
		{
			debug!(identity = %identity, prev_conn = prev, conn_id, "identity re-attached; previous connection superseded");
		}
	}

	/// Unbind a connection: drop its memberships, and mark the identity
	/// offline unless a newer connection took it over.
	pub async fn detach(&self, conn_id: u64) -> Option<DetachOutcome> {
		let mut inner = self.inner.write().await;

		let identity = inner.conn_identity.remove(&conn_id)?;

		let rooms_left: Vec<RoomName> = inner.conn_rooms.remove(&conn_id).map(Vec::from_iter).unwrap_or_default();
		for room in &rooms_left {
			if let Some(members) = inner.rooms.get_mut(room) {
				members.remove(&conn_id);
			}
		}

		let went_offline = inner.identity_conn.get(&identity) == Some(&conn_id);
		if went_offline {
			inner.identity_conn.remove(&identity);
			if let Some(entry) = inner.identities.get_mut(&identity) {
				entry.online = false;
			}
		}

		let entry = inner.identities.get(&identity)?;
		Some(DetachOutcome {
			identity: Identity {
				id: identity.clone(),
				display_name: entry.display_name.clone(),
				online: entry.online,
			},
			went_offline,
			rooms_left,
		})
	}

	/// Idempotent implicit room creation. Returns whether the room is new.
	pub async fn ensure_room(&self, room: &RoomName) -> bool {
		self.inner.write().await.ensure_room(room)
	}

	/// Add a connection to a room (creating it on first reference) and
	/// snapshot the members that were present before.
	pub async fn join(&self, conn_id: u64, room: &RoomName) -> JoinOutcome {
		let mut inner = self.inner.write().await;

		inner.ensure_room(room);
		let members = inner.rooms.entry(room.clone()).or_default();
		let prior_members: Vec<u64> = members.iter().copied().collect();
		let newly_joined = members.insert(conn_id);

		if newly_joined {
			inner.conn_rooms.entry(conn_id).or_default().insert(room.clone());
		}

		JoinOutcome {
			newly_joined,
			prior_members,
		}
	}

	/// Remove a connection from a room; not an error if absent.
	pub async fn leave(&self, conn_id: u64, room: &RoomName) -> bool {
		let mut inner = self.inner.write().await;

		let was_member = inner.rooms.get_mut(room).map(|m| m.remove(&conn_id)).unwrap_or(false);
		if was_member && let Some(rooms) = inner.conn_rooms.get_mut(&conn_id) {
			rooms.remove(room);
		}
		was_member
	}

	/// Member connection ids of a room.
	pub async fn members_of(&self, room: &RoomName) -> Vec<u64> {
		let inner = self.inner.read().await;
		inner.rooms.get(room).map(|m| m.iter().copied().collect()).unwrap_or_default()
	}

	/// One atomic snapshot of a room's live connections and the distinct
	/// identities behind them, used to seed `delivered_to` on a broadcast.
	pub async fn delivery_snapshot(&self, room: &RoomName) -> DeliverySnapshot {
		let inner = self.inner.read().await;

		let Some(members) = inner.rooms.get(room) else {
			return DeliverySnapshot {
				conns: Vec::new(),
				identities: Vec::new(),
			};
		};

		let mut conns = Vec::with_capacity(members.len());
		let mut identities = Vec::new();
		let mut seen = HashSet::new();

		for conn in members {
			conns.push(*conn);
			if let Some(identity) = inner.conn_identity.get(conn)
				&& seen.insert(identity.clone())
			{
				identities.push(identity.clone());
			}
		}

		DeliverySnapshot { conns, identities }
	}

	/// Presence rows for the members of a room.
	pub async fn member_presences(&self, room: &RoomName) -> Vec<Identity> {
		let inner = self.inner.read().await;

		let Some(members) = inner.rooms.get(room) else {
			return Vec::new();
		};

		let mut seen = HashSet::new();
		let mut out = Vec::new();
		for conn in members {
			let Some(identity) = inner.conn_identity.get(conn) else {
				continue;
			};
			if !seen.insert(identity.clone()) {
				continue;
			}
			if let Some(entry) = inner.identities.get(identity) {
				out.push(Identity {
					id: identity.clone(),
					display_name: entry.display_name.clone(),
					online: entry.online,
				});
			}
		}
		out
	}

	/// All known identities in first-seen order, online or not.
	pub async fn roster(&self) -> Vec<Identity> {
		let inner = self.inner.read().await;
		inner
			.identity_order
			.iter()
			.filter_map(|id| {
				inner.identities.get(id).map(|entry| Identity {
					id: id.clone(),
					display_name: entry.display_name.clone(),
					online: entry.online,
				})
			})
			.collect()
	}

	/// Room names in creation order.
	pub async fn rooms(&self) -> Vec<RoomName> {
		self.inner.read().await.room_order.clone()
	}

	/// The live connection currently bound to an identity, if any.
	pub async fn conn_for(&self, identity: &IdentityId) -> Option<u64> {
		self.inner.read().await.identity_conn.get(identity).copied()
	}

	/// The identity bound to a connection.
	pub async fn identity_for_conn(&self, conn_id: u64) -> Option<Identity> {
		let inner = self.inner.read().await;
		let identity = inner.conn_identity.get(&conn_id)?;
		let entry = inner.identities.get(identity)?;
		Some(Identity {
			id: identity.clone(),
			display_name: entry.display_name.clone(),
			online: entry.online,
		})
	}
}

impl Inner {
	fn ensure_room(&mut self, room: &RoomName) -> bool {
		if self.rooms.contains_key(room) {
			return false;
		}
		self.rooms.insert(room.clone(), HashSet::new());
		self.room_order.push(room.clone());
		true
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn room(name: &str) -> RoomName {
		RoomName::new(name).unwrap()
	}

	fn ident(name: &str) -> IdentityId {
		IdentityId::new(name).unwrap()
	}

	fn seeded() -> Sessions {
		Sessions::new(&[room("global"), room("general"), room("random")])
	}

	#[tokio::test]
	async fn seeded_rooms_keep_creation_order() {
		let sessions = seeded();
		let names: Vec<String> = sessions.rooms().await.into_iter().map(RoomName::into_string).collect();
		assert_eq!(names, ["global", "general", "random"]);

		sessions.ensure_room(&room("late")).await;
		assert!(!sessions.ensure_room(&room("late")).await);
		assert_eq!(sessions.rooms().await.len(), 4);
	}

	#[tokio::test]
	async fn join_reports_prior_members_only() {
		let sessions = seeded();
		sessions.attach(1, &ident("a"), "A").await;
		sessions.attach(2, &ident("b"), "B").await;

		let first = sessions.join(1, &room("dev")).await;
		assert!(first.newly_joined);
		assert!(first.prior_members.is_empty());

		let second = sessions.join(2, &room("dev")).await;
		assert!(second.newly_joined);
		assert_eq!(second.prior_members, vec![1]);

		let rejoin = sessions.join(2, &room("dev")).await;
		assert!(!rejoin.newly_joined);
	}

	#[tokio::test]
	async fn leave_is_a_no_op_when_absent() {
		let sessions = seeded();
		sessions.attach(1, &ident("a"), "A").await;
		assert!(!sessions.leave(1, &room("dev")).await);

		sessions.join(1, &room("dev")).await;
		assert!(sessions.leave(1, &room("dev")).await);
		assert!(!sessions.leave(1, &room("dev")).await);
	}

	#[tokio::test]
	async fn reconnect_overwrites_reverse_lookup() {
		let sessions = seeded();
		let alice = ident("alice_1");

		sessions.attach(1, &alice, "alice").await;
		assert_eq!(sessions.conn_for(&alice).await, Some(1));

		sessions.attach(2, &alice, "alice").await;
		assert_eq!(sessions.conn_for(&alice).await, Some(2));

		// Stale connection going away must not mark the identity offline.
		let outcome = sessions.detach(1).await.unwrap();
		assert!(!outcome.went_offline);
		assert_eq!(sessions.conn_for(&alice).await, Some(2));

		let outcome = sessions.detach(2).await.unwrap();
		assert!(outcome.went_offline);
		assert_eq!(sessions.conn_for(&alice).await, None);
	}

	#[tokio::test]
	async fn detach_retains_identity_row_and_clears_memberships() {
		let sessions = seeded();
		let alice = ident("alice_1");
		sessions.attach(1, &alice, "alice").await;
		sessions.join(1, &room("global")).await;
		sessions.join(1, &room("dev")).await;

		let outcome = sessions.detach(1).await.unwrap();
		assert!(outcome.went_offline);
		assert_eq!(outcome.rooms_left.len(), 2);
		assert!(sessions.members_of(&room("global")).await.is_empty());

		let roster = sessions.roster().await;
		assert_eq!(roster.len(), 1);
		assert!(!roster[0].online);
	}

	#[tokio::test]
	async fn delivery_snapshot_dedups_identities() {
		let sessions = seeded();
		let alice = ident("alice_1");

		// Two connections for one identity can coexist in a room while the
		// older one drains; the snapshot must not double-count the identity.
		sessions.attach(1, &alice, "alice").await;
		sessions.join(1, &room("global")).await;
		sessions.attach(2, &alice, "alice").await;
		sessions.join(2, &room("global")).await;

		let snap = sessions.delivery_snapshot(&room("global")).await;
		assert_eq!(snap.conns.len(), 2);
		assert_eq!(snap.identities, vec![alice]);
	}
}
