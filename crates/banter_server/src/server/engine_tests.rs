#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use banter_protocol::pb;
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::server::auth::{AuthClaims, VerifiedIdentity, mint_token};
use crate::server::engine::{Engine, EngineConfig, EngineError};
use crate::server::secret::SecretString;

const TEST_SECRET: &str = "engine-test-secret";

fn test_engine() -> Arc<Engine> {
	Arc::new(Engine::new(
		EngineConfig {
			peer_queue_capacity: 256,
			..EngineConfig::default()
		},
		SecretString::new(TEST_SECRET),
	))
}

fn token_for(name: &str) -> String {
	let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs();
	mint_token(
		&AuthClaims {
			sub: format!("{name}_1700000000000"),
			name: name.to_string(),
			exp: now + 3600,
		},
		TEST_SECRET,
	)
	.expect("mint test token")
}

async fn attach_user(engine: &Arc<Engine>, conn_id: u64, name: &str) -> (VerifiedIdentity, mpsc::Receiver<pb::Envelope>) {
	let who = engine.authenticate(&token_for(name)).await;
	let rx = engine.attach(conn_id, &who).await;
	(who, rx)
}

/// Receive envelopes until one matches, panicking on timeout.
async fn recv_matching(
	rx: &mut mpsc::Receiver<pb::Envelope>,
	pred: impl Fn(&pb::envelope::Msg) -> bool,
) -> pb::envelope::Msg {
	loop {
		let env = timeout(Duration::from_millis(500), rx.recv())
			.await
			.expect("timed out waiting for event")
			.expect("channel open");
		if let Some(msg) = env.msg
			&& pred(&msg)
		{
			return msg;
		}
	}
}

/// Count events matching `pred` until the sentinel broadcast text shows up.
async fn count_until_sentinel(
	rx: &mut mpsc::Receiver<pb::Envelope>,
	sentinel: &str,
	pred: impl Fn(&pb::envelope::Msg) -> bool,
) -> usize {
	let mut count = 0;
	loop {
		let env = timeout(Duration::from_millis(500), rx.recv())
			.await
			.expect("timed out waiting for sentinel")
			.expect("channel open");
		let Some(msg) = env.msg else { continue };

		if let pb::envelope::Msg::MessageEvent(ref ev) = msg
			&& ev.message.as_ref().map(|m| m.text.as_str()) == Some(sentinel)
		{
			return count;
		}
		if pred(&msg) {
			count += 1;
		}
	}
}

fn is_message_event(msg: &pb::envelope::Msg) -> bool {
	matches!(msg, pb::envelope::Msg::MessageEvent(_))
}

#[tokio::test]
async fn invalid_or_absent_tokens_degrade_to_guests() {
	let engine = test_engine();

	let anon = engine.authenticate("").await;
	let bogus = engine.authenticate("not.a.token").await;

	assert!(anon.id.is_guest());
	assert!(bogus.id.is_guest());
	assert_ne!(anon.id, bogus.id);
	assert!(anon.display_name.starts_with("Guest_"));
}

#[tokio::test]
async fn minted_tokens_resolve_to_their_identity() {
	let engine = test_engine();

	let who = engine.authenticate(&token_for("alice")).await;
	assert_eq!(who.id.as_str(), "alice_1700000000000");
	assert_eq!(who.display_name, "alice");
	assert!(!who.id.is_guest());
}

#[tokio::test]
async fn login_validates_and_mints_verifiable_tokens() {
	let engine = test_engine();

	assert_eq!(engine.login("").await.unwrap_err(), EngineError::EmptyUsername);
	assert_eq!(engine.login("   ").await.unwrap_err(), EngineError::EmptyUsername);

	let grant = engine.login("Ada Lovelace").await.unwrap();
	assert!(grant.user_id.starts_with("Ada_Lovelace_"));
	assert_eq!(grant.username, "Ada Lovelace");

	let who = engine.authenticate(&grant.token).await;
	assert_eq!(who.id.as_str(), grant.user_id);
	assert_eq!(who.display_name, "Ada Lovelace");
}

#[tokio::test]
async fn broadcast_reaches_the_room_and_seeds_delivery() {
	let engine = test_engine();
	let (alice, _rx_a) = attach_user(&engine, 1, "alice").await;
	let (bob, mut rx_b) = attach_user(&engine, 2, "bob").await;

	let stored = engine.send_message(1, "global", "", "hello", None).await.unwrap();

	assert!(!stored.is_private);
	assert!(stored.delivered_to.contains(&alice.id));
	assert!(stored.delivered_to.contains(&bob.id));

	let msg = recv_matching(&mut rx_b, is_message_event).await;
	let pb::envelope::Msg::MessageEvent(ev) = msg else { unreachable!() };
	let wire = ev.message.unwrap();
	assert_eq!(wire.text, "hello");
	assert_eq!(wire.sender_id, alice.id.as_str());
	assert_eq!(wire.id, stored.id.to_string());
}

#[tokio::test]
async fn private_message_reaches_target_and_echoes_sender() {
	let engine = test_engine();
	let (_alice, mut rx_a) = attach_user(&engine, 1, "alice").await;
	let (bob, mut rx_b) = attach_user(&engine, 2, "bob").await;

	let stored = engine.send_message(1, "global", bob.id.as_str(), "psst", None).await.unwrap();

	assert!(stored.is_private);
	assert_eq!(stored.delivered_to, vec![bob.id.clone()]);

	for rx in [&mut rx_a, &mut rx_b] {
		let msg = recv_matching(rx, is_message_event).await;
		let pb::envelope::Msg::MessageEvent(ev) = msg else { unreachable!() };
		let wire = ev.message.unwrap();
		assert!(wire.is_private);
		assert_eq!(wire.text, "psst");
	}
}

#[tokio::test]
async fn private_message_to_offline_target_is_stored_and_echoed_only() {
	let engine = test_engine();
	let (_alice, mut rx_a) = attach_user(&engine, 1, "alice").await;
	let (_bob, mut rx_b) = attach_user(&engine, 2, "bob").await;

	let stored = engine
		.send_message(1, "global", "carol_1700000000000", "anyone there?", None)
		.await
		.unwrap();

	assert!(stored.is_private);
	assert!(stored.delivered_to.is_empty(), "offline target must not be marked delivered");

	// Sender still sees the echo in order.
	let msg = recv_matching(&mut rx_a, is_message_event).await;
	let pb::envelope::Msg::MessageEvent(ev) = msg else { unreachable!() };
	assert!(ev.message.unwrap().is_private);

	// A bystander in the room sees nothing until the sentinel broadcast.
	engine.send_message(1, "global", "", "sentinel", None).await.unwrap();
	let leaked = count_until_sentinel(&mut rx_b, "sentinel", is_message_event).await;
	assert_eq!(leaked, 0, "private message leaked to a non-target connection");
}

#[tokio::test]
async fn read_receipts_broadcast_at_most_once_per_reader() {
	let engine = test_engine();
	let (_alice, mut rx_a) = attach_user(&engine, 1, "alice").await;
	let (bob, _rx_b) = attach_user(&engine, 2, "bob").await;

	let stored = engine.send_message(1, "global", "", "read me", None).await.unwrap();
	let id = stored.id.to_string();

	engine.mark_read(2, "global", &id).await;
	engine.mark_read(2, "global", &id).await;

	engine.send_message(1, "global", "", "sentinel", None).await.unwrap();
	let receipts = count_until_sentinel(&mut rx_a, "sentinel", |msg| {
		matches!(msg, pb::envelope::Msg::ReadReceipt(r) if r.message_id == id && r.read_by == vec![bob.id.as_str().to_string()])
	})
	.await;

	assert_eq!(receipts, 1);
}

#[tokio::test]
async fn delivery_receipts_are_idempotent_and_stale_tolerant() {
	let engine = test_engine();
	let (_alice, mut rx_a) = attach_user(&engine, 1, "alice").await;
	let (_bob, _rx_b) = attach_user(&engine, 2, "bob").await;

	let stored = engine.send_message(1, "global", "", "deliver me", None).await.unwrap();
	let id = stored.id.to_string();

	// Bob was in the delivery snapshot already, so this is a repeat.
	engine.mark_delivered(2, "global", &id).await;
	// Stale and malformed references are silently dropped.
	engine.mark_delivered(2, "global", "99-0").await;
	engine.mark_delivered(2, "global", "not-an-id").await;
	engine.mark_delivered(2, "nowhere", &id).await;

	engine.send_message(1, "global", "", "sentinel", None).await.unwrap();
	let receipts = count_until_sentinel(&mut rx_a, "sentinel", |msg| {
		matches!(msg, pb::envelope::Msg::DeliveryReceipt(_))
	})
	.await;

	assert_eq!(receipts, 0);
}

#[tokio::test]
async fn reaction_toggle_round_trips_and_broadcasts() {
	let engine = test_engine();
	let (_alice, mut rx_a) = attach_user(&engine, 1, "alice").await;
	let (bob, _rx_b) = attach_user(&engine, 2, "bob").await;

	let stored = engine.send_message(1, "global", "", "react to me", None).await.unwrap();
	let id = stored.id.to_string();

	engine.toggle_reaction(2, "global", &id, "👍").await;
	let msg = recv_matching(&mut rx_a, |m| matches!(m, pb::envelope::Msg::ReactionUpdate(_))).await;
	let pb::envelope::Msg::ReactionUpdate(update) = msg else { unreachable!() };
	assert_eq!(update.reactions.len(), 1);
	assert_eq!(update.reactions[0].symbol, "👍");
	assert_eq!(update.reactions[0].identity_ids, vec![bob.id.as_str().to_string()]);

	engine.toggle_reaction(2, "global", &id, "👍").await;
	let msg = recv_matching(&mut rx_a, |m| matches!(m, pb::envelope::Msg::ReactionUpdate(_))).await;
	let pb::envelope::Msg::ReactionUpdate(update) = msg else { unreachable!() };
	assert_eq!(update.reactions[0].symbol, "👍");
	assert!(update.reactions[0].identity_ids.is_empty(), "second toggle must un-react");
}

#[tokio::test]
async fn typing_signal_skips_the_typist() {
	let engine = test_engine();
	let (alice, mut rx_a) = attach_user(&engine, 1, "alice").await;
	let (_bob, mut rx_b) = attach_user(&engine, 2, "bob").await;

	engine.set_typing(1, "global", true).await;

	let msg = recv_matching(&mut rx_b, |m| matches!(m, pb::envelope::Msg::TypingEvent(_))).await;
	let pb::envelope::Msg::TypingEvent(ev) = msg else { unreachable!() };
	assert_eq!(ev.identity_id, alice.id.as_str());
	assert!(ev.is_typing);

	engine.send_message(2, "global", "", "sentinel", None).await.unwrap();
	let seen = count_until_sentinel(&mut rx_a, "sentinel", |m| matches!(m, pb::envelope::Msg::TypingEvent(_))).await;
	assert_eq!(seen, 0, "typist must not receive their own typing signal");
}

#[tokio::test]
async fn system_notices_are_never_persisted() {
	let engine = test_engine();
	let (_alice, _rx_a) = attach_user(&engine, 1, "alice").await;
	let (_bob, _rx_b) = attach_user(&engine, 2, "bob").await;

	engine.join_room(1, "dev").await.unwrap();
	engine.join_room(2, "dev").await.unwrap();
	engine.leave_room(2, "dev").await.unwrap();

	assert!(engine.search("joined").await.is_empty());
	assert!(engine.search("left").await.is_empty());

	let (_, page) = engine.fetch_history("global", "", Some(50)).await.unwrap();
	assert!(page.is_empty());
}

#[tokio::test]
async fn join_notifies_prior_members_only() {
	let engine = test_engine();
	let (_alice, mut rx_a) = attach_user(&engine, 1, "alice").await;
	let (_bob, mut rx_b) = attach_user(&engine, 2, "bob").await;

	engine.join_room(1, "dev").await.unwrap();

	let members = engine.join_room(2, "dev").await.unwrap();
	assert_eq!(members.len(), 2);

	let msg = recv_matching(&mut rx_a, |m| {
		matches!(m, pb::envelope::Msg::SystemNotice(n) if n.text == "bob joined dev")
	})
	.await;
	assert!(matches!(msg, pb::envelope::Msg::SystemNotice(_)));

	engine.send_message(1, "dev", "", "sentinel", None).await.unwrap();
	let own_join_notices = count_until_sentinel(&mut rx_b, "sentinel", |m| {
		matches!(m, pb::envelope::Msg::SystemNotice(n) if n.text == "bob joined dev")
	})
	.await;
	assert_eq!(own_join_notices, 0, "the joiner must not be told about their own join");
}

#[tokio::test]
async fn rejoining_a_room_is_quiet() {
	let engine = test_engine();
	let (_alice, mut rx_a) = attach_user(&engine, 1, "alice").await;
	let (_bob, _rx_b) = attach_user(&engine, 2, "bob").await;

	engine.join_room(1, "dev").await.unwrap();
	engine.join_room(2, "dev").await.unwrap();
	engine.join_room(2, "dev").await.unwrap();

	engine.send_message(2, "dev", "", "sentinel", None).await.unwrap();
	let notices = count_until_sentinel(&mut rx_a, "sentinel", |m| {
		matches!(m, pb::envelope::Msg::SystemNotice(n) if n.text == "bob joined dev")
	})
	.await;
	assert_eq!(notices, 1);
}

#[tokio::test]
async fn disconnect_updates_presence_and_announces_departure() {
	let engine = test_engine();
	let (_alice, mut rx_a) = attach_user(&engine, 1, "alice").await;
	let (bob, _rx_b) = attach_user(&engine, 2, "bob").await;

	engine.detach(2).await;

	let msg = recv_matching(&mut rx_a, |m| {
		matches!(m, pb::envelope::Msg::PresenceRoster(r)
			if r.identities.iter().any(|p| p.identity_id == bob.id.as_str() && !p.online))
	})
	.await;
	assert!(matches!(msg, pb::envelope::Msg::PresenceRoster(_)));

	recv_matching(&mut rx_a, |m| {
		matches!(m, pb::envelope::Msg::SystemNotice(n) if n.text == "bob left")
	})
	.await;

	let roster = engine.roster().await;
	let bob_row = roster.iter().find(|p| p.id == bob.id).expect("identity row retained");
	assert!(!bob_row.online);
}

#[tokio::test]
async fn reconnect_is_last_writer_wins() {
	let engine = test_engine();
	let (alice, _rx_old) = attach_user(&engine, 1, "alice").await;
	let (_alice2, _rx_new) = attach_user(&engine, 2, "alice").await;

	// The stale connection going away must not mark alice offline.
	engine.detach(1).await;

	let roster = engine.roster().await;
	let row = roster.iter().find(|p| p.id == alice.id).unwrap();
	assert!(row.online);

	// A private message to alice lands on the new connection.
	let (_bob, _rx_b) = attach_user(&engine, 3, "bob").await;
	let stored = engine.send_message(3, "global", alice.id.as_str(), "hi", None).await.unwrap();
	assert_eq!(stored.delivered_to, vec![alice.id.clone()]);
}

#[tokio::test]
async fn send_message_requires_content() {
	let engine = test_engine();
	let (_alice, _rx_a) = attach_user(&engine, 1, "alice").await;

	let err = engine.send_message(1, "global", "", "", None).await.unwrap_err();
	assert_eq!(err, EngineError::EmptyMessage);

	// An attachment alone is enough.
	let attachment = banter_domain::Attachment {
		url: "/uploads/1700000000000-notes.pdf".to_string(),
		name: "notes.pdf".to_string(),
	};
	let stored = engine.send_message(1, "global", "", "", Some(attachment)).await.unwrap();
	assert!(stored.text.is_none());
	assert!(stored.attachment.is_some());
}

#[tokio::test]
async fn malformed_history_cursor_is_a_validation_error() {
	let engine = test_engine();
	let err = engine.fetch_history("global", "garbage", Some(10)).await.unwrap_err();
	assert!(matches!(err, EngineError::BadCursor(_)));
}

#[tokio::test]
async fn roomless_requests_default_to_the_system_room() {
	let engine = test_engine();
	let (_alice, _rx_a) = attach_user(&engine, 1, "alice").await;

	let stored = engine.send_message(1, "", "", "hello", None).await.unwrap();
	assert_eq!(stored.room.as_str(), "global");

	let (room, page) = engine.fetch_history("", "", Some(10)).await.unwrap();
	assert_eq!(room.as_str(), "global");
	assert_eq!(page.len(), 1);
}
