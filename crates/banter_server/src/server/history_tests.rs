#![forbid(unsafe_code)]

use banter_domain::{ChatMessage, IdentityId, MessageId, RoomName};

use crate::server::history::{HistoryConfig, MessageStore};

fn room(name: &str) -> RoomName {
	RoomName::new(name).expect("valid room name")
}

fn ident(name: &str) -> IdentityId {
	IdentityId::new(name).expect("valid identity id")
}

fn draft(room_name: &str, sender: &str, text: &str) -> ChatMessage {
	ChatMessage::broadcast(room(room_name), ident(&format!("{sender}_1")), sender, Some(text.to_string()), None)
}

fn store_with(cfg: HistoryConfig) -> MessageStore {
	MessageStore::new(cfg)
}

fn small_store(capacity: usize) -> MessageStore {
	store_with(HistoryConfig {
		room_capacity: capacity,
		..HistoryConfig::default()
	})
}

async fn fill(store: &MessageStore, room_name: &str, n: usize) -> Vec<MessageId> {
	let mut ids = Vec::with_capacity(n);
	for i in 0..n {
		let stored = store.append(draft(room_name, "alice", &format!("msg-{i}"))).await;
		ids.push(stored.id);
	}
	ids
}

#[tokio::test]
async fn appends_assign_strictly_increasing_ids() {
	let store = small_store(100);
	let ids = fill(&store, "global", 50).await;

	for pair in ids.windows(2) {
		assert!(pair[0] < pair[1], "ids must be strictly increasing: {} vs {}", pair[0], pair[1]);
	}

	let page = store.page(&room("global"), None, Some(100)).await;
	assert_eq!(page.len(), 50);
	for pair in page.windows(2) {
		assert!(pair[0].id < pair[1].id, "log must stay sorted by id");
	}
}

#[tokio::test]
async fn ids_stay_monotonic_across_rooms() {
	let store = small_store(100);
	let mut ids = Vec::new();
	for i in 0..20 {
		let room_name = if i % 2 == 0 { "a" } else { "b" };
		ids.push(store.append(draft(room_name, "alice", "x")).await.id);
	}

	for pair in ids.windows(2) {
		assert!(pair[0] < pair[1]);
	}
}

#[tokio::test]
async fn capacity_evicts_oldest_first() {
	let store = small_store(5);
	let ids = fill(&store, "global", 7).await;

	let page = store.page(&room("global"), None, Some(100)).await;
	assert_eq!(page.len(), 5);
	assert_eq!(page[0].id, ids[2], "two oldest entries must be evicted");
	assert_eq!(page[4].id, ids[6]);
}

#[tokio::test]
async fn full_capacity_scenario_keeps_2000_and_drops_the_first() {
	let store = store_with(HistoryConfig {
		room_capacity: 2000,
		page_limit_max: 4000,
		..HistoryConfig::default()
	});

	let first = store.append(draft("global", "alice", "the very first message")).await;
	fill(&store, "global", 2000).await;

	let page = store.page(&room("global"), None, Some(4000)).await;
	assert_eq!(page.len(), 2000);
	assert!(page.iter().all(|m| m.id != first.id));

	let found = store.search("very first message", 200).await;
	assert!(found.is_empty(), "evicted message must not be searchable");
}

#[tokio::test]
async fn first_message_is_the_whole_page() {
	let store = small_store(100);
	let stored = store.append(draft("global", "a", "hello")).await;

	let page = store.page(&room("global"), None, Some(10)).await;
	assert_eq!(page.len(), 1);
	assert_eq!(page[0].id, stored.id);
	assert_eq!(page[0].text.as_deref(), Some("hello"));
}

#[tokio::test]
async fn page_without_cursor_returns_most_recent_window() {
	let store = small_store(100);
	let ids = fill(&store, "global", 10).await;

	let page = store.page(&room("global"), None, Some(3)).await;
	let got: Vec<MessageId> = page.iter().map(|m| m.id).collect();
	assert_eq!(got, ids[7..].to_vec());
}

#[tokio::test]
async fn page_with_cursor_excludes_it_and_is_contiguous() {
	let store = small_store(100);
	let ids = fill(&store, "global", 10).await;

	let page = store.page(&room("global"), Some(ids[5]), Some(3)).await;
	let got: Vec<MessageId> = page.iter().map(|m| m.id).collect();
	assert_eq!(got, ids[2..5].to_vec());
	assert!(!got.contains(&ids[5]));
}

#[tokio::test]
async fn cursor_at_the_oldest_entry_yields_an_empty_page() {
	let store = small_store(100);
	let ids = fill(&store, "global", 5).await;

	let page = store.page(&room("global"), Some(ids[0]), Some(3)).await;
	assert!(page.is_empty());
}

#[tokio::test]
async fn unknown_cursor_falls_back_to_the_oldest_page() {
	let store = small_store(100);
	let ids = fill(&store, "global", 10).await;

	let evicted = MessageId::new(1, 0);
	let page = store.page(&room("global"), Some(evicted), Some(4)).await;
	let got: Vec<MessageId> = page.iter().map(|m| m.id).collect();
	assert_eq!(got, ids[..4].to_vec());
}

#[tokio::test]
async fn unknown_room_pages_empty() {
	let store = small_store(100);
	assert!(store.page(&room("nowhere"), None, Some(10)).await.is_empty());
}

#[tokio::test]
async fn search_scans_rooms_in_creation_order() {
	let store = small_store(100);
	store.append(draft("alpha", "alice", "needle one")).await;
	store.append(draft("beta", "bob", "needle two")).await;
	store.append(draft("alpha", "alice", "needle three")).await;

	let found = store.search("needle", 200).await;
	let texts: Vec<&str> = found.iter().filter_map(|m| m.text.as_deref()).collect();
	assert_eq!(texts, ["needle one", "needle three", "needle two"]);
}

#[tokio::test]
async fn search_is_case_insensitive_and_matches_sender() {
	let store = small_store(100);
	store.append(draft("global", "Alice", "Hello World")).await;
	store.append(draft("global", "bob", "unrelated")).await;

	assert_eq!(store.search("hello", 200).await.len(), 1);
	assert_eq!(store.search("ALICE", 200).await.len(), 1);
	assert_eq!(store.search("carol", 200).await.len(), 0);
}

#[tokio::test]
async fn search_respects_the_result_cap() {
	let store = small_store(100);
	fill(&store, "global", 30).await;

	assert_eq!(store.search("msg-", 10).await.len(), 10);
}

#[tokio::test]
async fn receipts_on_stale_references_are_silent_no_ops() {
	let store = small_store(100);
	let user = ident("bob_1");
	let ghost = MessageId::new(42, 0);

	assert!(!store.record_delivered(&room("global"), ghost, &user).await);
	assert!(store.record_read(&room("global"), ghost, &user).await.is_none());
	assert!(store.toggle_reaction(&room("global"), ghost, "👍", &user).await.is_none());

	let stored = store.append(draft("global", "alice", "hi")).await;
	assert!(!store.record_delivered(&room("elsewhere"), stored.id, &user).await);
}

#[tokio::test]
async fn read_receipts_change_state_at_most_once() {
	let store = small_store(100);
	let stored = store.append(draft("global", "alice", "hi")).await;
	let bob = ident("bob_1");

	let first = store.record_read(&room("global"), stored.id, &bob).await;
	assert_eq!(first, Some(vec![bob.clone()]));

	let second = store.record_read(&room("global"), stored.id, &bob).await;
	assert!(second.is_none(), "repeat read must not re-broadcast");
}

#[tokio::test]
async fn reaction_toggle_round_trips_through_the_store() {
	let store = small_store(100);
	let stored = store.append(draft("global", "alice", "hi")).await;
	let bob = ident("bob_1");

	let after_add = store.toggle_reaction(&room("global"), stored.id, "🔥", &bob).await.unwrap();
	assert_eq!(after_add.get("🔥").map(Vec::len), Some(1));

	let after_remove = store.toggle_reaction(&room("global"), stored.id, "🔥", &bob).await.unwrap();
	assert_eq!(after_remove.get("🔥").map(Vec::len), Some(0));
}
