#![forbid(unsafe_code)]

use std::collections::HashMap;

use banter_protocol::pb;
use banter_protocol::version::PROTOCOL_VERSION;
use tokio::sync::{Mutex, mpsc};
use tracing::debug;

/// Fan-out hub: one bounded outbound queue per live connection.
///
/// Delivery is best-effort: a full queue drops the event and counts it,
/// and the peer is told how many events it missed once its queue drains
/// (clients resynchronize with a history fetch). Closed queues are pruned
/// as they are encountered.
#[derive(Debug)]
pub struct Hub {
	queue_capacity: usize,
	inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
	peers: HashMap<u64, Peer>,
}

#[derive(Debug)]
struct Peer {
	tx: mpsc::Sender<pb::Envelope>,
	/// Events dropped since the last successful send.
	dropped: u64,
}

impl Hub {
	pub fn new(queue_capacity: usize) -> Self {
		Self {
			queue_capacity,
			inner: Mutex::new(Inner::default()),
		}
	}

	/// Register a connection's outbound queue.
	pub async fn register(&self, conn_id: u64) -> mpsc::Receiver<pb::Envelope> {
		let (tx, rx) = mpsc::channel(self.queue_capacity);
		let mut inner = self.inner.lock().await;
		inner.peers.insert(conn_id, Peer { tx, dropped: 0 });
		rx
	}

	pub async fn unregister(&self, conn_id: u64) {
		let mut inner = self.inner.lock().await;
		inner.peers.remove(&conn_id);
	}

	/// Queue an envelope for one connection.
	pub async fn send_to(&self, conn_id: u64, env: pb::Envelope) {
		let mut inner = self.inner.lock().await;
		inner.push(conn_id, env);
	}

	/// Queue an envelope for each of the given connections.
	pub async fn send_to_many(&self, conns: &[u64], env: pb::Envelope) {
		let mut inner = self.inner.lock().await;
		for conn_id in conns {
			inner.push(*conn_id, env.clone());
		}
	}

	/// Queue an envelope for every registered connection.
	pub async fn broadcast(&self, env: pb::Envelope) {
		let mut inner = self.inner.lock().await;
		let conns: Vec<u64> = inner.peers.keys().copied().collect();
		for conn_id in conns {
			inner.push(conn_id, env.clone());
		}
	}
}

impl Inner {
	fn push(&mut self, conn_id: u64, env: pb::Envelope) {
		let Some(peer) = self.peers.get_mut(&conn_id) else {
			return;
		};

		match peer.tx.try_send(env) {
			Ok(()) => {
				if peer.dropped > 0 && peer.tx.try_send(lag_notice(peer.dropped)).is_ok() {
					peer.dropped = 0;
				}
			}
			Err(mpsc::error::TrySendError::Full(_)) => {
				peer.dropped = peer.dropped.saturating_add(1);
				metrics::counter!("banter_server_events_dropped_total").increment(1);
				debug!(conn_id, dropped = peer.dropped, "outbound queue full; event dropped");
			}
			Err(mpsc::error::TrySendError::Closed(_)) => {
				self.peers.remove(&conn_id);
			}
		}
	}
}

fn lag_notice(dropped: u64) -> pb::Envelope {
	pb::Envelope {
		version: PROTOCOL_VERSION,
		request_id: String::new(),
		msg: Some(pb::envelope::Msg::Error(pb::Error {
			code: "LAGGED".to_string(),
			message: format!("{dropped} events dropped; refetch history to resynchronize"),
			room: String::new(),
		})),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn notice(text: &str) -> pb::Envelope {
		pb::Envelope {
			version: PROTOCOL_VERSION,
			request_id: String::new(),
			msg: Some(pb::envelope::Msg::SystemNotice(pb::SystemNotice {
				room: "global".to_string(),
				text: text.to_string(),
				server_time_unix_ms: 0,
			})),
		}
	}

	#[tokio::test]
	async fn sends_reach_only_registered_peers() {
		let hub = Hub::new(8);
		let mut rx = hub.register(1).await;

		hub.send_to(2, notice("nobody")).await;
		hub.send_to(1, notice("hi")).await;

		assert_eq!(rx.recv().await.unwrap(), notice("hi"));
		assert!(rx.try_recv().is_err());
	}

	#[tokio::test]
	async fn full_queue_drops_and_reports_lag() {
		let hub = Hub::new(2);
		let mut rx = hub.register(1).await;

		hub.send_to(1, notice("first")).await;
		hub.send_to(1, notice("second")).await;
		hub.send_to(1, notice("overflow")).await; // dropped

		assert_eq!(rx.recv().await.unwrap(), notice("first"));
		assert_eq!(rx.recv().await.unwrap(), notice("second"));

		// The next successful send flushes a lag marker behind it.
		hub.send_to(1, notice("third")).await;
		assert_eq!(rx.recv().await.unwrap(), notice("third"));

		let lagged = rx.recv().await.unwrap();
		match lagged.msg {
			Some(pb::envelope::Msg::Error(err)) => {
				assert_eq!(err.code, "LAGGED");
				assert!(err.message.starts_with("1 "));
			}
			other => panic!("expected LAGGED error, got: {other:?}"),
		}
	}

	#[tokio::test]
	async fn closed_receiver_is_pruned() {
		let hub = Hub::new(4);
		let rx = hub.register(1).await;
		drop(rx);

		hub.broadcast(notice("anyone")).await;

		let inner = hub.inner.lock().await;
		assert!(inner.peers.is_empty());
	}
}
