#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use relay_domain::UserId;
use relay_protocol::pb;
use tokio::sync::{Notify, mpsc};

/// Non-owning reference to a session's outbound queue.
///
/// The session holds the only strong `Sender`; once it closes, `upgrade`
/// returns `None` even if the registry entry has not been removed yet.
#[derive(Debug, Clone)]
pub struct OutboundHandle {
	session_id: u64,
	tx: mpsc::WeakSender<pb::Envelope>,
	eviction: Arc<Notify>,
}

impl OutboundHandle {
	pub fn new(session_id: u64, tx: &mpsc::Sender<pb::Envelope>) -> Self {
		Self {
			session_id,
			tx: tx.downgrade(),
			eviction: Arc::new(Notify::new()),
		}
	}

	/// Signal the owning session that it should close. The signal is kept
	/// until the session next waits on it.
	pub fn evict(&self) {
		self.eviction.notify_one();
	}

	/// Shared with the session so it can wait for `evict`.
	pub fn eviction_signal(&self) -> Arc<Notify> {
		self.eviction.clone()
	}

	pub fn session_id(&self) -> u64 {
		self.session_id
	}

	pub fn upgrade(&self) -> Option<mpsc::Sender<pb::Envelope>> {
		self.tx.upgrade()
	}
}

/// At most one outbound handle per user. Last writer wins.
#[derive(Debug, Clone, Default)]
pub struct ConnectionRegistry {
	inner: Arc<RwLock<HashMap<UserId, OutboundHandle>>>,
}

impl ConnectionRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Install `handle` for `user`, returning the handle it replaced.
	///
	/// The replaced session is not closed; it keeps running until its client
	/// goes away, but no longer receives fan-out.
	pub fn register(&self, user: UserId, handle: OutboundHandle) -> Option<OutboundHandle> {
		self.inner.write().insert(user, handle)
	}

	/// Remove the entry for `user` only if it still belongs to `session_id`.
	pub fn deregister(&self, user: &UserId, session_id: u64) -> bool {
		let mut inner = self.inner.write();
		match inner.get(user) {
			Some(current) if current.session_id == session_id => {
				inner.remove(user);
				true
			}
			_ => false,
		}
	}

	pub fn lookup(&self, user: &UserId) -> Option<OutboundHandle> {
		self.inner.read().get(user).cloned()
	}

	/// Number of users with a registered handle.
	pub fn len(&self) -> usize {
		self.inner.read().len()
	}

	pub fn is_empty(&self) -> bool {
		self.inner.read().is_empty()
	}
}
