#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;

use parking_lot::RwLock;
use relay_domain::{RoomId, UserId};

/// Who is online in which room.
///
/// A cache populated from the room directory at session start, not the
/// source of truth for membership. Sessions are counted per `(room, user)`
/// so a user stays listed while any of their sessions is still joined.
#[derive(Debug, Clone, Default)]
pub struct MembershipIndex {
	inner: Arc<RwLock<HashMap<RoomId, HashMap<UserId, u32>>>>,
}

impl MembershipIndex {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn join(&self, room: &RoomId, user: &UserId) {
		let mut inner = self.inner.write();
		*inner
			.entry(room.clone())
			.or_default()
			.entry(user.clone())
			.or_insert(0) += 1;
	}

	/// Drop one session of `user` from `room`. Returns true when the user is
	/// no longer listed under the room.
	pub fn leave(&self, room: &RoomId, user: &UserId) -> bool {
		let mut inner = self.inner.write();
		let Entry::Occupied(mut members) = inner.entry(room.clone()) else {
			return true;
		};

		let counts = members.get_mut();
		let gone = match counts.get(user).copied() {
			Some(n) if n > 1 => {
				counts.insert(user.clone(), n - 1);
				false
			}
			Some(_) => {
				counts.remove(user);
				true
			}
			None => true,
		};

		if members.get().is_empty() {
			members.remove();
		}
		gone
	}

	/// Point-in-time copy of the members of `room`.
	pub fn members_of(&self, room: &RoomId) -> Vec<UserId> {
		self.inner
			.read()
			.get(room)
			.map(|members| members.keys().cloned().collect())
			.unwrap_or_default()
	}

	pub fn is_member(&self, room: &RoomId, user: &UserId) -> bool {
		self.inner.read().get(room).is_some_and(|m| m.contains_key(user))
	}

	/// Rooms with at least one online member.
	pub fn room_count(&self) -> usize {
		self.inner.read().len()
	}
}
