#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet, HashMap};

use anyhow::Context as _;
use relay_domain::{RoomId, UserId};

use super::RoomDirectory;

/// Membership from configuration: explicit rooms per user plus rooms everyone is in.
#[derive(Debug, Clone, Default)]
pub struct StaticRoomDirectory {
	default_rooms: Vec<RoomId>,
	by_user: HashMap<UserId, Vec<RoomId>>,
}

impl StaticRoomDirectory {
	pub fn new(default_rooms: Vec<RoomId>, by_user: HashMap<UserId, Vec<RoomId>>) -> Self {
		Self { default_rooms, by_user }
	}

	/// Build from raw config strings, rejecting blank ids.
	pub fn from_config(default_rooms: &[String], static_rooms: &BTreeMap<String, Vec<String>>) -> anyhow::Result<Self> {
		let default_rooms = default_rooms
			.iter()
			.map(|r| RoomId::new(r.as_str()).with_context(|| format!("default room {r:?}")))
			.collect::<anyhow::Result<Vec<_>>>()?;

		let mut by_user = HashMap::with_capacity(static_rooms.len());
		for (user, rooms) in static_rooms {
			let user_id = UserId::new(user.as_str()).with_context(|| format!("static_rooms user {user:?}"))?;
			let rooms = rooms
				.iter()
				.map(|r| RoomId::new(r.as_str()).with_context(|| format!("static_rooms.{user} room {r:?}")))
				.collect::<anyhow::Result<Vec<_>>>()?;
			by_user.insert(user_id, rooms);
		}

		Ok(Self::new(default_rooms, by_user))
	}
}

#[async_trait::async_trait]
impl RoomDirectory for StaticRoomDirectory {
	async fn rooms_for(&self, user: &UserId) -> anyhow::Result<Vec<RoomId>> {
		let mut rooms: BTreeSet<RoomId> = self.default_rooms.iter().cloned().collect();
		if let Some(extra) = self.by_user.get(user) {
			rooms.extend(extra.iter().cloned());
		}
		Ok(rooms.into_iter().collect())
	}
}
