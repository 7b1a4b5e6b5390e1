#![forbid(unsafe_code)]

mod remote;
mod static_dir;

pub use remote::RemoteRoomDirectory;
pub use static_dir::StaticRoomDirectory;

use relay_domain::{RoomId, UserId};

/// Source of truth for room membership.
#[async_trait::async_trait]
pub trait RoomDirectory: Send + Sync {
	/// Rooms `user` belongs to, without duplicates.
	async fn rooms_for(&self, user: &UserId) -> anyhow::Result<Vec<RoomId>>;
}
