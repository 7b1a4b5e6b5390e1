#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::{Context as _, anyhow};
use relay_domain::{RoomId, UserId};
use relay_protocol::pb::{self, peer_request, peer_response};

use super::RoomDirectory;
use crate::peer::PeerTransport;

/// Asks the rooms service over a peer link. The link's client certificate is
/// what authorizes this privileged query.
pub struct RemoteRoomDirectory {
	transport: Arc<dyn PeerTransport>,
}

impl RemoteRoomDirectory {
	pub fn new(transport: Arc<dyn PeerTransport>) -> Self {
		Self { transport }
	}
}

#[async_trait::async_trait]
impl RoomDirectory for RemoteRoomDirectory {
	async fn rooms_for(&self, user: &UserId) -> anyhow::Result<Vec<RoomId>> {
		let op = peer_request::Op::RoomsForUser(pb::RoomsForUser {
			user_id: user.as_str().to_string(),
		});

		match self.transport.call(op).await.context("rooms service call")? {
			peer_response::Result::Rooms(list) => {
				let rooms = list
					.room_ids
					.into_iter()
					.map(|r| RoomId::new(r).context("rooms service returned a blank room id"))
					.collect::<anyhow::Result<BTreeSet<_>>>()?;
				Ok(rooms.into_iter().collect())
			}
			peer_response::Result::Error(err) => Err(anyhow!(
				"rooms service error {}: {}",
				err.code().as_str_name(),
				err.message
			)),
			peer_response::Result::User(_) => Err(anyhow!("rooms service answered with a user")),
		}
	}
}
