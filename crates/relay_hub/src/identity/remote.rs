#![forbid(unsafe_code)]

use std::sync::Arc;

use relay_domain::UserIdentity;
use relay_protocol::pb::{self, peer_request, peer_response};
use tracing::warn;

use super::{IdentityVerifier, VerifyError};
use crate::peer::PeerTransport;

/// Delegates token verification to the identity service over a peer link.
pub struct RemoteIdentityVerifier {
	transport: Arc<dyn PeerTransport>,
}

impl RemoteIdentityVerifier {
	pub fn new(transport: Arc<dyn PeerTransport>) -> Self {
		Self { transport }
	}
}

#[async_trait::async_trait]
impl IdentityVerifier for RemoteIdentityVerifier {
	async fn verify(&self, token: &[u8]) -> Result<UserIdentity, VerifyError> {
		if token.iter().all(u8::is_ascii_whitespace) {
			return Err(VerifyError::MissingToken);
		}

		let op = peer_request::Op::VerifyToken(pb::VerifyToken { token: token.to_vec() });
		let result = self.transport.call(op).await.map_err(|e| {
			warn!(error = %e, "identity service call failed");
			VerifyError::Unavailable(format!("{e:#}"))
		})?;

		match result {
			peer_response::Result::User(user) => {
				UserIdentity::try_from(user).map_err(|e| VerifyError::Rejected(format!("identity service returned {e}")))
			}
			peer_response::Result::Error(err) => match err.code() {
				pb::StatusCode::Unavailable | pb::StatusCode::Internal => Err(VerifyError::Unavailable(err.message)),
				_ => Err(VerifyError::Rejected(err.message)),
			},
			peer_response::Result::Rooms(_) => Err(VerifyError::Unavailable(
				"identity service answered with a room list".to_string(),
			)),
		}
	}
}
