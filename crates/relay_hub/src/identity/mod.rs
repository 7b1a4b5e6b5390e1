#![forbid(unsafe_code)]

mod hmac_token;
mod remote;

pub use hmac_token::{HmacIdentityVerifier, mint_hmac_token};
pub use remote::RemoteIdentityVerifier;

use relay_domain::UserIdentity;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VerifyError {
	#[error("missing token")]
	MissingToken,
	#[error("token rejected: {0}")]
	Rejected(String),
	#[error("identity service unavailable: {0}")]
	Unavailable(String),
}

/// Maps an opaque bearer token to a verified identity.
#[async_trait::async_trait]
pub trait IdentityVerifier: Send + Sync {
	async fn verify(&self, token: &[u8]) -> Result<UserIdentity, VerifyError>;
}
