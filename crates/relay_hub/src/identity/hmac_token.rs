#![forbid(unsafe_code)]

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::anyhow;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use relay_domain::{SecretString, UserId, UserIdentity};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use super::{IdentityVerifier, VerifyError};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Claims {
	sub: String,
	#[serde(default)]
	username: String,
	#[serde(default)]
	email: String,
	#[serde(default)]
	verified: bool,
	exp: u64,
}

/// Stateless `v1.<payload>.<sig>` tokens signed with a shared secret.
pub struct HmacIdentityVerifier {
	secret: SecretString,
}

impl HmacIdentityVerifier {
	pub fn new(secret: SecretString) -> Self {
		Self { secret }
	}

	fn verify_str(&self, token: &str) -> Result<UserIdentity, VerifyError> {
		let mut parts = token.split('.');
		let (Some("v1"), Some(payload_b64), Some(sig_b64), None) = (parts.next(), parts.next(), parts.next(), parts.next())
		else {
			return Err(VerifyError::Rejected("invalid token format".to_string()));
		};

		let provided_sig = URL_SAFE_NO_PAD
			.decode(sig_b64)
			.map_err(|_| VerifyError::Rejected("invalid token signature encoding".to_string()))?;
		let mut mac = new_mac(self.secret.expose()).map_err(|e| VerifyError::Unavailable(e.to_string()))?;
		mac.update(payload_b64.as_bytes());
		mac.verify_slice(&provided_sig)
			.map_err(|_| VerifyError::Rejected("invalid token signature".to_string()))?;

		let payload = URL_SAFE_NO_PAD
			.decode(payload_b64)
			.map_err(|_| VerifyError::Rejected("invalid token payload encoding".to_string()))?;
		let claims: Claims = serde_json::from_slice(&payload)
			.map_err(|e| VerifyError::Rejected(format!("invalid token claims: {e}")))?;

		if claims.exp <= now_secs() {
			return Err(VerifyError::Rejected("token expired".to_string()));
		}

		let id = UserId::new(claims.sub).map_err(|_| VerifyError::Rejected("token subject is empty".to_string()))?;
		Ok(UserIdentity::new(id, claims.username, claims.email, claims.verified))
	}
}

#[async_trait::async_trait]
impl IdentityVerifier for HmacIdentityVerifier {
	async fn verify(&self, token: &[u8]) -> Result<UserIdentity, VerifyError> {
		let token = std::str::from_utf8(token)
			.map_err(|_| VerifyError::Rejected("token is not utf-8".to_string()))?
			.trim();
		if token.is_empty() {
			return Err(VerifyError::MissingToken);
		}
		self.verify_str(token)
	}
}

/// Issue a token for `user` valid for `ttl`.
pub fn mint_hmac_token(secret: &SecretString, user: &UserIdentity, ttl: Duration) -> anyhow::Result<String> {
	let claims = Claims {
		sub: user.id.as_str().to_string(),
		username: user.username.clone(),
		email: user.email.clone(),
		verified: user.verified,
		exp: now_secs().saturating_add(ttl.as_secs()),
	};
	let payload_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims)?);

	let mut mac = new_mac(secret.expose())?;
	mac.update(payload_b64.as_bytes());
	let sig_b64 = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

	Ok(format!("v1.{payload_b64}.{sig_b64}"))
}

fn new_mac(secret: &str) -> anyhow::Result<Hmac<Sha256>> {
	Hmac::<Sha256>::new_from_slice(secret.as_bytes()).map_err(|e| anyhow!("hmac key: {e}"))
}

fn now_secs() -> u64 {
	SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}
