#![forbid(unsafe_code)]

use relay_domain::{Message, MessageId, ParseIdError, RoomId, UserId, UserIdentity};
use thiserror::Error;

use crate::pb;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConvertError {
	#[error("missing field: {0}")]
	MissingField(&'static str),
	#[error("invalid {field}: {source}")]
	InvalidId {
		field: &'static str,
		source: ParseIdError,
	},
}

fn id<T>(field: &'static str, raw: String, ctor: fn(String) -> Result<T, ParseIdError>) -> Result<T, ConvertError> {
	ctor(raw).map_err(|source| ConvertError::InvalidId { field, source })
}

impl From<&Message> for pb::ChatMessage {
	fn from(m: &Message) -> Self {
		Self {
			id: m.id.as_str().to_string(),
			room_id: m.room_id.as_str().to_string(),
			sender_id: m.sender_id.as_str().to_string(),
			text: m.text.clone(),
			created_at_unix_ms: m.created_at_unix_ms,
		}
	}
}

impl TryFrom<pb::ChatMessage> for Message {
	type Error = ConvertError;

	fn try_from(m: pb::ChatMessage) -> Result<Self, Self::Error> {
		Ok(Self {
			id: id("id", m.id, MessageId::new)?,
			room_id: id("room_id", m.room_id, RoomId::new)?,
			sender_id: id("sender_id", m.sender_id, UserId::new)?,
			text: m.text,
			created_at_unix_ms: m.created_at_unix_ms,
		})
	}
}

impl From<&UserIdentity> for pb::User {
	fn from(u: &UserIdentity) -> Self {
		Self {
			id: u.id.as_str().to_string(),
			username: u.username.clone(),
			email: u.email.clone(),
			verified: u.verified,
		}
	}
}

impl TryFrom<pb::User> for UserIdentity {
	type Error = ConvertError;

	fn try_from(u: pb::User) -> Result<Self, Self::Error> {
		Ok(UserIdentity::new(id("user.id", u.id, UserId::new)?, u.username, u.email, u.verified))
	}
}

/// Pull the message out of an accepted/delivered frame body.
pub fn message_from_wire(m: Option<pb::ChatMessage>) -> Result<Message, ConvertError> {
	m.ok_or(ConvertError::MissingField("message"))?.try_into()
}
