#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
}

/// Reasons an inbound message body is rejected before it reaches the store.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
	#[error("room id must be non-empty")]
	EmptyRoomId,
	#[error("message text must not be empty or whitespace")]
	BlankText,
}

macro_rules! string_id {
	($(#[$meta:meta])* $name:ident) => {
		$(#[$meta])*
		#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
		#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
		#[cfg_attr(feature = "serde", serde(transparent))]
		pub struct $name(String);

		impl $name {
			/// Create a non-empty identifier.
			pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
				let id = id.into();
				if id.trim().is_empty() {
					return Err(ParseIdError::Empty);
				}
				Ok(Self(id))
			}

			pub fn as_str(&self) -> &str {
				&self.0
			}
		}

		impl fmt::Display for $name {
			fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
				f.write_str(&self.0)
			}
		}

		impl FromStr for $name {
			type Err = ParseIdError;

			fn from_str(s: &str) -> Result<Self, Self::Err> {
				$name::new(s.to_string())
			}
		}

		impl AsRef<str> for $name {
			fn as_ref(&self) -> &str {
				&self.0
			}
		}
	};
}

string_id!(
	/// Stable user identifier issued by the identity service.
	UserId
);

string_id!(
	/// Stable room identifier owned by the room directory.
	RoomId
);

string_id!(
	/// Store-assigned message identifier.
	MessageId
);

impl MessageId {
	/// Fresh random id for a newly persisted message.
	pub fn generate() -> Self {
		Self(uuid::Uuid::new_v4().to_string())
	}
}

/// Verified user identity.
///
/// Immutable for the lifetime of a session once the identity verifier has
/// accepted the session's bearer token.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct UserIdentity {
	pub id: UserId,
	pub username: String,
	pub email: String,
	pub verified: bool,
}

impl UserIdentity {
	pub fn new(id: UserId, username: impl Into<String>, email: impl Into<String>, verified: bool) -> Self {
		Self {
			id,
			username: username.into(),
			email: email.into(),
			verified,
		}
	}
}

/// Validated body of a message a client wants to post.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageDraft {
	room_id: RoomId,
	text: String,
}

impl MessageDraft {
	/// Validate a raw `(room_id, text)` pair.
	pub fn new(room_id: &str, text: &str) -> Result<Self, ValidationError> {
		let room_id = RoomId::new(room_id).map_err(|_| ValidationError::EmptyRoomId)?;
		if text.trim().is_empty() {
			return Err(ValidationError::BlankText);
		}
		Ok(Self {
			room_id,
			text: text.to_string(),
		})
	}

	pub fn room_id(&self) -> &RoomId {
		&self.room_id
	}

	pub fn text(&self) -> &str {
		&self.text
	}
}

/// A persisted chat message.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Message {
	pub id: MessageId,
	pub room_id: RoomId,
	pub sender_id: UserId,
	pub text: String,
	pub created_at_unix_ms: i64,
}

impl Message {
	/// Attach store-assigned fields to a validated draft.
	pub fn from_draft(id: MessageId, draft: MessageDraft, sender_id: UserId, created_at_unix_ms: i64) -> Self {
		Self {
			id,
			room_id: draft.room_id,
			sender_id,
			text: draft.text,
			created_at_unix_ms,
		}
	}
}

/// Wrapper that redacts in logs.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	/// Access the inner secret string.
	pub fn expose(&self) -> &str {
		&self.0
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("<redacted>")
	}
}
