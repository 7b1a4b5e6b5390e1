//! Wire types for `relay.v1`.
//!
//! Client stream: every frame is an [`Envelope`]. Peer links: one
//! [`PeerRequest`] and one [`PeerResponse`] per bidirectional stream.

/// Top-level frame on the client stream.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Envelope {
	#[prost(uint32, tag = "1")]
	pub version: u32,
	/// Client-chosen correlation id, echoed on direct replies. Empty on pushes.
	#[prost(string, tag = "2")]
	pub request_id: ::prost::alloc::string::String,
	#[prost(oneof = "envelope::Msg", tags = "10, 11, 12, 13, 14, 15, 16, 17")]
	pub msg: ::core::option::Option<envelope::Msg>,
}

pub mod envelope {
	#[allow(clippy::large_enum_variant)]
	#[derive(Clone, PartialEq, ::prost::Oneof)]
	pub enum Msg {
		#[prost(message, tag = "10")]
		Hello(super::Hello),
		#[prost(message, tag = "11")]
		Welcome(super::Welcome),
		#[prost(message, tag = "12")]
		SendMessage(super::SendMessage),
		#[prost(message, tag = "13")]
		MessageAccepted(super::MessageAccepted),
		#[prost(message, tag = "14")]
		Delivery(super::Delivery),
		#[prost(message, tag = "15")]
		Error(super::Error),
		#[prost(message, tag = "16")]
		Ping(super::Ping),
		#[prost(message, tag = "17")]
		Pong(super::Pong),
	}

	impl Msg {
		/// Short name for logs and metric labels.
		pub fn kind(&self) -> &'static str {
			match self {
				Msg::Hello(_) => "hello",
				Msg::Welcome(_) => "welcome",
				Msg::SendMessage(_) => "send_message",
				Msg::MessageAccepted(_) => "message_accepted",
				Msg::Delivery(_) => "delivery",
				Msg::Error(_) => "error",
				Msg::Ping(_) => "ping",
				Msg::Pong(_) => "pong",
			}
		}
	}
}

/// First client frame. Carries the bearer token outside any message body.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Hello {
	#[prost(bytes = "vec", tag = "1")]
	pub auth_token: ::prost::alloc::vec::Vec<u8>,
	#[prost(string, tag = "2")]
	pub client_name: ::prost::alloc::string::String,
	#[prost(string, tag = "3")]
	pub client_instance_id: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Welcome {
	#[prost(string, tag = "1")]
	pub server_name: ::prost::alloc::string::String,
	#[prost(string, tag = "2")]
	pub server_instance_id: ::prost::alloc::string::String,
	#[prost(int64, tag = "3")]
	pub server_time_unix_ms: i64,
	#[prost(uint32, tag = "4")]
	pub max_frame_bytes: u32,
	#[prost(message, optional, tag = "5")]
	pub user: ::core::option::Option<User>,
	/// Rooms the session joined on entering the active state.
	#[prost(string, repeated, tag = "6")]
	pub room_ids: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct User {
	#[prost(string, tag = "1")]
	pub id: ::prost::alloc::string::String,
	#[prost(string, tag = "2")]
	pub username: ::prost::alloc::string::String,
	#[prost(string, tag = "3")]
	pub email: ::prost::alloc::string::String,
	#[prost(bool, tag = "4")]
	pub verified: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChatMessage {
	#[prost(string, tag = "1")]
	pub id: ::prost::alloc::string::String,
	#[prost(string, tag = "2")]
	pub room_id: ::prost::alloc::string::String,
	#[prost(string, tag = "3")]
	pub sender_id: ::prost::alloc::string::String,
	#[prost(string, tag = "4")]
	pub text: ::prost::alloc::string::String,
	#[prost(int64, tag = "5")]
	pub created_at_unix_ms: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SendMessage {
	#[prost(string, tag = "1")]
	pub room_id: ::prost::alloc::string::String,
	#[prost(string, tag = "2")]
	pub text: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MessageAccepted {
	#[prost(message, optional, tag = "1")]
	pub message: ::core::option::Option<ChatMessage>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Delivery {
	#[prost(message, optional, tag = "1")]
	pub message: ::core::option::Option<ChatMessage>,
}

/// Terminal failure. The sender finishes its side right after this frame.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Error {
	#[prost(enumeration = "StatusCode", tag = "1")]
	pub code: i32,
	#[prost(string, tag = "2")]
	pub message: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Ping {
	#[prost(int64, tag = "1")]
	pub client_time_unix_ms: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Pong {
	#[prost(int64, tag = "1")]
	pub client_time_unix_ms: i64,
	#[prost(int64, tag = "2")]
	pub server_time_unix_ms: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum StatusCode {
	Unspecified = 0,
	Unauthenticated = 1,
	InvalidArgument = 2,
	Internal = 3,
	NotFound = 4,
	PermissionDenied = 5,
	Unavailable = 6,
}

impl StatusCode {
	pub fn as_str_name(&self) -> &'static str {
		match self {
			StatusCode::Unspecified => "STATUS_CODE_UNSPECIFIED",
			StatusCode::Unauthenticated => "UNAUTHENTICATED",
			StatusCode::InvalidArgument => "INVALID_ARGUMENT",
			StatusCode::Internal => "INTERNAL",
			StatusCode::NotFound => "NOT_FOUND",
			StatusCode::PermissionDenied => "PERMISSION_DENIED",
			StatusCode::Unavailable => "UNAVAILABLE",
		}
	}
}

/// Hub → backend service request on a peer link.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PeerRequest {
	#[prost(uint64, tag = "1")]
	pub request_id: u64,
	#[prost(oneof = "peer_request::Op", tags = "10, 11")]
	pub op: ::core::option::Option<peer_request::Op>,
}

pub mod peer_request {
	#[derive(Clone, PartialEq, ::prost::Oneof)]
	pub enum Op {
		#[prost(message, tag = "10")]
		VerifyToken(super::VerifyToken),
		#[prost(message, tag = "11")]
		RoomsForUser(super::RoomsForUser),
	}
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct VerifyToken {
	#[prost(bytes = "vec", tag = "1")]
	pub token: ::prost::alloc::vec::Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RoomsForUser {
	#[prost(string, tag = "1")]
	pub user_id: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PeerResponse {
	#[prost(uint64, tag = "1")]
	pub request_id: u64,
	#[prost(oneof = "peer_response::Result", tags = "10, 11, 12")]
	pub result: ::core::option::Option<peer_response::Result>,
}

pub mod peer_response {
	#[derive(Clone, PartialEq, ::prost::Oneof)]
	pub enum Result {
		#[prost(message, tag = "10")]
		User(super::User),
		#[prost(message, tag = "11")]
		Rooms(super::RoomList),
		#[prost(message, tag = "12")]
		Error(super::Error),
	}
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RoomList {
	#[prost(string, repeated, tag = "1")]
	pub room_ids: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
}
