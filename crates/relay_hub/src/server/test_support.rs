#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use relay_domain::{Message, MessageDraft, MessageId, RoomId, UserId, UserIdentity};
use relay_protocol::pb::{self, envelope::Msg};
use relay_protocol::{FrameReader, envelope, write_frame};
use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::directory::{RoomDirectory, StaticRoomDirectory};
use crate::identity::{IdentityVerifier, VerifyError};
use crate::server::dispatcher::{DispatchLoop, DispatcherConfig};
use crate::server::hub::{Hub, HubParts};
use crate::server::session::{SessionReport, SessionSettings, run_session};
use crate::store::{InMemoryMessageStore, MessageStore};

pub const MAX_FRAME: usize = relay_protocol::DEFAULT_MAX_FRAME_SIZE;

pub fn user(id: &str) -> UserId {
	UserId::new(id).expect("valid user id")
}

pub fn room(id: &str) -> RoomId {
	RoomId::new(id).expect("valid room id")
}

pub fn message(room_id: &str, sender: &str, text: &str) -> Message {
	Message::from_draft(
		MessageId::generate(),
		MessageDraft::new(room_id, text).expect("valid draft"),
		user(sender),
		1_700_000_000_000,
	)
}

/// Accepts the token `tok-<user id>` for every user it knows.
pub struct TokenTable {
	users: HashMap<String, UserIdentity>,
}

impl TokenTable {
	pub fn new(ids: &[&str]) -> Self {
		let users = ids
			.iter()
			.map(|id| {
				(
					format!("tok-{id}"),
					UserIdentity::new(user(id), format!("name-{id}"), format!("{id}@example.test"), true),
				)
			})
			.collect();
		Self { users }
	}
}

#[async_trait]
impl IdentityVerifier for TokenTable {
	async fn verify(&self, token: &[u8]) -> Result<UserIdentity, VerifyError> {
		let token = std::str::from_utf8(token).map_err(|_| VerifyError::Rejected("not utf-8".into()))?;
		self.users
			.get(token)
			.cloned()
			.ok_or_else(|| VerifyError::Rejected("unknown token".into()))
	}
}

pub struct FailingDirectory;

#[async_trait]
impl RoomDirectory for FailingDirectory {
	async fn rooms_for(&self, _user: &UserId) -> anyhow::Result<Vec<RoomId>> {
		anyhow::bail!("directory offline")
	}
}

pub struct FailingStore;

#[async_trait]
impl MessageStore for FailingStore {
	async fn create(&self, _draft: MessageDraft, _sender_id: &UserId) -> anyhow::Result<Message> {
		anyhow::bail!("disk full")
	}

	async fn get(&self, _id: &MessageId) -> anyhow::Result<Option<Message>> {
		Ok(None)
	}

	async fn delete(&self, _id: &MessageId) -> anyhow::Result<bool> {
		Ok(false)
	}
}

/// `rooms` maps user id to the rooms the directory reports for it.
pub fn static_directory(rooms: &[(&str, &[&str])]) -> Arc<dyn RoomDirectory> {
	let by_user = rooms
		.iter()
		.map(|(u, rs)| (user(u), rs.iter().map(|r| room(r)).collect()))
		.collect();
	Arc::new(StaticRoomDirectory::new(Vec::new(), by_user))
}

pub struct TestHub {
	pub hub: Hub,
	pub store: Arc<InMemoryMessageStore>,
	pub shutdown_tx: watch::Sender<bool>,
	pub dispatcher: JoinHandle<crate::server::dispatcher::DispatchStats>,
}

pub fn test_settings() -> SessionSettings {
	SessionSettings {
		server_name: "test-hub".to_string(),
		server_instance_id: "test-instance".to_string(),
		hello_timeout: Duration::from_secs(2),
		write_timeout: Duration::from_secs(5),
		outbound_queue_capacity: 64,
		max_frame_bytes: MAX_FRAME,
	}
}

pub fn build_hub(
	verifier: Arc<dyn IdentityVerifier>,
	directory: Arc<dyn RoomDirectory>,
	store: Arc<dyn MessageStore>,
	settings: SessionSettings,
	dispatcher_cfg: DispatcherConfig,
) -> (Hub, DispatchLoop) {
	Hub::new(
		HubParts {
			verifier,
			directory,
			store,
		},
		settings,
		dispatcher_cfg,
	)
}

/// Hub with the token table, a static directory, an in-memory store and a running dispatcher.
pub fn start_hub(users: &[&str], rooms: &[(&str, &[&str])], dispatcher_cfg: DispatcherConfig) -> TestHub {
	let store = Arc::new(InMemoryMessageStore::new());
	let (hub, dispatch_loop) = build_hub(
		Arc::new(TokenTable::new(users)),
		static_directory(rooms),
		store.clone(),
		test_settings(),
		dispatcher_cfg,
	);
	let (shutdown_tx, shutdown_rx) = watch::channel(false);
	let dispatcher = crate::server::dispatcher::spawn_dispatcher(dispatch_loop, shutdown_rx);
	TestHub {
		hub,
		store,
		shutdown_tx,
		dispatcher,
	}
}

/// Client end of an in-process session.
pub struct TestClient {
	pub reader: FrameReader<ReadHalf<DuplexStream>>,
	pub writer: WriteHalf<DuplexStream>,
	pub session: JoinHandle<SessionReport>,
}

impl TestClient {
	pub fn spawn(hub: &Hub, session_id: u64, shutdown: watch::Receiver<bool>) -> Self {
		Self::spawn_with_buffer(hub, session_id, shutdown, 64 * 1024)
	}

	/// Like `spawn`, with `buffer` bytes of transport between hub and client.
	pub fn spawn_with_buffer(hub: &Hub, session_id: u64, shutdown: watch::Receiver<bool>, buffer: usize) -> Self {
		let (client_io, server_io) = tokio::io::duplex(buffer);
		let (server_recv, server_send) = tokio::io::split(server_io);
		let (client_recv, client_send) = tokio::io::split(client_io);

		let hub = hub.clone();
		let session = tokio::spawn(async move { run_session(&hub, session_id, server_recv, server_send, shutdown).await });

		Self {
			reader: FrameReader::new(client_recv, MAX_FRAME),
			writer: client_send,
			session,
		}
	}

	pub async fn send(&mut self, request_id: &str, msg: Msg) {
		write_frame(&mut self.writer, &envelope(request_id, msg), MAX_FRAME)
			.await
			.expect("client write");
	}

	pub async fn hello(&mut self, token: &str) {
		self.send(
			"hello",
			Msg::Hello(pb::Hello {
				auth_token: token.as_bytes().to_vec(),
				client_name: "test-client".to_string(),
				client_instance_id: "ci-1".to_string(),
			}),
		)
		.await;
	}

	pub async fn send_message(&mut self, request_id: &str, room_id: &str, text: &str) {
		self.send(
			request_id,
			Msg::SendMessage(pb::SendMessage {
				room_id: room_id.to_string(),
				text: text.to_string(),
			}),
		)
		.await;
	}

	/// Next frame, or `None` once the server finished the stream.
	pub async fn next(&mut self) -> Option<pb::Envelope> {
		tokio::time::timeout(Duration::from_secs(2), self.reader.next::<pb::Envelope>())
			.await
			.expect("frame within timeout")
			.expect("well-formed frame")
	}

	pub async fn expect_msg(&mut self) -> (String, Msg) {
		let env = self.next().await.expect("stream still open");
		(env.request_id, env.msg.expect("envelope carries a message"))
	}

	pub async fn welcome(&mut self, token: &str) -> pb::Welcome {
		self.hello(token).await;
		match self.expect_msg().await {
			(_, Msg::Welcome(w)) => w,
			(_, other) => panic!("expected Welcome, got {}", other.kind()),
		}
	}

	/// Nothing arrives within `wait`.
	pub async fn assert_quiet(&mut self, wait: Duration) {
		if let Ok(frame) = tokio::time::timeout(wait, self.reader.next::<pb::Envelope>()).await {
			panic!("unexpected frame: {frame:?}");
		}
	}
}

pub fn expect_error(msg: Msg) -> pb::Error {
	match msg {
		Msg::Error(e) => e,
		other => panic!("expected Error, got {}", other.kind()),
	}
}

pub fn expect_delivery(msg: Msg) -> pb::ChatMessage {
	match msg {
		Msg::Delivery(d) => d.message.expect("delivery carries a message"),
		other => panic!("expected Delivery, got {}", other.kind()),
	}
}
