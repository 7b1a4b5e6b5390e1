#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use relay_domain::{MessageDraft, RoomId, UserId, UserIdentity, ValidationError};
use relay_protocol::pb::{self, envelope::Msg};
use relay_protocol::{FrameReader, FramingError, envelope, error_envelope, write_frame};
use relay_util::time::unix_ms_now;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Notify, mpsc, watch};
use tracing::{debug, info, warn};

use crate::server::dispatcher::PublishError;
use crate::server::hub::Hub;
use crate::server::membership::MembershipIndex;
use crate::server::registry::{ConnectionRegistry, OutboundHandle};
use crate::server::wait_for_shutdown;

/// Budget for writing the final error frame and finishing the stream.
const CLOSE_WRITE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
	Connecting,
	Authenticating,
	Active,
	Draining,
	Closed,
}

impl SessionState {
	pub fn can_transition_to(self, next: SessionState) -> bool {
		use SessionState::*;
		matches!(
			(self, next),
			(Connecting, Authenticating)
				| (Authenticating, Active)
				| (Authenticating, Closed)
				| (Active, Draining)
				| (Draining, Closed)
		)
	}
}

/// Terminal session failures, each mapped onto a wire status code.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
	#[error("unauthenticated: {0}")]
	Unauthenticated(String),
	#[error("invalid argument: {0}")]
	InvalidArgument(String),
	#[error("internal: {0}")]
	Internal(String),
}

impl SessionError {
	pub fn code(&self) -> pb::StatusCode {
		match self {
			SessionError::Unauthenticated(_) => pb::StatusCode::Unauthenticated,
			SessionError::InvalidArgument(_) => pb::StatusCode::InvalidArgument,
			SessionError::Internal(_) => pb::StatusCode::Internal,
		}
	}

	/// Text sent to the client. Internal details stay in the logs.
	fn client_message(&self) -> &str {
		match self {
			SessionError::Unauthenticated(m) | SessionError::InvalidArgument(m) => m,
			SessionError::Internal(_) => "internal error",
		}
	}
}

impl From<ValidationError> for SessionError {
	fn from(e: ValidationError) -> Self {
		SessionError::InvalidArgument(e.to_string())
	}
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionExit {
	/// Client finished its side of the stream.
	ClientClosed,
	/// Server shutdown was requested.
	Shutdown,
	/// The transport failed underneath the session.
	TransportLost(String),
	/// A terminal error was reported to the client.
	Failed(SessionError),
	/// The dispatcher gave up on a client that stopped reading.
	Evicted,
}

#[derive(Debug, Clone)]
pub struct SessionReport {
	pub session_id: u64,
	pub user_id: Option<UserId>,
	pub final_state: SessionState,
	pub exit: SessionExit,
	pub messages_accepted: u64,
}

/// Static per-session settings shared by every session of a hub.
#[derive(Debug, Clone)]
pub struct SessionSettings {
	pub server_name: String,
	pub server_instance_id: String,
	pub hello_timeout: Duration,
	/// Longest a single frame write may block before the client is treated as gone.
	pub write_timeout: Duration,
	pub outbound_queue_capacity: usize,
	pub max_frame_bytes: usize,
}

impl Default for SessionSettings {
	fn default() -> Self {
		Self {
			server_name: "relay_hub".to_string(),
			server_instance_id: uuid::Uuid::new_v4().to_string(),
			hello_timeout: Duration::from_secs(10),
			write_timeout: Duration::from_secs(5),
			outbound_queue_capacity: 256,
			max_frame_bytes: relay_protocol::DEFAULT_MAX_FRAME_SIZE,
		}
	}
}

struct StateCell {
	session_id: u64,
	state: SessionState,
}

impl StateCell {
	fn advance(&mut self, next: SessionState) {
		if self.state.can_transition_to(next) {
			debug!(session_id = self.session_id, from = ?self.state, to = ?next, "session state");
			self.state = next;
		} else {
			warn!(session_id = self.session_id, from = ?self.state, to = ?next, "illegal session transition ignored");
		}
	}
}

/// Undoes everything a session added to the shared maps, exactly once.
struct SessionGuard {
	registry: ConnectionRegistry,
	membership: MembershipIndex,
	session_id: u64,
	user_id: UserId,
	joined: Vec<RoomId>,
	registered: bool,
}

impl SessionGuard {
	fn new(registry: ConnectionRegistry, membership: MembershipIndex, session_id: u64, user_id: UserId) -> Self {
		metrics::gauge!("relay_hub_active_sessions").increment(1.0);
		Self {
			registry,
			membership,
			session_id,
			user_id,
			joined: Vec::new(),
			registered: false,
		}
	}

	fn join(&mut self, room: RoomId) {
		self.membership.join(&room, &self.user_id);
		self.joined.push(room);
	}

	fn register(&mut self, handle: OutboundHandle) -> Option<OutboundHandle> {
		self.registered = true;
		self.registry.register(self.user_id.clone(), handle)
	}
}

impl Drop for SessionGuard {
	fn drop(&mut self) {
		if self.registered && !self.registry.deregister(&self.user_id, self.session_id) {
			debug!(
				session_id = self.session_id,
				user_id = %self.user_id,
				"registry entry already replaced or evicted"
			);
		}
		for room in self.joined.drain(..) {
			self.membership.leave(&room, &self.user_id);
		}
		metrics::gauge!("relay_hub_active_sessions").decrement(1.0);
		debug!(session_id = self.session_id, user_id = %self.user_id, "session cleanup done");
	}
}

enum Authenticated {
	User(UserIdentity),
	Exit(SessionExit),
}

/// Drive one client stream from connect to close.
///
/// `recv`/`send` are the two halves of the client's bidirectional stream.
/// The send half is finished before this returns.
pub async fn run_session<R, W>(
	hub: &Hub,
	session_id: u64,
	recv: R,
	mut send: W,
	mut shutdown: watch::Receiver<bool>,
) -> SessionReport
where
	R: AsyncRead + Unpin,
	W: AsyncWrite + Unpin,
{
	let settings = &hub.settings;
	let mut state = StateCell {
		session_id,
		state: SessionState::Connecting,
	};
	let mut reader = FrameReader::new(recv, settings.max_frame_bytes);

	state.advance(SessionState::Authenticating);
	let user = match authenticate(hub, session_id, &mut reader, &mut shutdown).await {
		Authenticated::User(user) => user,
		Authenticated::Exit(exit) => {
			if let SessionExit::Failed(err) = &exit {
				metrics::counter!("relay_hub_auth_failures_total").increment(1);
				warn!(session_id, error = %err, "session rejected");
			}
			finish(&mut send, &exit, settings.max_frame_bytes).await;
			state.advance(SessionState::Closed);
			return SessionReport {
				session_id,
				user_id: None,
				final_state: state.state,
				exit,
				messages_accepted: 0,
			};
		}
	};

	state.advance(SessionState::Active);
	let user_id = user.id.clone();
	let mut accepted = 0u64;
	let exit = {
		let mut guard = SessionGuard::new(hub.registry.clone(), hub.membership.clone(), session_id, user_id.clone());
		let exit = match hub.directory.rooms_for(&user_id).await {
			Err(e) => {
				warn!(session_id, user_id = %user_id, error = %format!("{e:#}"), "room directory lookup failed");
				SessionExit::Failed(SessionError::Internal(format!("room directory: {e:#}")))
			}
			Ok(rooms) => {
				let (tx, mut rx) = mpsc::channel::<pb::Envelope>(settings.outbound_queue_capacity.max(1));

				let room_ids: Vec<String> = rooms.iter().map(|r| r.as_str().to_string()).collect();
				for room in rooms {
					guard.join(room);
				}
				let handle = OutboundHandle::new(session_id, &tx);
				let eviction = handle.eviction_signal();
				if let Some(prev) = guard.register(handle) {
					info!(
						session_id,
						user_id = %user_id,
						replaced_session_id = prev.session_id(),
						"newer session replaces registry entry"
					);
				}
				info!(session_id, user_id = %user_id, rooms = room_ids.len(), "session active");

				let welcome = envelope(
					"",
					Msg::Welcome(pb::Welcome {
						server_name: settings.server_name.clone(),
						server_instance_id: settings.server_instance_id.clone(),
						server_time_unix_ms: unix_ms_now(),
						max_frame_bytes: u32::try_from(settings.max_frame_bytes).unwrap_or(u32::MAX),
						user: Some((&user).into()),
						room_ids,
					}),
				);

				let mut active = ActiveSession {
					hub,
					session_id,
					user_id: &user_id,
					accepted: 0,
					eviction,
				};
				match active.write(&mut send, &welcome, &mut shutdown).await {
					Err(exit) => exit,
					Ok(()) => {
						let exit = active.run(&mut reader, &mut send, &mut rx, &mut shutdown).await;
						accepted = active.accepted;
						exit
					}
				}
				// `tx` drops here; the registry's weak handle can no longer upgrade.
			}
		};
		state.advance(SessionState::Draining);
		exit
		// guard drops here: deregister and leave every joined room.
	};

	match &exit {
		SessionExit::Failed(err) => {
			metrics::counter!("relay_hub_sessions_failed_total").increment(1);
			warn!(session_id, user_id = %user_id, error = %err, "session failed");
		}
		other => info!(session_id, user_id = %user_id, exit = ?other, accepted, "session ended"),
	}

	finish(&mut send, &exit, settings.max_frame_bytes).await;
	state.advance(SessionState::Closed);

	SessionReport {
		session_id,
		user_id: Some(user_id),
		final_state: state.state,
		exit,
		messages_accepted: accepted,
	}
}

async fn authenticate<R: AsyncRead + Unpin>(
	hub: &Hub,
	session_id: u64,
	reader: &mut FrameReader<R>,
	shutdown: &mut watch::Receiver<bool>,
) -> Authenticated {
	let first = tokio::select! {
		biased;
		_ = wait_for_shutdown(shutdown) => return Authenticated::Exit(SessionExit::Shutdown),
		r = tokio::time::timeout(hub.settings.hello_timeout, reader.next::<pb::Envelope>()) => r,
	};

	let hello = match first {
		Err(_) => {
			return Authenticated::Exit(SessionExit::Failed(SessionError::Unauthenticated(format!(
				"no Hello within {:?}",
				hub.settings.hello_timeout
			))));
		}
		Ok(Ok(None)) => return Authenticated::Exit(SessionExit::ClientClosed),
		Ok(Err(e)) => return Authenticated::Exit(read_failure(e)),
		Ok(Ok(Some(env))) => match env.msg {
			Some(Msg::Hello(hello)) => hello,
			other => {
				let kind = other.as_ref().map(Msg::kind).unwrap_or("empty");
				return Authenticated::Exit(SessionExit::Failed(SessionError::Unauthenticated(format!(
					"first frame must be Hello, got {kind}"
				))));
			}
		},
	};

	debug!(
		session_id,
		client_name = %hello.client_name,
		client_instance_id = %hello.client_instance_id,
		"received Hello"
	);

	if hello.auth_token.iter().all(u8::is_ascii_whitespace) {
		return Authenticated::Exit(SessionExit::Failed(SessionError::Unauthenticated(
			"missing auth token".to_string(),
		)));
	}

	match hub.verifier.verify(&hello.auth_token).await {
		Ok(user) => {
			debug!(session_id, user_id = %user.id, "token verified");
			Authenticated::User(user)
		}
		Err(e) => {
			debug!(session_id, error = %e, "token verification failed");
			Authenticated::Exit(SessionExit::Failed(SessionError::Unauthenticated(
				"invalid auth token".to_string(),
			)))
		}
	}
}

fn read_failure(e: FramingError) -> SessionExit {
	if e.is_malformed() {
		metrics::counter!("relay_hub_decode_errors_total").increment(1);
		SessionExit::Failed(SessionError::InvalidArgument(format!("malformed frame: {e}")))
	} else {
		SessionExit::TransportLost(e.to_string())
	}
}

struct ActiveSession<'a> {
	hub: &'a Hub,
	session_id: u64,
	user_id: &'a UserId,
	accepted: u64,
	eviction: Arc<Notify>,
}

enum Step {
	Continue,
	Exit(SessionExit),
}

impl ActiveSession<'_> {
	async fn run<R, W>(
		&mut self,
		reader: &mut FrameReader<R>,
		send: &mut W,
		outbound: &mut mpsc::Receiver<pb::Envelope>,
		shutdown: &mut watch::Receiver<bool>,
	) -> SessionExit
	where
		R: AsyncRead + Unpin,
		W: AsyncWrite + Unpin,
	{
		loop {
			let step = tokio::select! {
				biased;
				_ = wait_for_shutdown(shutdown) => Step::Exit(self.flush_queued(send, outbound).await),
				_ = self.eviction.notified() => Step::Exit(SessionExit::Evicted),
				Some(env) = outbound.recv() => match self.write(send, &env, shutdown).await {
					Ok(()) => Step::Continue,
					Err(exit) => Step::Exit(exit),
				},
				inbound = reader.next::<pb::Envelope>() => match inbound {
					Ok(Some(env)) => self.handle_inbound(env, send, shutdown).await,
					Ok(None) => Step::Exit(SessionExit::ClientClosed),
					Err(e) => Step::Exit(read_failure(e)),
				},
			};

			if let Step::Exit(exit) = step {
				return exit;
			}
		}
	}

	/// Write one frame, bounded by `write_timeout` and interrupted by shutdown
	/// or eviction. An interrupted write leaves a partial frame behind, so the
	/// stream is treated as lost.
	async fn write<W: AsyncWrite + Unpin>(
		&self,
		send: &mut W,
		env: &pb::Envelope,
		shutdown: &mut watch::Receiver<bool>,
	) -> Result<(), SessionExit> {
		let settings = &self.hub.settings;
		let limit = settings.write_timeout;
		tokio::select! {
			biased;
			_ = wait_for_shutdown(shutdown) => Err(SessionExit::TransportLost("write interrupted by shutdown".to_string())),
			_ = self.eviction.notified() => Err(SessionExit::Evicted),
			res = tokio::time::timeout(limit, write_frame(send, env, settings.max_frame_bytes)) => match res {
				Ok(Ok(())) => Ok(()),
				Ok(Err(e)) => Err(SessionExit::TransportLost(e.to_string())),
				Err(_) => {
					warn!(session_id = self.session_id, user_id = %self.user_id, "client stopped reading; write timed out");
					Err(SessionExit::TransportLost(format!("write blocked for {limit:?}")))
				}
			},
		}
	}

	/// Deliver frames that were queued before shutdown, then report `Shutdown`.
	async fn flush_queued<W: AsyncWrite + Unpin>(&self, send: &mut W, outbound: &mut mpsc::Receiver<pb::Envelope>) -> SessionExit {
		let max = self.hub.settings.max_frame_bytes;
		let flushed = tokio::time::timeout(CLOSE_WRITE_TIMEOUT, async {
			while let Ok(env) = outbound.try_recv() {
				write_frame(send, &env, max).await?;
			}
			Ok::<(), FramingError>(())
		})
		.await;

		match flushed {
			Ok(Ok(())) => SessionExit::Shutdown,
			Ok(Err(e)) => SessionExit::TransportLost(e.to_string()),
			Err(_) => SessionExit::TransportLost("flush on shutdown timed out".to_string()),
		}
	}

	async fn handle_inbound<W: AsyncWrite + Unpin>(
		&mut self,
		env: pb::Envelope,
		send: &mut W,
		shutdown: &mut watch::Receiver<bool>,
	) -> Step {
		let reply = match env.msg {
			Some(Msg::SendMessage(m)) => match self.accept_message(&m.room_id, &m.text).await {
				Ok(accepted) => accepted,
				Err(e) => return Step::Exit(SessionExit::Failed(e)),
			},
			Some(Msg::Ping(ping)) => Msg::Pong(pb::Pong {
				client_time_unix_ms: ping.client_time_unix_ms,
				server_time_unix_ms: unix_ms_now(),
			}),
			Some(Msg::Hello(_)) => {
				debug!(session_id = self.session_id, "duplicate Hello ignored");
				return Step::Continue;
			}
			Some(other) => {
				return Step::Exit(SessionExit::Failed(SessionError::InvalidArgument(format!(
					"unexpected {} frame from client",
					other.kind()
				))));
			}
			None => {
				return Step::Exit(SessionExit::Failed(SessionError::InvalidArgument(
					"empty envelope".to_string(),
				)));
			}
		};

		match self.write(send, &envelope(env.request_id, reply), shutdown).await {
			Ok(()) => Step::Continue,
			Err(exit) => Step::Exit(exit),
		}
	}

	/// Validate, persist, acknowledge, then hand off for fan-out.
	async fn accept_message(&mut self, room_id: &str, text: &str) -> Result<Msg, SessionError> {
		let draft = MessageDraft::new(room_id, text).inspect_err(|e| {
			metrics::counter!("relay_hub_messages_rejected_total").increment(1);
			debug!(session_id = self.session_id, error = %e, "message rejected");
		})?;

		let message = self.hub.store.create(draft, self.user_id).await.map_err(|e| {
			metrics::counter!("relay_hub_persist_failures_total").increment(1);
			SessionError::Internal(format!("persist message: {e:#}"))
		})?;

		self.accepted += 1;
		metrics::counter!("relay_hub_messages_accepted_total").increment(1);
		debug!(
			session_id = self.session_id,
			room_id = %message.room_id,
			message_id = %message.id,
			"message persisted"
		);

		let ack = Msg::MessageAccepted(pb::MessageAccepted {
			message: Some((&message).into()),
		});

		match self.hub.dispatcher.publish(message).await {
			Ok(()) => {}
			Err(PublishError::QueueFull) => {
				metrics::counter!("relay_hub_dispatch_queue_full_total").increment(1);
				warn!(session_id = self.session_id, room_id = %room_id, "dispatch queue full; fan-out skipped");
			}
			Err(PublishError::Closed) => {
				warn!(session_id = self.session_id, room_id = %room_id, "dispatcher stopped; fan-out skipped");
			}
		}

		Ok(ack)
	}
}

/// Report terminal failures, then finish the send side.
async fn finish<W: AsyncWrite + Unpin>(send: &mut W, exit: &SessionExit, max_frame_bytes: usize) {
	let frame = match exit {
		SessionExit::Failed(err) => Some(error_envelope("", err.code(), err.client_message())),
		SessionExit::Shutdown => Some(error_envelope("", pb::StatusCode::Unavailable, "server shutting down")),
		SessionExit::ClientClosed | SessionExit::Evicted => None,
		SessionExit::TransportLost(_) => return,
	};

	let res = tokio::time::timeout(CLOSE_WRITE_TIMEOUT, async {
		if let Some(frame) = frame {
			write_frame(send, &frame, max_frame_bytes).await?;
		}
		send.shutdown().await?;
		Ok::<(), FramingError>(())
	})
	.await;

	match res {
		Ok(Ok(())) => {}
		Ok(Err(e)) => debug!(error = %e, "final write failed"),
		Err(_) => debug!("final write timed out"),
	}
}
