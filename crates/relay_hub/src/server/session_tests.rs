#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use relay_domain::MessageId;
use relay_protocol::pb::{self, envelope::Msg};
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;

use crate::server::dispatcher::{DispatcherConfig, spawn_dispatcher};
use crate::server::session::{SessionError, SessionExit, SessionState};
use crate::server::test_support::{
	FailingDirectory, FailingStore, TestClient, TokenTable, build_hub, expect_delivery, expect_error, room, start_hub,
	static_directory, test_settings, user,
};
use crate::store::{InMemoryMessageStore, MessageStore};

const QUIET: Duration = Duration::from_millis(100);

#[test]
fn state_transitions_follow_the_lifecycle() {
	use SessionState::*;
	assert!(Connecting.can_transition_to(Authenticating));
	assert!(Authenticating.can_transition_to(Active));
	assert!(Authenticating.can_transition_to(Closed));
	assert!(Active.can_transition_to(Draining));
	assert!(Draining.can_transition_to(Closed));

	assert!(!Connecting.can_transition_to(Active));
	assert!(!Active.can_transition_to(Authenticating));
	assert!(!Closed.can_transition_to(Connecting));
	assert!(!Active.can_transition_to(Closed));
}

#[tokio::test]
async fn welcome_carries_identity_and_rooms() {
	let t = start_hub(&["u1"], &[("u1", &["general", "random"])], DispatcherConfig::default());
	let mut c = TestClient::spawn(&t.hub, 1, t.shutdown_tx.subscribe());

	let welcome = c.welcome("tok-u1").await;
	assert_eq!(welcome.server_name, "test-hub");
	assert_eq!(welcome.server_instance_id, "test-instance");
	assert_eq!(welcome.room_ids, vec!["general".to_string(), "random".to_string()]);
	let identity = welcome.user.expect("identity");
	assert_eq!(identity.id, "u1");
	assert_eq!(identity.username, "name-u1");

	assert!(t.hub.membership.is_member(&room("general"), &user("u1")));
	assert_eq!(t.hub.registry.lookup(&user("u1")).map(|h| h.session_id()), Some(1));

	c.writer.shutdown().await.expect("finish client side");
	assert!(c.next().await.is_none());
	let report = c.session.await.expect("session task");
	assert_eq!(report.exit, SessionExit::ClientClosed);
	assert_eq!(report.final_state, SessionState::Closed);
	assert_eq!(report.user_id, Some(user("u1")));

	assert!(t.hub.registry.is_empty());
	assert_eq!(t.hub.membership.room_count(), 0);
}

#[tokio::test]
async fn message_is_acked_persisted_and_fanned_out() {
	let t = start_hub(
		&["u1", "u2", "u3"],
		&[("u1", &["general"]), ("u2", &["general"]), ("u3", &["random"])],
		DispatcherConfig::default(),
	);
	let mut u1 = TestClient::spawn(&t.hub, 1, t.shutdown_tx.subscribe());
	let mut u2 = TestClient::spawn(&t.hub, 2, t.shutdown_tx.subscribe());
	let mut u3 = TestClient::spawn(&t.hub, 3, t.shutdown_tx.subscribe());
	u1.welcome("tok-u1").await;
	u2.welcome("tok-u2").await;
	u3.welcome("tok-u3").await;

	u1.send_message("r-1", "general", "hello room").await;

	let (request_id, ack) = u1.expect_msg().await;
	assert_eq!(request_id, "r-1");
	let accepted = match ack {
		Msg::MessageAccepted(a) => a.message.expect("accepted message"),
		other => panic!("expected MessageAccepted, got {}", other.kind()),
	};
	assert_eq!(accepted.room_id, "general");
	assert_eq!(accepted.sender_id, "u1");
	assert!(!accepted.id.is_empty());

	let stored = t
		.store
		.get(&MessageId::new(accepted.id.clone()).expect("id"))
		.await
		.expect("store readable")
		.expect("persisted before ack");
	assert_eq!(stored.text, "hello room");

	// Self echo is on by default.
	let (_, echo) = u1.expect_msg().await;
	assert_eq!(expect_delivery(echo).id, accepted.id);

	let (_, delivered) = u2.expect_msg().await;
	let delivered = expect_delivery(delivered);
	assert_eq!(delivered.id, accepted.id);
	assert_eq!(delivered.text, "hello room");

	u3.assert_quiet(QUIET).await;
}

#[tokio::test]
async fn deliveries_preserve_per_sender_order() {
	let t = start_hub(&["u1", "u2"], &[("u1", &["general"]), ("u2", &["general"])], DispatcherConfig::default());
	let mut u1 = TestClient::spawn(&t.hub, 1, t.shutdown_tx.subscribe());
	let mut u2 = TestClient::spawn(&t.hub, 2, t.shutdown_tx.subscribe());
	u1.welcome("tok-u1").await;
	u2.welcome("tok-u2").await;

	for i in 0..10 {
		u1.send_message(&format!("r-{i}"), "general", &format!("m{i}")).await;
	}

	for i in 0..10 {
		let (_, msg) = u2.expect_msg().await;
		assert_eq!(expect_delivery(msg).text, format!("m{i}"));
	}
}

#[tokio::test]
async fn disconnected_member_is_skipped_without_error_to_sender() {
	let t = start_hub(&["u1", "u2"], &[("u1", &["general"]), ("u2", &["general"])], DispatcherConfig::default());
	let mut u1 = TestClient::spawn(&t.hub, 1, t.shutdown_tx.subscribe());
	let mut u2 = TestClient::spawn(&t.hub, 2, t.shutdown_tx.subscribe());
	u1.welcome("tok-u1").await;
	u2.welcome("tok-u2").await;

	u2.writer.shutdown().await.expect("finish");
	assert!(u2.next().await.is_none());
	u2.session.await.expect("session task");
	assert_eq!(t.hub.membership.members_of(&room("general")), vec![user("u1")]);

	u1.send_message("r-1", "general", "anyone?").await;
	assert!(matches!(u1.expect_msg().await.1, Msg::MessageAccepted(_)));
	assert_eq!(expect_delivery(u1.expect_msg().await.1).text, "anyone?");
	u1.assert_quiet(QUIET).await;
	assert_eq!(t.store.len(), 1);
}

#[tokio::test]
async fn invalid_token_is_rejected_with_unauthenticated() {
	let t = start_hub(&["u1"], &[("u1", &["general"])], DispatcherConfig::default());
	let mut c = TestClient::spawn(&t.hub, 1, t.shutdown_tx.subscribe());

	c.hello("not-a-token").await;
	let (_, msg) = c.expect_msg().await;
	let err = expect_error(msg);
	assert_eq!(err.code(), pb::StatusCode::Unauthenticated);
	assert_eq!(err.message, "invalid auth token");
	assert!(c.next().await.is_none());

	let report = c.session.await.expect("session task");
	assert!(matches!(report.exit, SessionExit::Failed(SessionError::Unauthenticated(_))));
	assert_eq!(report.user_id, None);
	assert!(t.hub.registry.is_empty());
	assert_eq!(t.hub.membership.room_count(), 0);
}

#[tokio::test]
async fn blank_token_is_reported_as_missing() {
	let t = start_hub(&["u1"], &[], DispatcherConfig::default());
	let mut c = TestClient::spawn(&t.hub, 1, t.shutdown_tx.subscribe());

	c.hello("  ").await;
	let err = expect_error(c.expect_msg().await.1);
	assert_eq!(err.code(), pb::StatusCode::Unauthenticated);
	assert_eq!(err.message, "missing auth token");
}

#[tokio::test]
async fn first_frame_must_be_hello() {
	let t = start_hub(&["u1"], &[], DispatcherConfig::default());
	let mut c = TestClient::spawn(&t.hub, 1, t.shutdown_tx.subscribe());

	c.send("p", Msg::Ping(pb::Ping { client_time_unix_ms: 5 })).await;
	let err = expect_error(c.expect_msg().await.1);
	assert_eq!(err.code(), pb::StatusCode::Unauthenticated);
	assert!(err.message.contains("Hello"), "{}", err.message);
}

#[tokio::test]
async fn silent_client_times_out_before_hello() {
	let t = start_hub(&["u1"], &[], DispatcherConfig::default());
	let mut settings = test_settings();
	settings.hello_timeout = Duration::from_millis(50);
	let (hub, _loop) = build_hub(
		Arc::new(TokenTable::new(&["u1"])),
		static_directory(&[]),
		t.store.clone(),
		settings,
		DispatcherConfig::default(),
	);

	let mut c = TestClient::spawn(&hub, 1, t.shutdown_tx.subscribe());
	let err = expect_error(c.expect_msg().await.1);
	assert_eq!(err.code(), pb::StatusCode::Unauthenticated);
	let report = c.session.await.expect("session task");
	assert_eq!(report.final_state, SessionState::Closed);
}

#[tokio::test]
async fn blank_text_is_rejected_and_never_persisted() {
	let t = start_hub(&["u1", "u2"], &[("u1", &["general"]), ("u2", &["general"])], DispatcherConfig::default());
	let mut u1 = TestClient::spawn(&t.hub, 1, t.shutdown_tx.subscribe());
	let mut u2 = TestClient::spawn(&t.hub, 2, t.shutdown_tx.subscribe());
	u1.welcome("tok-u1").await;
	u2.welcome("tok-u2").await;

	u1.send_message("r-1", "general", "   ").await;

	let err = expect_error(u1.expect_msg().await.1);
	assert_eq!(err.code(), pb::StatusCode::InvalidArgument);
	assert!(u1.next().await.is_none());

	let report = u1.session.await.expect("session task");
	assert!(matches!(report.exit, SessionExit::Failed(SessionError::InvalidArgument(_))));
	assert_eq!(report.messages_accepted, 0);
	assert!(t.store.is_empty());

	u2.assert_quiet(QUIET).await;
	assert!(t.hub.registry.lookup(&user("u1")).is_none());
	assert!(t.hub.membership.is_member(&room("general"), &user("u2")));
	assert!(!t.hub.membership.is_member(&room("general"), &user("u1")));
}

#[tokio::test]
async fn empty_room_id_is_rejected() {
	let t = start_hub(&["u1"], &[("u1", &["general"])], DispatcherConfig::default());
	let mut u1 = TestClient::spawn(&t.hub, 1, t.shutdown_tx.subscribe());
	u1.welcome("tok-u1").await;

	u1.send_message("r-1", "", "hi").await;
	let err = expect_error(u1.expect_msg().await.1);
	assert_eq!(err.code(), pb::StatusCode::InvalidArgument);
}

#[tokio::test]
async fn newer_session_takes_over_fan_out_for_the_same_user() {
	let t = start_hub(&["u1", "u2"], &[("u1", &["general"]), ("u2", &["general"])], DispatcherConfig::default());
	let mut first = TestClient::spawn(&t.hub, 1, t.shutdown_tx.subscribe());
	first.welcome("tok-u1").await;
	let mut second = TestClient::spawn(&t.hub, 2, t.shutdown_tx.subscribe());
	second.welcome("tok-u1").await;
	assert_eq!(t.hub.registry.lookup(&user("u1")).map(|h| h.session_id()), Some(2));

	// The first session closes; the second keeps its registry entry and membership.
	first.writer.shutdown().await.expect("finish");
	assert!(first.next().await.is_none());
	first.session.await.expect("session task");
	assert_eq!(t.hub.registry.lookup(&user("u1")).map(|h| h.session_id()), Some(2));
	assert!(t.hub.membership.is_member(&room("general"), &user("u1")));

	let mut u2 = TestClient::spawn(&t.hub, 3, t.shutdown_tx.subscribe());
	u2.welcome("tok-u2").await;
	u2.send_message("r-1", "general", "still there?").await;

	let (_, msg) = second.expect_msg().await;
	assert_eq!(expect_delivery(msg).text, "still there?");
}

#[tokio::test]
async fn persistence_failure_is_internal_and_nothing_is_delivered() {
	let (shutdown_tx, shutdown_rx) = watch::channel(false);
	let (hub, dispatch_loop) = build_hub(
		Arc::new(TokenTable::new(&["u1", "u2"])),
		static_directory(&[("u1", &["general"]), ("u2", &["general"])]),
		Arc::new(FailingStore),
		test_settings(),
		DispatcherConfig::default(),
	);
	let _dispatcher = spawn_dispatcher(dispatch_loop, shutdown_rx);

	let mut u1 = TestClient::spawn(&hub, 1, shutdown_tx.subscribe());
	let mut u2 = TestClient::spawn(&hub, 2, shutdown_tx.subscribe());
	u1.welcome("tok-u1").await;
	u2.welcome("tok-u2").await;

	u1.send_message("r-1", "general", "lost").await;
	let err = expect_error(u1.expect_msg().await.1);
	assert_eq!(err.code(), pb::StatusCode::Internal);
	assert_eq!(err.message, "internal error");

	let report = u1.session.await.expect("session task");
	assert!(matches!(report.exit, SessionExit::Failed(SessionError::Internal(_))));
	u2.assert_quiet(QUIET).await;
}

#[tokio::test]
async fn directory_failure_leaves_nothing_registered() {
	let (shutdown_tx, shutdown_rx) = watch::channel(false);
	let (hub, _loop) = build_hub(
		Arc::new(TokenTable::new(&["u1"])),
		Arc::new(FailingDirectory),
		Arc::new(InMemoryMessageStore::new()),
		test_settings(),
		DispatcherConfig::default(),
	);

	let mut c = TestClient::spawn(&hub, 1, shutdown_rx);
	c.hello("tok-u1").await;
	let err = expect_error(c.expect_msg().await.1);
	assert_eq!(err.code(), pb::StatusCode::Internal);

	let report = c.session.await.expect("session task");
	assert!(matches!(report.exit, SessionExit::Failed(SessionError::Internal(_))));
	assert!(hub.registry.is_empty());
	assert_eq!(hub.membership.room_count(), 0);
	drop(shutdown_tx);
}

#[tokio::test]
async fn ping_gets_pong_with_client_time() {
	let t = start_hub(&["u1"], &[("u1", &["general"])], DispatcherConfig::default());
	let mut c = TestClient::spawn(&t.hub, 1, t.shutdown_tx.subscribe());
	c.welcome("tok-u1").await;

	c.send("p-1", Msg::Ping(pb::Ping { client_time_unix_ms: 42 })).await;
	let (request_id, msg) = c.expect_msg().await;
	assert_eq!(request_id, "p-1");
	match msg {
		Msg::Pong(p) => {
			assert_eq!(p.client_time_unix_ms, 42);
			assert!(p.server_time_unix_ms > 0);
		}
		other => panic!("expected Pong, got {}", other.kind()),
	}
}

#[tokio::test]
async fn server_only_frame_from_client_is_invalid() {
	let t = start_hub(&["u1"], &[("u1", &["general"])], DispatcherConfig::default());
	let mut c = TestClient::spawn(&t.hub, 1, t.shutdown_tx.subscribe());
	c.welcome("tok-u1").await;

	c.send("x", Msg::Delivery(pb::Delivery::default())).await;
	let err = expect_error(c.expect_msg().await.1);
	assert_eq!(err.code(), pb::StatusCode::InvalidArgument);
}

#[tokio::test]
async fn malformed_frame_is_invalid_argument() {
	let t = start_hub(&["u1"], &[("u1", &["general"])], DispatcherConfig::default());
	let mut c = TestClient::spawn(&t.hub, 1, t.shutdown_tx.subscribe());
	c.welcome("tok-u1").await;

	// Length prefix followed by bytes that are not an Envelope.
	c.writer.write_all(&[0, 0, 0, 3, 0xff, 0xff, 0xff]).await.expect("write");
	c.writer.flush().await.expect("flush");

	let err = expect_error(c.expect_msg().await.1);
	assert_eq!(err.code(), pb::StatusCode::InvalidArgument);
}

#[tokio::test]
async fn shutdown_closes_active_sessions_with_unavailable() {
	let t = start_hub(&["u1"], &[("u1", &["general"])], DispatcherConfig::default());
	let mut c = TestClient::spawn(&t.hub, 1, t.shutdown_tx.subscribe());
	c.welcome("tok-u1").await;

	t.shutdown_tx.send(true).expect("receivers alive");

	let err = expect_error(c.expect_msg().await.1);
	assert_eq!(err.code(), pb::StatusCode::Unavailable);
	assert!(c.next().await.is_none());

	let report = c.session.await.expect("session task");
	assert_eq!(report.exit, SessionExit::Shutdown);
	assert!(t.hub.registry.is_empty());
	assert_eq!(t.hub.membership.room_count(), 0);

	let stats = t.dispatcher.await.expect("dispatcher task");
	assert_eq!(stats.dropped_on_shutdown, 0);
}

/// Reads its Welcome, then never reads again.
async fn stalled_client(hub: &crate::server::hub::Hub, session_id: u64, shutdown: watch::Receiver<bool>, token: &str) -> TestClient {
	let mut c = TestClient::spawn_with_buffer(hub, session_id, shutdown, 512);
	c.welcome(token).await;
	c
}

/// Post `count` messages from `c`, then read back `frames_each` frames per post.
async fn post_and_collect(c: &mut TestClient, room_id: &str, count: usize, frames_each: usize) {
	for i in 0..count {
		c.send_message(&format!("r-{i}"), room_id, &format!("filler message number {i}")).await;
	}
	for _ in 0..count * frames_each {
		c.expect_msg().await;
	}
}

#[tokio::test]
async fn stalled_reader_still_shuts_down_and_cleans_up() {
	let t = start_hub(&["u1", "u2"], &[("u1", &["general"]), ("u2", &["general"])], DispatcherConfig::default());
	let stalled = stalled_client(&t.hub, 1, t.shutdown_tx.subscribe(), "tok-u1").await;
	let mut u2 = TestClient::spawn(&t.hub, 2, t.shutdown_tx.subscribe());
	u2.welcome("tok-u2").await;

	post_and_collect(&mut u2, "general", 40, 2).await;
	assert!(t.hub.registry.lookup(&user("u1")).is_some());

	t.shutdown_tx.send(true).expect("receivers alive");

	let report = tokio::time::timeout(Duration::from_secs(4), stalled.session)
		.await
		.expect("stalled session noticed shutdown")
		.expect("session task");
	assert!(matches!(report.exit, SessionExit::TransportLost(_)), "{:?}", report.exit);
	assert_eq!(report.final_state, SessionState::Closed);
	assert!(t.hub.registry.lookup(&user("u1")).is_none());
	assert!(!t.hub.membership.is_member(&room("general"), &user("u1")));
}

#[tokio::test]
async fn blocked_write_ends_the_session_after_write_timeout() {
	let (shutdown_tx, shutdown_rx) = watch::channel(false);
	let settings = crate::server::session::SessionSettings {
		write_timeout: Duration::from_millis(200),
		..test_settings()
	};
	let (hub, dispatch_loop) = build_hub(
		Arc::new(TokenTable::new(&["u1", "u2"])),
		static_directory(&[("u1", &["general"]), ("u2", &["general"])]),
		Arc::new(InMemoryMessageStore::new()),
		settings,
		DispatcherConfig::default(),
	);
	let _dispatcher = spawn_dispatcher(dispatch_loop, shutdown_rx);

	let stalled = stalled_client(&hub, 1, shutdown_tx.subscribe(), "tok-u1").await;
	let mut u2 = TestClient::spawn(&hub, 2, shutdown_tx.subscribe());
	u2.welcome("tok-u2").await;

	post_and_collect(&mut u2, "general", 40, 2).await;

	let report = tokio::time::timeout(Duration::from_secs(2), stalled.session)
		.await
		.expect("write timeout ended the session")
		.expect("session task");
	assert!(matches!(report.exit, SessionExit::TransportLost(_)), "{:?}", report.exit);
	assert!(hub.registry.lookup(&user("u1")).is_none());
	assert!(!hub.membership.is_member(&room("general"), &user("u1")));

	// The rest of the room is unaffected.
	u2.send_message("after", "general", "still here").await;
	assert!(matches!(u2.expect_msg().await.1, Msg::MessageAccepted(_)));
}

#[tokio::test]
async fn session_evicted_by_fan_out_closes_and_cleans_up() {
	let (shutdown_tx, shutdown_rx) = watch::channel(false);
	let settings = crate::server::session::SessionSettings {
		outbound_queue_capacity: 2,
		write_timeout: Duration::from_secs(30),
		..test_settings()
	};
	let cfg = DispatcherConfig {
		evict_after_failures: 3,
		..DispatcherConfig::default()
	};
	let (hub, dispatch_loop) = build_hub(
		Arc::new(TokenTable::new(&["u1", "u2"])),
		static_directory(&[("u1", &["general"]), ("u2", &["lobby"])]),
		Arc::new(InMemoryMessageStore::new()),
		settings,
		cfg,
	);
	let _dispatcher = spawn_dispatcher(dispatch_loop, shutdown_rx);

	let stalled = stalled_client(&hub, 1, shutdown_tx.subscribe(), "tok-u1").await;
	let mut u2 = TestClient::spawn(&hub, 2, shutdown_tx.subscribe());
	u2.welcome("tok-u2").await;

	// u2 is not in "general", so only the stalled member is a fan-out target.
	post_and_collect(&mut u2, "general", 30, 1).await;

	let report = tokio::time::timeout(Duration::from_secs(2), stalled.session)
		.await
		.expect("evicted session closed")
		.expect("session task");
	assert_eq!(report.exit, SessionExit::Evicted);
	assert!(hub.registry.lookup(&user("u1")).is_none());
	assert!(!hub.membership.is_member(&room("general"), &user("u1")));
	assert_eq!(hub.registry.lookup(&user("u2")).map(|h| h.session_id()), Some(2));
}

#[tokio::test]
async fn welcome_caps_max_frame_bytes_at_the_header_limit() {
	let (shutdown_tx, _shutdown_rx) = watch::channel(false);
	let settings = crate::server::session::SessionSettings {
		max_frame_bytes: usize::MAX,
		..test_settings()
	};
	let (hub, _loop) = build_hub(
		Arc::new(TokenTable::new(&["u1"])),
		static_directory(&[("u1", &["general"])]),
		Arc::new(InMemoryMessageStore::new()),
		settings,
		DispatcherConfig::default(),
	);

	let mut c = TestClient::spawn(&hub, 1, shutdown_tx.subscribe());
	assert_eq!(c.welcome("tok-u1").await.max_frame_bytes, u32::MAX);
}
