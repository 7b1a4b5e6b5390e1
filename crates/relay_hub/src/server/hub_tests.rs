#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use relay_protocol::pb::{self, envelope::Msg};
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::server::dispatcher::{DispatcherConfig, spawn_dispatcher};
use crate::server::hub::drain_then_close_sessions;
use crate::server::session::SessionExit;
use crate::server::test_support::{
	TestClient, TokenTable, build_hub, expect_delivery, expect_error, room, start_hub, static_directory, test_settings, user,
};
use crate::store::InMemoryMessageStore;

#[tokio::test]
async fn queued_messages_reach_connected_members_before_sessions_close() {
	let cfg = DispatcherConfig {
		drain_timeout: Duration::from_secs(1),
		..DispatcherConfig::default()
	};
	let (hub, dispatch_loop) = build_hub(
		Arc::new(TokenTable::new(&["u1", "u2"])),
		static_directory(&[("u1", &["general"]), ("u2", &["general"])]),
		Arc::new(InMemoryMessageStore::new()),
		test_settings(),
		cfg,
	);
	let (sessions_tx, sessions_rx) = watch::channel(false);
	let mut u1 = TestClient::spawn(&hub, 1, sessions_rx.clone());
	let mut u2 = TestClient::spawn(&hub, 2, sessions_rx);
	u1.welcome("tok-u1").await;
	u2.welcome("tok-u2").await;

	// The fan-out loop is not running yet, so these stay queued.
	for i in 0..3 {
		u1.send_message(&format!("r-{i}"), "general", &format!("q{i}")).await;
		match u1.expect_msg().await.1 {
			Msg::MessageAccepted(_) => {}
			other => panic!("expected MessageAccepted, got {}", other.kind()),
		}
	}

	let (_dispatcher_tx, dispatcher_rx) = watch::channel(true);
	let dispatcher = spawn_dispatcher(dispatch_loop, dispatcher_rx);
	let stats = drain_then_close_sessions(dispatcher, &sessions_tx)
		.await
		.expect("dispatcher stats");
	assert_eq!(stats.dispatched, 3);
	assert_eq!(stats.dropped_on_shutdown, 0);

	for client in [&mut u1, &mut u2] {
		for i in 0..3 {
			assert_eq!(expect_delivery(client.expect_msg().await.1).text, format!("q{i}"));
		}
		let err = expect_error(client.expect_msg().await.1);
		assert_eq!(err.code(), pb::StatusCode::Unavailable);
		assert!(client.next().await.is_none());
	}

	let report = u2.session.await.expect("session task");
	assert_eq!(report.exit, SessionExit::Shutdown);
	u1.session.await.expect("session task");
	assert!(hub.registry.is_empty());
	assert_eq!(hub.membership.room_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_sessions_leave_no_shared_state_behind() {
	const USERS: [&str; 4] = ["u0", "u1", "u2", "u3"];
	let t = start_hub(
		&USERS,
		&[("u0", &["a", "b"]), ("u1", &["a"]), ("u2", &["b", "c"]), ("u3", &["a", "c"])],
		DispatcherConfig::default(),
	);

	let mut sessions = JoinSet::new();
	for session_id in 1..=32u64 {
		let hub = t.hub.clone();
		let shutdown = t.shutdown_tx.subscribe();
		let who = USERS[(session_id % 4) as usize];
		sessions.spawn(async move {
			let mut c = TestClient::spawn(&hub, session_id, shutdown);
			c.welcome(&format!("tok-{who}")).await;
			assert!(hub.registry.len() <= USERS.len());

			c.send_message("r-1", "a", &format!("from session {session_id}")).await;
			c.writer.shutdown().await.expect("finish client side");
			while c.next().await.is_some() {}
			c.session.await.expect("session task")
		});
	}

	while let Some(joined) = sessions.join_next().await {
		let report = joined.expect("client task");
		assert_eq!(report.exit, SessionExit::ClientClosed);
	}

	assert!(t.hub.registry.is_empty());
	assert_eq!(t.hub.membership.room_count(), 0);
	for who in USERS {
		assert!(t.hub.registry.lookup(&user(who)).is_none());
		for r in ["a", "b", "c"] {
			assert!(!t.hub.membership.is_member(&room(r), &user(who)));
		}
	}
}
