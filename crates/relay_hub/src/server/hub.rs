#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{Instrument as _, debug, info, info_span, warn};

use crate::directory::RoomDirectory;
use crate::identity::IdentityVerifier;
use crate::server::dispatcher::{BroadcastDispatcher, DispatchLoop, DispatchStats, DispatcherConfig, new_pair};
use crate::server::membership::MembershipIndex;
use crate::server::registry::ConnectionRegistry;
use crate::server::session::{SessionReport, SessionSettings, run_session};
use crate::server::wait_for_shutdown;
use crate::store::MessageStore;

/// How long to wait for the client to close after the session is done, so
/// the final frames are not cut off by an immediate connection close.
const CLOSE_LINGER: Duration = Duration::from_secs(2);

/// External collaborators the hub consumes.
pub struct HubParts {
	pub verifier: Arc<dyn IdentityVerifier>,
	pub directory: Arc<dyn RoomDirectory>,
	pub store: Arc<dyn MessageStore>,
}

/// Everything a session needs, shared across sessions.
#[derive(Clone)]
pub struct Hub {
	pub verifier: Arc<dyn IdentityVerifier>,
	pub directory: Arc<dyn RoomDirectory>,
	pub store: Arc<dyn MessageStore>,
	pub registry: ConnectionRegistry,
	pub membership: MembershipIndex,
	pub dispatcher: BroadcastDispatcher,
	pub settings: Arc<SessionSettings>,
}

impl Hub {
	/// Build the hub and the fan-out loop that must be spawned alongside it.
	pub fn new(parts: HubParts, settings: SessionSettings, dispatcher_cfg: DispatcherConfig) -> (Self, DispatchLoop) {
		let registry = ConnectionRegistry::new();
		let membership = MembershipIndex::new();
		let (dispatcher, dispatch_loop) = new_pair(dispatcher_cfg, registry.clone(), membership.clone());

		let hub = Self {
			verifier: parts.verifier,
			directory: parts.directory,
			store: parts.store,
			registry,
			membership,
			dispatcher,
			settings: Arc::new(settings),
		};
		(hub, dispatch_loop)
	}
}

/// Second half of an orderly stop, after the dispatcher's own shutdown signal
/// has been sent: wait for it to drain its queue to the still-connected
/// sessions, then tell the sessions to close.
pub async fn drain_then_close_sessions(
	dispatcher: JoinHandle<DispatchStats>,
	sessions: &watch::Sender<bool>,
) -> Option<DispatchStats> {
	let stats = match dispatcher.await {
		Ok(stats) => {
			info!(
				dispatched = stats.dispatched,
				dropped_on_shutdown = stats.dropped_on_shutdown,
				"dispatcher stopped"
			);
			Some(stats)
		}
		Err(e) => {
			warn!(error = %e, "dispatcher task failed");
			None
		}
	};
	sessions.send_replace(true);
	stats
}

/// Serve one QUIC connection: a single bidirectional stream carries the session.
pub async fn handle_connection(
	hub: Hub,
	conn_id: u64,
	connection: quinn::Connection,
	mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<Option<SessionReport>> {
	struct ConnectionGaugeGuard;
	impl Drop for ConnectionGaugeGuard {
		fn drop(&mut self) {
			metrics::gauge!("relay_hub_active_connections").decrement(1.0);
		}
	}

	metrics::gauge!("relay_hub_active_connections").increment(1.0);
	let _conn_guard = ConnectionGaugeGuard;

	let remote = connection.remote_address();
	let (send, recv) = tokio::select! {
		biased;
		_ = wait_for_shutdown(&mut shutdown) => {
			connection.close(0u32.into(), b"shutdown");
			return Ok(None);
		}
		stream = connection.accept_bi() => stream.context("accept session stream")?,
	};

	let report = run_session(&hub, conn_id, recv, send, shutdown)
		.instrument(info_span!("session", conn_id, %remote))
		.await;

	if tokio::time::timeout(CLOSE_LINGER, connection.closed()).await.is_err() {
		debug!(conn_id, "client did not close; closing connection");
		connection.close(0u32.into(), b"done");
	}

	Ok(Some(report))
}
