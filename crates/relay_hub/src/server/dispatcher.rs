#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::time::Duration;

use futures::future::join_all;
use relay_domain::{Message, UserId};
use relay_protocol::pb::{self, envelope::Msg};
use relay_protocol::envelope;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::server::membership::MembershipIndex;
use crate::server::registry::{ConnectionRegistry, OutboundHandle};
use crate::server::wait_for_shutdown;

/// Configuration for the broadcast dispatcher.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
	/// Messages waiting for fan-out before `publish` starts to block.
	pub queue_capacity: usize,

	/// How long `publish` may block on a full queue before giving up.
	pub publish_timeout: Duration,

	/// Per-recipient push budget. Zero means a non-blocking push: a full
	/// recipient queue is skipped without holding up the next message.
	pub delivery_timeout: Duration,

	/// Consecutive failed pushes after which a session is dropped from the
	/// registry and told to close. Zero disables eviction.
	pub evict_after_failures: u32,

	/// How long shutdown keeps fanning out already queued messages.
	pub drain_timeout: Duration,

	/// Whether the author receives their own message when they are a member.
	pub deliver_to_sender: bool,
}

impl Default for DispatcherConfig {
	fn default() -> Self {
		Self {
			queue_capacity: 1024,
			publish_timeout: Duration::from_millis(250),
			delivery_timeout: Duration::ZERO,
			evict_after_failures: 8,
			drain_timeout: Duration::from_secs(5),
			deliver_to_sender: true,
		}
	}
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PublishError {
	#[error("dispatch queue full")]
	QueueFull,
	#[error("dispatcher is shut down")]
	Closed,
}

/// Producer side. Cheap to clone; one per session.
#[derive(Debug, Clone)]
pub struct BroadcastDispatcher {
	tx: mpsc::Sender<Message>,
	publish_timeout: Duration,
}

impl BroadcastDispatcher {
	/// Enqueue a persisted message for fan-out.
	///
	/// Never waits on subscriber delivery; waits at most `publish_timeout`
	/// for queue space.
	pub async fn publish(&self, msg: Message) -> Result<(), PublishError> {
		let msg = match self.tx.try_send(msg) {
			Ok(()) => return Ok(()),
			Err(mpsc::error::TrySendError::Closed(_)) => return Err(PublishError::Closed),
			Err(mpsc::error::TrySendError::Full(msg)) => msg,
		};

		if self.publish_timeout.is_zero() {
			return Err(PublishError::QueueFull);
		}

		match self.tx.send_timeout(msg, self.publish_timeout).await {
			Ok(()) => Ok(()),
			Err(mpsc::error::SendTimeoutError::Timeout(_)) => Err(PublishError::QueueFull),
			Err(mpsc::error::SendTimeoutError::Closed(_)) => Err(PublishError::Closed),
		}
	}
}

/// Outcome of fanning out one message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanOutReport {
	/// Members in the snapshot, after the self-echo policy.
	pub targets: usize,
	pub delivered: usize,
	/// Members without a live handle.
	pub offline: usize,
	/// Live handles whose queue stayed full or closed mid-push.
	pub failed: usize,
	/// Sessions evicted for falling too far behind.
	pub evicted: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
	pub dispatched: u64,
	pub dropped_on_shutdown: u64,
}

/// Consumer side: the single fan-out loop.
pub struct DispatchLoop {
	rx: mpsc::Receiver<Message>,
	registry: ConnectionRegistry,
	membership: MembershipIndex,
	cfg: DispatcherConfig,
	/// Consecutive failed pushes per session id.
	strikes: HashMap<u64, (UserId, u32)>,
}

pub fn new_pair(
	cfg: DispatcherConfig,
	registry: ConnectionRegistry,
	membership: MembershipIndex,
) -> (BroadcastDispatcher, DispatchLoop) {
	let (tx, rx) = mpsc::channel(cfg.queue_capacity.max(1));
	let dispatcher = BroadcastDispatcher {
		tx,
		publish_timeout: cfg.publish_timeout,
	};
	let dispatch_loop = DispatchLoop {
		rx,
		registry,
		membership,
		cfg,
		strikes: HashMap::new(),
	};
	(dispatcher, dispatch_loop)
}

enum Delivery {
	Ok,
	Full,
	Closed,
}

impl DispatchLoop {
	/// Dequeue and fan out one message at a time, in publish order, until
	/// shutdown or until every producer is gone.
	pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> DispatchStats {
		let mut stats = DispatchStats::default();

		loop {
			tokio::select! {
				biased;
				_ = wait_for_shutdown(&mut shutdown) => break,
				next = self.rx.recv() => match next {
					Some(msg) => {
						self.fan_out(&msg).await;
						stats.dispatched += 1;
					}
					None => {
						debug!("dispatcher: all producers gone");
						return stats;
					}
				},
			}
		}

		self.drain(&mut stats).await;
		stats
	}

	/// Fan out what is already queued. Runs while sessions are still connected;
	/// a message that reaches none of its members counts as dropped.
	async fn drain(&mut self, stats: &mut DispatchStats) {
		self.rx.close();
		let deadline = Instant::now() + self.cfg.drain_timeout;
		let queued = self.rx.len();
		info!(queued, "dispatcher: draining queue");

		loop {
			match tokio::time::timeout_at(deadline, self.rx.recv()).await {
				Ok(Some(msg)) => {
					if Instant::now() >= deadline {
						stats.dropped_on_shutdown += 1;
						continue;
					}
					let report = self.fan_out(&msg).await;
					if report.targets > 0 && report.delivered == 0 {
						stats.dropped_on_shutdown += 1;
					} else {
						stats.dispatched += 1;
					}
				}
				Ok(None) => break,
				Err(_) => {
					while self.rx.try_recv().is_ok() {
						stats.dropped_on_shutdown += 1;
					}
					break;
				}
			}
		}

		if stats.dropped_on_shutdown > 0 {
			metrics::counter!("relay_hub_dispatch_dropped_on_shutdown_total").increment(stats.dropped_on_shutdown);
			warn!(
				dropped = stats.dropped_on_shutdown,
				drain_timeout_ms = self.cfg.drain_timeout.as_millis() as u64,
				"dispatcher: queued messages dropped during shutdown"
			);
		} else {
			info!(dispatched = stats.dispatched, "dispatcher: drained");
		}
	}

	/// Deliver `msg` to every online member of its room.
	///
	/// Pushes run concurrently; each is bounded by `delivery_timeout`. A
	/// failed push is logged and skipped, never retried. A session whose
	/// pushes keep failing is evicted.
	pub async fn fan_out(&mut self, msg: &Message) -> FanOutReport {
		let members = self.membership.members_of(&msg.room_id);
		let mut report = FanOutReport::default();

		let mut live: Vec<(UserId, OutboundHandle, mpsc::Sender<pb::Envelope>)> = Vec::with_capacity(members.len());
		for user in members {
			if !self.cfg.deliver_to_sender && user == msg.sender_id {
				continue;
			}
			report.targets += 1;
			let Some(handle) = self.registry.lookup(&user) else {
				report.offline += 1;
				continue;
			};
			match handle.upgrade() {
				Some(tx) => live.push((user, handle, tx)),
				None => {
					self.strikes.remove(&handle.session_id());
					report.offline += 1;
				}
			}
		}

		if live.is_empty() {
			debug!(room_id = %msg.room_id, message_id = %msg.id, offline = report.offline, "fan-out: no live recipients");
			return report;
		}

		let env = envelope(
			"",
			Msg::Delivery(pb::Delivery {
				message: Some(msg.into()),
			}),
		);
		let timeout = self.cfg.delivery_timeout;

		let results = join_all(live.into_iter().map(|(user, handle, tx)| {
			let env = env.clone();
			async move {
				let outcome = if timeout.is_zero() {
					match tx.try_send(env) {
						Ok(()) => Delivery::Ok,
						Err(mpsc::error::TrySendError::Full(_)) => Delivery::Full,
						Err(mpsc::error::TrySendError::Closed(_)) => Delivery::Closed,
					}
				} else {
					match tx.send_timeout(env, timeout).await {
						Ok(()) => Delivery::Ok,
						Err(mpsc::error::SendTimeoutError::Timeout(_)) => Delivery::Full,
						Err(mpsc::error::SendTimeoutError::Closed(_)) => Delivery::Closed,
					}
				};
				(user, handle, outcome)
			}
		}))
		.await;

		for (user, handle, outcome) in results {
			match outcome {
				Delivery::Ok => {
					report.delivered += 1;
					self.strikes.remove(&handle.session_id());
				}
				Delivery::Full => {
					report.failed += 1;
					warn!(room_id = %msg.room_id, message_id = %msg.id, user_id = %user, "fan-out: recipient queue full; skipped");
					if self.strike(user, &handle) {
						report.evicted += 1;
					}
				}
				Delivery::Closed => {
					report.failed += 1;
					self.strikes.remove(&handle.session_id());
					debug!(room_id = %msg.room_id, message_id = %msg.id, user_id = %user, "fan-out: recipient stream gone; skipped");
				}
			}
		}

		if self.strikes.len() > self.registry.len() {
			let registry = &self.registry;
			self.strikes
				.retain(|session_id, (user, _)| registry.lookup(user).is_some_and(|h| h.session_id() == *session_id));
		}

		metrics::counter!("relay_hub_deliveries_total").increment(report.delivered as u64);
		if report.failed > 0 {
			metrics::counter!("relay_hub_delivery_failures_total").increment(report.failed as u64);
		}

		debug!(
			room_id = %msg.room_id,
			message_id = %msg.id,
			targets = report.targets,
			delivered = report.delivered,
			offline = report.offline,
			failed = report.failed,
			evicted = report.evicted,
			"fan-out complete"
		);
		report
	}

	/// Count a failed push. Returns true when the session was evicted.
	fn strike(&mut self, user: UserId, handle: &OutboundHandle) -> bool {
		let session_id = handle.session_id();
		let limit = self.cfg.evict_after_failures;
		let entry = self.strikes.entry(session_id).or_insert((user, 0));
		entry.1 += 1;
		let failures = entry.1;
		if limit == 0 || failures < limit {
			return false;
		}

		let Some((user, _)) = self.strikes.remove(&session_id) else {
			return false;
		};
		self.registry.deregister(&user, session_id);
		handle.evict();
		metrics::counter!("relay_hub_sessions_evicted_total").increment(1);
		warn!(session_id, user_id = %user, failures, "fan-out: evicting session that stopped reading");
		true
	}
}

/// Run the fan-out loop on its own task.
pub fn spawn_dispatcher(dispatch_loop: DispatchLoop, shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<DispatchStats> {
	tokio::spawn(dispatch_loop.run(shutdown))
}
