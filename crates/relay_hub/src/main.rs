#![forbid(unsafe_code)]

mod config;
mod directory;
mod identity;
mod peer;
mod quic;
mod server;
mod store;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use relay_domain::{UserId, UserIdentity};
use relay_util::endpoint::QuicEndpoint;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::HubConfig;
use crate::directory::{RemoteRoomDirectory, RoomDirectory, StaticRoomDirectory};
use crate::identity::{HmacIdentityVerifier, IdentityVerifier, RemoteIdentityVerifier, mint_hmac_token};
use crate::peer::PeerClient;
use crate::quic::config::QuicServerConfig;
use crate::server::dispatcher::spawn_dispatcher;
use crate::server::health::{HealthState, spawn_health_server};
use crate::server::hub::{Hub, HubParts, drain_then_close_sessions, handle_connection};
use crate::server::wait_for_shutdown;
use crate::store::{InMemoryMessageStore, MessageStore, SqlMessageStore};

/// Time sessions get, once told to close, to flush queued frames and write their final frame.
const SESSION_CLOSE_GRACE: Duration = Duration::from_secs(7);

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: relay_hub [--bind quic://host:port] [--config path] [--mint-token user_id [--ttl-secs n]]\n\
\n\
Options:\n\
\t--bind        Bind endpoint (default: quic://127.0.0.1:18203)\n\
\t             Format: quic://host:port\n\
\t--config      Config file (default: $RELAY_HUB_CONFIG, then ~/.relay/hub.toml)\n\
\t--mint-token  Print an HMAC token for user_id signed with auth_hmac_secret, then exit\n\
\t--ttl-secs    Lifetime of a minted token (default: 86400)\n\
\t--help        Show this help\n\
"
	);
	std::process::exit(2)
}

struct Args {
	bind: SocketAddr,
	config: Option<PathBuf>,
	mint_token: Option<String>,
	ttl: Duration,
}

fn parse_args() -> Args {
	let mut bind_endpoint = "quic://127.0.0.1:18203".to_string();
	let mut config: Option<PathBuf> = None;
	let mut mint_token: Option<String> = None;
	let mut ttl = Duration::from_secs(86_400);

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--bind" | "--listen" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--bind must be non-empty (expected quic://host:port)");
					usage_and_exit();
				}
				bind_endpoint = v;
			}
			"--config" => config = Some(PathBuf::from(it.next().unwrap_or_else(|| usage_and_exit()))),
			"--mint-token" => mint_token = Some(it.next().unwrap_or_else(|| usage_and_exit())),
			"--ttl-secs" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				ttl = Duration::from_secs(v.parse().unwrap_or_else(|_| {
					eprintln!("Invalid --ttl-secs value: {v}");
					usage_and_exit()
				}));
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	let bind = QuicEndpoint::parse(&bind_endpoint).unwrap_or_else(|e| {
		eprintln!("{e}");
		usage_and_exit();
	});

	let bind = bind.to_socket_addr_if_ip_literal().unwrap_or_else(|e| {
		eprintln!("{e}");
		usage_and_exit();
	});

	Args {
		bind,
		config,
		mint_token,
		ttl,
	}
}

fn init_rustls_crypto_provider() {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,relay_hub=debug".to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	if let Some(endpoint) = otlp_endpoint {
		use opentelemetry::global;
		use opentelemetry::trace::TracerProvider as _;
		use opentelemetry_otlp::WithExportConfig;

		match opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.with_endpoint(endpoint.clone())
			.build()
		{
			Ok(exporter) => {
				let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
					.with_batch_exporter(exporter)
					.build();
				let tracer = tracer_provider.tracer("relay_hub");
				global::set_tracer_provider(tracer_provider);

				let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
				base.with(otel_layer).init();
				info!(endpoint = %endpoint, "otlp tracing enabled");
			}
			Err(e) => {
				base.init();
				warn!(error = %e, "failed to initialize otlp tracing");
			}
		}
	} else {
		base.init();
	}
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

fn build_verifier(cfg: &HubConfig) -> anyhow::Result<Arc<dyn IdentityVerifier>> {
	if let Some(link) = cfg.identity.link_config("identity")? {
		let client = PeerClient::new("identity", &link)?;
		info!(endpoint = %link.endpoint, "identity: remote verifier");
		return Ok(Arc::new(RemoteIdentityVerifier::new(Arc::new(client))));
	}

	match cfg.server.auth_hmac_secret.clone() {
		Some(secret) => {
			info!("identity: local HMAC token verifier");
			Ok(Arc::new(HmacIdentityVerifier::new(secret)))
		}
		None => Err(anyhow!(
			"no identity source configured: set [identity] endpoint or [server] auth_hmac_secret"
		)),
	}
}

fn build_directory(cfg: &HubConfig) -> anyhow::Result<Arc<dyn RoomDirectory>> {
	if let Some(link) = cfg.rooms.peer.link_config("rooms")? {
		let client = PeerClient::new("rooms", &link)?;
		info!(endpoint = %link.endpoint, "rooms: remote directory");
		return Ok(Arc::new(RemoteRoomDirectory::new(Arc::new(client))));
	}

	if cfg.rooms.default_rooms.is_empty() && cfg.rooms.static_rooms.is_empty() {
		warn!("rooms: no default_rooms or static_rooms configured; sessions will join no rooms");
	}
	let directory = StaticRoomDirectory::from_config(&cfg.rooms.default_rooms, &cfg.rooms.static_rooms)
		.context("rooms: static directory")?;
	info!(
		default_rooms = cfg.rooms.default_rooms.len(),
		users = cfg.rooms.static_rooms.len(),
		"rooms: static directory"
	);
	Ok(Arc::new(directory))
}

async fn build_store(cfg: &HubConfig) -> anyhow::Result<Arc<dyn MessageStore>> {
	match cfg.persistence.database_url.as_deref() {
		Some(url) => Ok(Arc::new(SqlMessageStore::connect(url).await?)),
		None => {
			warn!("persistence: no database_url configured; messages are kept in memory only");
			Ok(Arc::new(InMemoryMessageStore::new()))
		}
	}
}

fn mint_token(cfg: &HubConfig, user_id: &str, ttl: Duration) -> anyhow::Result<()> {
	let secret = cfg
		.server
		.auth_hmac_secret
		.as_ref()
		.ok_or_else(|| anyhow!("--mint-token needs [server] auth_hmac_secret or RELAY_AUTH_HMAC_SECRET"))?;
	let user = UserId::new(user_id).context("user id")?;
	let identity = UserIdentity::new(user, user_id, String::new(), false);
	println!("{}", mint_hmac_token(secret, &identity, ttl)?);
	Ok(())
}

async fn shutdown_signal() {
	let ctrl_c = async {
		if let Err(e) = tokio::signal::ctrl_c().await {
			warn!(error = %e, "failed to listen for ctrl-c");
			std::future::pending::<()>().await;
		}
	};

	#[cfg(unix)]
	let terminate = async {
		match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
			Ok(mut sig) => {
				sig.recv().await;
			}
			Err(e) => {
				warn!(error = %e, "failed to listen for SIGTERM");
				std::future::pending::<()>().await;
			}
		}
	};

	#[cfg(not(unix))]
	let terminate = std::future::pending::<()>();

	tokio::select! {
		_ = ctrl_c => {}
		_ = terminate => {}
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_rustls_crypto_provider();
	init_tracing();

	let args = parse_args();

	let config_path = crate::config::resolve_config_path(args.config)?;
	let hub_cfg = crate::config::load_hub_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded hub config (toml + env overrides)");

	if let Some(user_id) = args.mint_token.as_deref() {
		return mint_token(&hub_cfg, user_id, args.ttl);
	}

	init_metrics(hub_cfg.server.metrics_bind.as_deref());

	let parts = HubParts {
		verifier: build_verifier(&hub_cfg)?,
		directory: build_directory(&hub_cfg)?,
		store: build_store(&hub_cfg).await?,
	};
	let session_settings = hub_cfg.hub.session_settings(hub_cfg.server.server_name.as_deref());
	let dispatcher_cfg = hub_cfg.hub.dispatcher_config();
	let (hub, dispatch_loop) = Hub::new(parts, session_settings, dispatcher_cfg);

	let health_state = HealthState::new(hub.registry.clone(), hub.membership.clone());
	if let Some(bind) = hub_cfg.server.health_bind.as_deref() {
		match bind.parse::<SocketAddr>() {
			Ok(addr) => {
				spawn_health_server(addr, health_state.clone());
				info!(%addr, "health server listening");
			}
			Err(e) => warn!(error = %e, %bind, "invalid health bind address (expected host:port)"),
		}
	}

	let quic_cfg = QuicServerConfig::new(args.bind);
	let endpoint = if let (Some(cert_path), Some(key_path)) = (
		hub_cfg.server.tls_cert_path.as_deref(),
		hub_cfg.server.tls_key_path.as_deref(),
	) {
		info!(cert = %cert_path.display(), key = %key_path.display(), "loading TLS cert/key");
		quic_cfg.bind_endpoint_with_tls(cert_path, key_path)?
	} else {
		let (endpoint, server_cert_der) = quic_cfg.bind_dev_endpoint()?;
		info!(
			bind = %args.bind,
			cert_der_len = server_cert_der.len(),
			"relay_hub: QUIC endpoint ready (dev self-signed cert)"
		);
		endpoint
	};

	// Accept loop and dispatcher stop first; sessions are told to close only
	// after the dispatcher has drained its queue to them.
	let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
	let (sessions_tx, sessions_rx) = watch::channel(false);
	let dispatcher = spawn_dispatcher(dispatch_loop, shutdown_rx.clone());

	{
		let shutdown_tx = shutdown_tx.clone();
		let health_state = health_state.clone();
		tokio::spawn(async move {
			shutdown_signal().await;
			info!("shutdown requested");
			health_state.mark_not_ready();
			let _ = shutdown_tx.send(true);
		});
	}

	health_state.mark_ready();
	info!(bind = %args.bind, "relay_hub: accepting connections");

	let mut connections = JoinSet::new();
	let mut next_conn_id: u64 = 1;

	loop {
		let incoming = tokio::select! {
			biased;
			_ = wait_for_shutdown(&mut shutdown_rx) => break,
			incoming = endpoint.accept() => incoming,
		};
		let Some(incoming) = incoming else {
			break;
		};

		while connections.try_join_next().is_some() {}

		let conn_id = next_conn_id;
		next_conn_id += 1;
		metrics::counter!("relay_hub_connections_total").increment(1);

		let hub = hub.clone();
		let shutdown = sessions_rx.clone();
		connections.spawn(async move {
			match incoming.await {
				Ok(connection) => {
					info!(conn_id, remote = %connection.remote_address(), "accepted connection");
					if let Err(e) = handle_connection(hub, conn_id, connection, shutdown).await {
						warn!(conn_id, error = %format!("{e:#}"), "connection handler exited with error");
					}
				}
				Err(e) => warn!(conn_id, error = %e, "failed to establish QUIC connection"),
			}
		});
	}

	endpoint.set_server_config(None);

	drain_then_close_sessions(dispatcher, &sessions_tx).await;

	let remaining = connections.len();
	if tokio::time::timeout(SESSION_CLOSE_GRACE, async {
		while connections.join_next().await.is_some() {}
	})
	.await
	.is_err()
	{
		warn!(remaining = connections.len(), "sessions still open after grace period; aborting");
		connections.shutdown().await;
	} else {
		info!(closed = remaining, "all sessions closed");
	}

	endpoint.close(0u32.into(), b"shutdown");
	endpoint.wait_idle().await;
	drop(shutdown_tx);
	info!("relay_hub stopped");
	Ok(())
}
