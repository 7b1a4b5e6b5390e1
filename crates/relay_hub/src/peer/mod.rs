#![forbid(unsafe_code)]

//! Request/response links from the hub to backend services.
//!
//! Each request opens one bidirectional stream on a shared mutually
//! authenticated QUIC connection, writes a single framed [`pb::PeerRequest`],
//! finishes its send side and reads a single framed [`pb::PeerResponse`].

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use relay_protocol::pb::{self, peer_request, peer_response};
use relay_protocol::{DEFAULT_MAX_FRAME_SIZE, FrameReader, write_frame};
use relay_util::endpoint::QuicEndpoint;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::quic::mtls::peer_client_config;

/// Anything that can carry one peer request to a backend service.
#[async_trait::async_trait]
pub trait PeerTransport: Send + Sync {
	async fn call(&self, op: peer_request::Op) -> anyhow::Result<peer_response::Result>;
}

/// Settings for one peer link.
#[derive(Debug, Clone)]
pub struct PeerLinkConfig {
	pub endpoint: QuicEndpoint,
	/// TLS server name; defaults to the endpoint host.
	pub server_name: Option<String>,
	pub ca_path: PathBuf,
	pub cert_path: PathBuf,
	pub key_path: PathBuf,
	pub request_timeout: Duration,
}

pub struct PeerClient {
	label: &'static str,
	endpoint: quinn::Endpoint,
	target: QuicEndpoint,
	server_name: String,
	request_timeout: Duration,
	conn: Mutex<Option<quinn::Connection>>,
	next_request_id: AtomicU64,
}

impl PeerClient {
	/// Build a client for `cfg`. No connection is made until the first call.
	pub fn new(label: &'static str, cfg: &PeerLinkConfig) -> anyhow::Result<Self> {
		let client_config = peer_client_config(&cfg.ca_path, &cfg.cert_path, &cfg.key_path)
			.with_context(|| format!("{label} peer tls config"))?;

		let bind: SocketAddr = if cfg.endpoint.host.starts_with('[') {
			"[::]:0".parse()?
		} else {
			"0.0.0.0:0".parse()?
		};
		let mut endpoint = quinn::Endpoint::client(bind).context("bind peer client endpoint")?;
		endpoint.set_default_client_config(client_config);

		let server_name = cfg
			.server_name
			.clone()
			.unwrap_or_else(|| cfg.endpoint.server_name().to_string());

		info!(peer = label, endpoint = %cfg.endpoint, %server_name, "peer link configured");

		Ok(Self {
			label,
			endpoint,
			target: cfg.endpoint.clone(),
			server_name,
			request_timeout: cfg.request_timeout,
			conn: Mutex::new(None),
			next_request_id: AtomicU64::new(1),
		})
	}

	async fn connection(&self) -> anyhow::Result<quinn::Connection> {
		let mut guard = self.conn.lock().await;
		if let Some(conn) = guard.as_ref()
			&& conn.close_reason().is_none()
		{
			return Ok(conn.clone());
		}

		let addr = tokio::net::lookup_host(self.target.hostport())
			.await
			.with_context(|| format!("resolve {}", self.target))?
			.next()
			.ok_or_else(|| anyhow!("no addresses for {}", self.target))?;

		let conn = self
			.endpoint
			.connect(addr, &self.server_name)
			.context("start peer connection")?
			.await
			.with_context(|| format!("connect {} peer at {}", self.label, self.target))?;
		debug!(peer = self.label, remote = %conn.remote_address(), "peer connection established");

		*guard = Some(conn.clone());
		Ok(conn)
	}

	async fn call_once(&self, op: peer_request::Op) -> anyhow::Result<peer_response::Result> {
		let conn = self.connection().await?;
		let (mut send, recv) = conn.open_bi().await.context("open peer stream")?;

		let request = pb::PeerRequest {
			request_id: self.next_request_id.fetch_add(1, Ordering::Relaxed),
			op: Some(op),
		};
		exchange(&mut send, recv, &request).await
	}
}

#[async_trait::async_trait]
impl PeerTransport for PeerClient {
	async fn call(&self, op: peer_request::Op) -> anyhow::Result<peer_response::Result> {
		tokio::time::timeout(self.request_timeout, self.call_once(op))
			.await
			.map_err(|_| anyhow!("{} peer request timed out after {:?}", self.label, self.request_timeout))?
	}
}

/// One request/response exchange over an already-open stream pair.
pub async fn exchange<W, R>(send: &mut W, recv: R, request: &pb::PeerRequest) -> anyhow::Result<peer_response::Result>
where
	W: AsyncWrite + Unpin,
	R: AsyncRead + Unpin,
{
	write_frame(send, request, DEFAULT_MAX_FRAME_SIZE)
		.await
		.context("write peer request")?;
	send.shutdown().await.context("finish peer request")?;

	let mut reader = FrameReader::new(recv, DEFAULT_MAX_FRAME_SIZE);
	let response: pb::PeerResponse = reader
		.next()
		.await
		.context("read peer response")?
		.ok_or_else(|| anyhow!("peer closed stream without a response"))?;

	if response.request_id != request.request_id {
		return Err(anyhow!(
			"peer response id mismatch: sent {} got {}",
			request.request_id,
			response.request_id
		));
	}

	response.result.ok_or_else(|| anyhow!("peer response has no result"))
}
