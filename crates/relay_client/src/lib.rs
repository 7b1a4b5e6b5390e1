#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use quinn::{Endpoint, TransportConfig};
use relay_domain::Message;
use relay_protocol::pb::{self, envelope::Msg};
use relay_protocol::{DEFAULT_MAX_FRAME_SIZE, FrameReader, FramingError, envelope, message_from_wire, write_frame};
use relay_util::endpoint::QuicEndpoint;
use tracing::{debug, info};

/// How the client decides to trust the hub's certificate.
#[derive(Debug, Clone)]
pub enum ServerTrust {
	/// Trust exactly this DER certificate (dev hubs print theirs at startup).
	Certificate(Vec<u8>),
	/// Skip verification entirely. Local development only.
	InsecureSkipVerify,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
	pub endpoint: QuicEndpoint,

	/// Resolved address override; otherwise the endpoint host is resolved.
	pub server_addr: Option<SocketAddr>,

	/// TLS server name; defaults to the endpoint host.
	pub server_name: Option<String>,

	pub auth_token: String,
	pub client_name: String,
	pub client_instance_id: String,
	pub max_frame_bytes: usize,

	/// Budget for connect plus the Hello/Welcome exchange.
	pub connect_timeout: Duration,
	pub trust: ServerTrust,
}

impl ClientConfig {
	pub fn new(endpoint: QuicEndpoint, auth_token: impl Into<String>) -> Self {
		Self {
			endpoint,
			server_addr: None,
			server_name: None,
			auth_token: auth_token.into(),
			client_name: format!("relay-client/{}", env!("CARGO_PKG_VERSION")),
			client_instance_id: format!("client-{}", std::process::id()),
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
			connect_timeout: Duration::from_secs(15),
			trust: ServerTrust::InsecureSkipVerify,
		}
	}
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
	#[error("failed to create QUIC endpoint: {0}")]
	Endpoint(String),

	#[error("failed to connect: {0}")]
	Connect(String),

	#[error(transparent)]
	Framing(#[from] FramingError),

	#[error("protocol error: {0}")]
	Protocol(String),

	/// The hub answered with an Error frame before or instead of Welcome.
	#[error("rejected by hub ({}): {message}", .code.as_str_name())]
	Rejected { code: pb::StatusCode, message: String },

	#[error("io error: {0}")]
	Io(String),
}

/// Something the hub pushed to this client.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
	/// A message this client sent was persisted.
	Accepted { request_id: String, message: Message },
	/// A message posted to one of this client's rooms.
	Delivered(Message),
	Pong(pb::Pong),
	/// Terminal error; the hub closes the stream after it.
	Error { code: pb::StatusCode, message: String },
	/// The hub finished the stream.
	Closed,
}

/// One authenticated session with a hub.
pub struct HubClient {
	_endpoint: Endpoint,
	conn: quinn::Connection,
	send: quinn::SendStream,
	reader: FrameReader<quinn::RecvStream>,
	max_frame_bytes: usize,
	next_request: u64,
}

impl HubClient {
	/// Connect, send Hello, and wait for Welcome.
	pub async fn connect(cfg: ClientConfig) -> Result<(Self, pb::Welcome), ClientError> {
		let endpoint = make_client_endpoint().map_err(|e| ClientError::Endpoint(format!("{e:#}")))?;
		let quinn_cfg = make_client_config(&cfg.trust).map_err(|e| ClientError::Endpoint(format!("{e:#}")))?;

		let connect_timeout = cfg.connect_timeout;
		let server_name = cfg.server_name.clone().unwrap_or_else(|| cfg.endpoint.server_name().to_string());

		let candidates: Vec<SocketAddr> = match cfg.server_addr {
			Some(addr) => vec![addr],
			None => {
				let hostport = cfg.endpoint.hostport();
				let addrs: Vec<SocketAddr> = tokio::net::lookup_host(&hostport)
					.await
					.map_err(|e| ClientError::Connect(format!("failed to resolve {hostport}: {e}")))?
					.collect();
				if addrs.is_empty() {
					return Err(ClientError::Connect(format!(
						"DNS resolution returned no addresses for {hostport}"
					)));
				}
				addrs
			}
		};

		let mut last_err: Option<String> = None;
		let mut conn: Option<quinn::Connection> = None;

		for server_addr in candidates {
			let connecting = endpoint
				.connect_with(quinn_cfg.clone(), server_addr, &server_name)
				.map_err(|e| ClientError::Connect(format!("connect_with({server_addr}, sni={server_name}): {e}")))?;

			match tokio::time::timeout(connect_timeout, connecting).await {
				Ok(Ok(c)) => {
					conn = Some(c);
					break;
				}
				Ok(Err(e)) => {
					last_err = Some(format!("connect failed (addr={server_addr}, sni={server_name}): {e}"));
				}
				Err(_) => {
					last_err = Some(format!(
						"connect timeout after {connect_timeout:?} (addr={server_addr}, sni={server_name})"
					));
				}
			}
		}

		let conn = conn.ok_or_else(|| {
			ClientError::Connect(last_err.unwrap_or_else(|| format!("no addresses attempted (sni={server_name})")))
		})?;

		info!(remote = %conn.remote_address(), "connected");

		let (mut send, recv) = tokio::time::timeout(connect_timeout, conn.open_bi())
			.await
			.map_err(|_| ClientError::Io(format!("timeout opening session stream after {connect_timeout:?}")))?
			.map_err(|e| ClientError::Io(format!("open_bi failed: {e}")))?;

		let hello = envelope(
			"",
			Msg::Hello(pb::Hello {
				auth_token: cfg.auth_token.into_bytes(),
				client_name: cfg.client_name,
				client_instance_id: cfg.client_instance_id,
			}),
		);
		write_frame(&mut send, &hello, cfg.max_frame_bytes).await?;

		let mut reader = FrameReader::new(recv, cfg.max_frame_bytes);
		let first = tokio::time::timeout(connect_timeout, reader.next::<pb::Envelope>())
			.await
			.map_err(|_| ClientError::Protocol(format!("timeout waiting for Welcome after {connect_timeout:?}")))??;

		let welcome = match first.and_then(|env| env.msg) {
			Some(Msg::Welcome(w)) => w,
			Some(Msg::Error(e)) => {
				return Err(ClientError::Rejected {
					code: e.code(),
					message: e.message,
				});
			}
			Some(other) => return Err(ClientError::Protocol(format!("expected Welcome, got {}", other.kind()))),
			None => return Err(ClientError::Protocol("stream closed before Welcome".to_string())),
		};

		debug!(
			server_name = %welcome.server_name,
			server_instance_id = %welcome.server_instance_id,
			rooms = welcome.room_ids.len(),
			"received Welcome"
		);

		let max_frame_bytes = match welcome.max_frame_bytes as usize {
			0 => cfg.max_frame_bytes,
			n => n.min(cfg.max_frame_bytes),
		};

		let client = Self {
			_endpoint: endpoint,
			conn,
			send,
			reader,
			max_frame_bytes,
			next_request: 0,
		};
		Ok((client, welcome))
	}

	fn request_id(&mut self) -> String {
		self.next_request += 1;
		format!("req-{}", self.next_request)
	}

	async fn write(&mut self, msg: Msg) -> Result<String, ClientError> {
		let request_id = self.request_id();
		write_frame(&mut self.send, &envelope(request_id.clone(), msg), self.max_frame_bytes).await?;
		Ok(request_id)
	}

	/// Post `text` to `room_id`. The returned request id comes back on the matching `Accepted`.
	pub async fn send_message(&mut self, room_id: &str, text: &str) -> Result<String, ClientError> {
		self.write(Msg::SendMessage(pb::SendMessage {
			room_id: room_id.to_string(),
			text: text.to_string(),
		}))
		.await
	}

	pub async fn ping(&mut self, client_time_unix_ms: i64) -> Result<String, ClientError> {
		self.write(Msg::Ping(pb::Ping { client_time_unix_ms })).await
	}

	/// Next event from the hub. Acks, deliveries and pongs share one stream, in the hub's write order.
	pub async fn next_event(&mut self) -> Result<ServerEvent, ClientError> {
		loop {
			let Some(env) = self.reader.next::<pb::Envelope>().await? else {
				return Ok(ServerEvent::Closed);
			};

			let event = match env.msg {
				Some(Msg::MessageAccepted(a)) => ServerEvent::Accepted {
					request_id: env.request_id,
					message: message_from_wire(a.message).map_err(|e| ClientError::Protocol(e.to_string()))?,
				},
				Some(Msg::Delivery(d)) => {
					ServerEvent::Delivered(message_from_wire(d.message).map_err(|e| ClientError::Protocol(e.to_string()))?)
				}
				Some(Msg::Pong(p)) => ServerEvent::Pong(p),
				Some(Msg::Error(e)) => ServerEvent::Error {
					code: e.code(),
					message: e.message,
				},
				Some(other) => {
					debug!(kind = other.kind(), "ignoring unexpected frame");
					continue;
				}
				None => continue,
			};
			return Ok(event);
		}
	}

	/// Finish our side of the stream; the hub answers by closing the session.
	pub fn finish(&mut self) -> Result<(), ClientError> {
		self.send.finish().map_err(|e| ClientError::Io(e.to_string()))
	}

	pub fn close(&self, code: u32, reason: &str) {
		self.conn.close(quinn::VarInt::from_u32(code), reason.as_bytes());
	}
}

fn make_client_endpoint() -> anyhow::Result<Endpoint> {
	let addr = SocketAddr::from(([0, 0, 0, 0], 0));
	Endpoint::client(addr).context("create client endpoint")
}

fn make_client_config(trust: &ServerTrust) -> anyhow::Result<quinn::ClientConfig> {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

	let mut tls = match trust {
		ServerTrust::Certificate(der) => {
			let mut roots = rustls::RootCertStore::empty();
			roots
				.add(rustls::pki_types::CertificateDer::from(der.clone()))
				.context("add hub certificate to trust store")?;
			rustls::ClientConfig::builder()
				.with_root_certificates(roots)
				.with_no_client_auth()
		}
		ServerTrust::InsecureSkipVerify => {
			let mut tls = rustls::ClientConfig::builder()
				.with_root_certificates(rustls::RootCertStore::empty())
				.with_no_client_auth();
			tls.dangerous().set_certificate_verifier(Arc::new(NoVerifier));
			tls
		}
	};
	tls.alpn_protocols = vec![relay_protocol::version::CLIENT_ALPN.to_vec()];

	let quic_tls = quinn::crypto::rustls::QuicClientConfig::try_from(tls)?;
	let mut cfg = quinn::ClientConfig::new(Arc::new(quic_tls));

	let mut transport = TransportConfig::default();
	transport.keep_alive_interval(Some(Duration::from_secs(15)));
	cfg.transport_config(Arc::new(transport));

	Ok(cfg)
}

/// Dev-only verifier that accepts any server certificate.
#[derive(Debug)]
struct NoVerifier;

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
	fn verify_server_cert(
		&self,
		_end_entity: &rustls::pki_types::CertificateDer<'_>,
		_intermediates: &[rustls::pki_types::CertificateDer<'_>],
		_server_name: &rustls::pki_types::ServerName<'_>,
		_ocsp_response: &[u8],
		_now: rustls::pki_types::UnixTime,
	) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
		Ok(rustls::client::danger::ServerCertVerified::assertion())
	}

	fn verify_tls12_signature(
		&self,
		_message: &[u8],
		_cert: &rustls::pki_types::CertificateDer<'_>,
		_dss: &rustls::DigitallySignedStruct,
	) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
		Err(rustls::Error::General("TLS1.2 not supported".into()))
	}

	fn verify_tls13_signature(
		&self,
		_message: &[u8],
		_cert: &rustls::pki_types::CertificateDer<'_>,
		_dss: &rustls::DigitallySignedStruct,
	) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
		Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
	}

	fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
		vec![
			rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
			rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
			rustls::SignatureScheme::RSA_PSS_SHA256,
			rustls::SignatureScheme::RSA_PSS_SHA384,
			rustls::SignatureScheme::RSA_PSS_SHA512,
			rustls::SignatureScheme::ED25519,
		]
	}
}
