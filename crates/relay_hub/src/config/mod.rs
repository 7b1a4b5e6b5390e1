#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use relay_domain::SecretString;
use relay_util::endpoint::QuicEndpoint;
use serde::Deserialize;
use tracing::{info, warn};

use crate::peer::PeerLinkConfig;
use crate::server::dispatcher::DispatcherConfig;
use crate::server::session::SessionSettings;

/// Env var naming an explicit config file.
pub const CONFIG_PATH_ENV: &str = "RELAY_HUB_CONFIG";

/// Default config path: `~/.relay/hub.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".relay").join("hub.toml"))
}

/// `--config` wins, then `RELAY_HUB_CONFIG`, then the default path.
pub fn resolve_config_path(cli: Option<PathBuf>) -> anyhow::Result<PathBuf> {
	if let Some(path) = cli {
		return Ok(path);
	}
	match std::env::var(CONFIG_PATH_ENV) {
		Ok(v) if !v.trim().is_empty() => Ok(PathBuf::from(v.trim())),
		_ => default_config_path(),
	}
}

/// Load TOML (a missing file means defaults), then apply `RELAY_*` env overrides.
pub fn load_hub_config_from_path(path: &Path) -> anyhow::Result<HubConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = HubConfig::from_file(file_cfg);
	apply_env_overrides(&mut cfg, |key| std::env::var(key).ok());
	Ok(cfg)
}

#[derive(Debug, Clone, Default)]
pub struct HubConfig {
	pub server: ServerSettings,
	pub hub: HubSettings,
	pub identity: PeerSettings,
	pub rooms: RoomsSettings,
	pub persistence: PersistenceSettings,
}

#[derive(Debug, Clone, Default)]
pub struct ServerSettings {
	/// Name announced in `Welcome`.
	pub server_name: Option<String>,
	/// PEM-encoded certificate path for the client-facing endpoint.
	pub tls_cert_path: Option<PathBuf>,
	/// PEM-encoded private key path for the client-facing endpoint.
	pub tls_key_path: Option<PathBuf>,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Optional health/readiness HTTP bind address (host:port).
	pub health_bind: Option<String>,
	/// Secret for locally verified HMAC tokens; used when no identity service is configured.
	pub auth_hmac_secret: Option<SecretString>,
}

#[derive(Debug, Clone)]
pub struct HubSettings {
	pub dispatch_queue_capacity: usize,
	pub publish_timeout: Duration,
	pub delivery_timeout: Duration,
	pub evict_after_failures: u32,
	pub drain_timeout: Duration,
	pub deliver_to_sender: bool,
	pub outbound_queue_capacity: usize,
	pub hello_timeout: Duration,
	pub write_timeout: Duration,
	/// Capped at `u32::MAX`, the largest length the frame header can carry.
	pub max_frame_bytes: usize,
}

impl Default for HubSettings {
	fn default() -> Self {
		let dispatcher = DispatcherConfig::default();
		let session = SessionSettings::default();
		Self {
			dispatch_queue_capacity: dispatcher.queue_capacity,
			publish_timeout: dispatcher.publish_timeout,
			delivery_timeout: dispatcher.delivery_timeout,
			evict_after_failures: dispatcher.evict_after_failures,
			drain_timeout: dispatcher.drain_timeout,
			deliver_to_sender: dispatcher.deliver_to_sender,
			outbound_queue_capacity: session.outbound_queue_capacity,
			hello_timeout: session.hello_timeout,
			write_timeout: session.write_timeout,
			max_frame_bytes: session.max_frame_bytes,
		}
	}
}

impl HubSettings {
	pub fn dispatcher_config(&self) -> DispatcherConfig {
		DispatcherConfig {
			queue_capacity: self.dispatch_queue_capacity,
			publish_timeout: self.publish_timeout,
			delivery_timeout: self.delivery_timeout,
			evict_after_failures: self.evict_after_failures,
			drain_timeout: self.drain_timeout,
			deliver_to_sender: self.deliver_to_sender,
		}
	}

	pub fn session_settings(&self, server_name: Option<&str>) -> SessionSettings {
		let defaults = SessionSettings::default();
		SessionSettings {
			server_name: server_name.map(str::to_string).unwrap_or(defaults.server_name),
			server_instance_id: defaults.server_instance_id,
			hello_timeout: self.hello_timeout,
			write_timeout: self.write_timeout,
			outbound_queue_capacity: self.outbound_queue_capacity,
			max_frame_bytes: self.max_frame_bytes,
		}
	}
}

/// Peer link to a backend service. Unset endpoint means "use the local implementation".
#[derive(Debug, Clone)]
pub struct PeerSettings {
	pub endpoint: Option<String>,
	pub server_name: Option<String>,
	pub ca_path: Option<PathBuf>,
	pub cert_path: Option<PathBuf>,
	pub key_path: Option<PathBuf>,
	pub request_timeout: Duration,
}

impl Default for PeerSettings {
	fn default() -> Self {
		Self {
			endpoint: None,
			server_name: None,
			ca_path: None,
			cert_path: None,
			key_path: None,
			request_timeout: Duration::from_secs(5),
		}
	}
}

impl PeerSettings {
	/// `None` when no endpoint is configured. Peer links always need mTLS material.
	pub fn link_config(&self, section: &str) -> anyhow::Result<Option<PeerLinkConfig>> {
		let Some(endpoint) = self.endpoint.as_deref() else {
			return Ok(None);
		};
		let endpoint = QuicEndpoint::parse(endpoint).with_context(|| format!("[{section}] endpoint"))?;

		let require = |v: &Option<PathBuf>, name: &str| {
			v.clone()
				.ok_or_else(|| anyhow!("[{section}] {name} is required when endpoint is set"))
		};

		Ok(Some(PeerLinkConfig {
			endpoint,
			server_name: self.server_name.clone(),
			ca_path: require(&self.ca_path, "ca_path")?,
			cert_path: require(&self.cert_path, "cert_path")?,
			key_path: require(&self.key_path, "key_path")?,
			request_timeout: self.request_timeout,
		}))
	}
}

#[derive(Debug, Clone, Default)]
pub struct RoomsSettings {
	pub peer: PeerSettings,
	/// Rooms every user belongs to (local directory only).
	pub default_rooms: Vec<String>,
	/// Extra rooms per user id (local directory only).
	pub static_rooms: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Default)]
pub struct PersistenceSettings {
	/// `sqlite:` or `postgres:` URL. Unset keeps messages in memory.
	pub database_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	hub: FileHubSettings,

	#[serde(default)]
	identity: FilePeerSettings,

	#[serde(default)]
	rooms: FileRoomsSettings,

	#[serde(default)]
	persistence: FilePersistenceSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	server_name: Option<String>,
	tls_cert_path: Option<String>,
	tls_key_path: Option<String>,
	metrics_bind: Option<String>,
	health_bind: Option<String>,
	auth_hmac_secret: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileHubSettings {
	dispatch_queue_capacity: Option<usize>,
	publish_timeout_ms: Option<u64>,
	delivery_timeout_ms: Option<u64>,
	evict_after_failures: Option<u32>,
	drain_timeout_ms: Option<u64>,
	deliver_to_sender: Option<bool>,
	outbound_queue_capacity: Option<usize>,
	hello_timeout_ms: Option<u64>,
	write_timeout_ms: Option<u64>,
	max_frame_bytes: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePeerSettings {
	endpoint: Option<String>,
	server_name: Option<String>,
	ca_path: Option<String>,
	cert_path: Option<String>,
	key_path: Option<String>,
	request_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileRoomsSettings {
	#[serde(flatten)]
	peer: FilePeerSettings,

	#[serde(default)]
	default_rooms: Vec<String>,

	#[serde(default)]
	static_rooms: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePersistenceSettings {
	database_url: Option<String>,
}

fn clamp_frame_bytes(v: usize) -> usize {
	let max = u32::MAX as usize;
	if v > max {
		warn!(configured = v, max, "hub config: max_frame_bytes exceeds the frame header limit; clamped");
		return max;
	}
	v
}

fn non_empty(v: Option<String>) -> Option<String> {
	v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

impl PeerSettings {
	fn from_file(file: FilePeerSettings) -> Self {
		let defaults = Self::default();
		Self {
			endpoint: non_empty(file.endpoint),
			server_name: non_empty(file.server_name),
			ca_path: non_empty(file.ca_path).map(PathBuf::from),
			cert_path: non_empty(file.cert_path).map(PathBuf::from),
			key_path: non_empty(file.key_path).map(PathBuf::from),
			request_timeout: file
				.request_timeout_ms
				.filter(|v| *v > 0)
				.map(Duration::from_millis)
				.unwrap_or(defaults.request_timeout),
		}
	}
}

impl HubConfig {
	fn from_file(file: FileConfig) -> Self {
		let defaults = HubSettings::default();
		let ms = |v: Option<u64>, d: Duration| v.map(Duration::from_millis).unwrap_or(d);

		Self {
			server: ServerSettings {
				server_name: non_empty(file.server.server_name),
				tls_cert_path: non_empty(file.server.tls_cert_path).map(PathBuf::from),
				tls_key_path: non_empty(file.server.tls_key_path).map(PathBuf::from),
				metrics_bind: non_empty(file.server.metrics_bind),
				health_bind: non_empty(file.server.health_bind),
				auth_hmac_secret: non_empty(file.server.auth_hmac_secret).map(SecretString::new),
			},
			hub: HubSettings {
				dispatch_queue_capacity: file
					.hub
					.dispatch_queue_capacity
					.filter(|v| *v > 0)
					.unwrap_or(defaults.dispatch_queue_capacity),
				publish_timeout: ms(file.hub.publish_timeout_ms, defaults.publish_timeout),
				delivery_timeout: ms(file.hub.delivery_timeout_ms, defaults.delivery_timeout),
				evict_after_failures: file.hub.evict_after_failures.unwrap_or(defaults.evict_after_failures),
				drain_timeout: ms(file.hub.drain_timeout_ms, defaults.drain_timeout),
				deliver_to_sender: file.hub.deliver_to_sender.unwrap_or(defaults.deliver_to_sender),
				outbound_queue_capacity: file
					.hub
					.outbound_queue_capacity
					.filter(|v| *v > 0)
					.unwrap_or(defaults.outbound_queue_capacity),
				hello_timeout: ms(file.hub.hello_timeout_ms.filter(|v| *v > 0), defaults.hello_timeout),
				write_timeout: ms(file.hub.write_timeout_ms.filter(|v| *v > 0), defaults.write_timeout),
				max_frame_bytes: file
					.hub
					.max_frame_bytes
					.filter(|v| *v > 0)
					.map(clamp_frame_bytes)
					.unwrap_or(defaults.max_frame_bytes),
			},
			identity: PeerSettings::from_file(file.identity),
			rooms: RoomsSettings {
				peer: PeerSettings::from_file(file.rooms.peer),
				default_rooms: file.rooms.default_rooms,
				static_rooms: file.rooms.static_rooms,
			},
			persistence: PersistenceSettings {
				database_url: non_empty(file.persistence.database_url),
			},
		}
	}
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn apply_env_overrides(cfg: &mut HubConfig, env: impl Fn(&str) -> Option<String>) {
	let string = |key: &str| non_empty(env(key));
	let millis = |key: &str| string(key).and_then(|v| v.parse::<u64>().ok()).map(Duration::from_millis);

	if let Some(v) = string("RELAY_SERVER_NAME") {
		cfg.server.server_name = Some(v);
		info!("server config: server_name overridden by env");
	}

	if let Some(v) = string("RELAY_TLS_CERT") {
		cfg.server.tls_cert_path = Some(PathBuf::from(v));
		info!("server config: tls_cert_path overridden by env");
	}

	if let Some(v) = string("RELAY_TLS_KEY") {
		cfg.server.tls_key_path = Some(PathBuf::from(v));
		info!("server config: tls_key_path overridden by env");
	}

	if let Some(v) = string("RELAY_METRICS_BIND") {
		cfg.server.metrics_bind = Some(v);
		info!("server config: metrics_bind overridden by env");
	}

	if let Some(v) = string("RELAY_HEALTH_BIND") {
		cfg.server.health_bind = Some(v);
		info!("server config: health_bind overridden by env");
	}

	if let Some(v) = string("RELAY_AUTH_HMAC_SECRET") {
		cfg.server.auth_hmac_secret = Some(SecretString::new(v));
		info!("server auth: auth_hmac_secret overridden by env");
	}

	if let Some(capacity) = string("RELAY_DISPATCH_QUEUE_CAPACITY").and_then(|v| v.parse::<usize>().ok())
		&& capacity > 0
	{
		cfg.hub.dispatch_queue_capacity = capacity;
		info!(capacity, "hub config: dispatch_queue_capacity overridden by env");
	}

	if let Some(d) = millis("RELAY_PUBLISH_TIMEOUT_MS") {
		cfg.hub.publish_timeout = d;
		info!(ms = d.as_millis() as u64, "hub config: publish_timeout overridden by env");
	}

	if let Some(d) = millis("RELAY_DELIVERY_TIMEOUT_MS") {
		cfg.hub.delivery_timeout = d;
		info!(ms = d.as_millis() as u64, "hub config: delivery_timeout overridden by env");
	}

	if let Some(n) = string("RELAY_EVICT_AFTER_FAILURES").and_then(|v| v.parse::<u32>().ok()) {
		cfg.hub.evict_after_failures = n;
		info!(failures = n, "hub config: evict_after_failures overridden by env");
	}

	if let Some(d) = millis("RELAY_DRAIN_TIMEOUT_MS") {
		cfg.hub.drain_timeout = d;
		info!(ms = d.as_millis() as u64, "hub config: drain_timeout overridden by env");
	}

	if let Some(d) = millis("RELAY_HELLO_TIMEOUT_MS").filter(|d| !d.is_zero()) {
		cfg.hub.hello_timeout = d;
		info!(ms = d.as_millis() as u64, "hub config: hello_timeout overridden by env");
	}

	if let Some(d) = millis("RELAY_WRITE_TIMEOUT_MS").filter(|d| !d.is_zero()) {
		cfg.hub.write_timeout = d;
		info!(ms = d.as_millis() as u64, "hub config: write_timeout overridden by env");
	}

	if let Some(v) = string("RELAY_DELIVER_TO_SENDER") {
		match parse_env_bool(&v) {
			Some(enabled) => {
				cfg.hub.deliver_to_sender = enabled;
				info!(enabled, "hub config: deliver_to_sender overridden by env");
			}
			None => warn!(value = %v, "RELAY_DELIVER_TO_SENDER is not a boolean; ignored"),
		}
	}

	if let Some(v) = string("RELAY_IDENTITY_ENDPOINT") {
		cfg.identity.endpoint = Some(v);
		info!("identity config: endpoint overridden by env");
	}

	if let Some(v) = string("RELAY_ROOMS_ENDPOINT") {
		cfg.rooms.peer.endpoint = Some(v);
		info!("rooms config: endpoint overridden by env");
	}

	if let Some(v) = string("RELAY_DEFAULT_ROOMS") {
		cfg.rooms.default_rooms = v
			.split(',')
			.map(str::trim)
			.filter(|s| !s.is_empty())
			.map(str::to_string)
			.collect();
		info!(rooms = cfg.rooms.default_rooms.len(), "rooms config: default_rooms overridden by env");
	}

	if let Some(v) = string("RELAY_DATABASE_URL") {
		cfg.persistence.database_url = Some(v);
		info!("persistence: database_url overridden by env");
	}

	if cfg.server.tls_cert_path.is_some() != cfg.server.tls_key_path.is_some() {
		warn!("server config: tls_cert_path and tls_key_path must be set together; using a dev certificate");
	}
}
