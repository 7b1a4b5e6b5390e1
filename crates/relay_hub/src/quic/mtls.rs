#![forbid(unsafe_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use relay_protocol::version::PEER_ALPN;

use super::config::{load_cert_chain, load_private_key};

/// Client config for a peer link: private-CA roots plus the hub's own client certificate.
pub fn peer_client_config(ca_path: &Path, cert_path: &Path, key_path: &Path) -> anyhow::Result<quinn::ClientConfig> {
	let mut roots = rustls::RootCertStore::empty();
	for ca in load_cert_chain(ca_path)? {
		roots.add(ca).map_err(|e| anyhow!("add peer ca: {e}"))?;
	}

	let mut tls_config = rustls::ClientConfig::builder()
		.with_root_certificates(roots)
		.with_client_auth_cert(load_cert_chain(cert_path)?, load_private_key(key_path)?)
		.context("build rustls peer client config")?;
	tls_config.alpn_protocols = vec![PEER_ALPN.to_vec()];

	let quic_tls = quinn::crypto::rustls::QuicClientConfig::try_from(tls_config)
		.context("convert rustls ClientConfig -> quinn QuicClientConfig")?;

	let mut client_config = quinn::ClientConfig::new(Arc::new(quic_tls));
	let mut transport = quinn::TransportConfig::default();
	transport.keep_alive_interval(Some(Duration::from_secs(15)));
	client_config.transport_config(Arc::new(transport));

	Ok(client_config)
}
