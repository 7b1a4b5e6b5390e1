#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context as _;
use relay_client::{ClientConfig, ClientError, HubClient, ServerEvent, ServerTrust};
use relay_util::endpoint::QuicEndpoint;
use relay_util::time::unix_ms_now;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

const DEFAULT_ENDPOINT: &str = "quic://127.0.0.1:18203";

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: relay_client [--connect quic://host:port] [--addr ip:port] [--sni name] [--token token] [--cert path]\n\
\n\
Options:\n\
	--connect   Hub endpoint (alias: --endpoint) (default: {DEFAULT_ENDPOINT})\n\
	--addr      Hub SocketAddr (overrides DNS resolution from --connect)\n\
	--sni       TLS server name (default: host from --connect)\n\
	--token     Bearer token sent in Hello (default: $RELAY_CLIENT_AUTH_TOKEN)\n\
	--cert      DER certificate to trust (default: skip verification, dev only)\n\
	--help      Show this help\n\
\n\
Input (stdin):\n\
	<room> <text>   post text to room\n\
	/ping           measure round trip\n\
	/quit           finish the stream and wait for the hub to close\n\
\n\
Examples:\n\
	relay_hub --mint-token alice | xargs -I{{}} relay_client --token {{}}\n\
	relay_client --connect quic://hub.example.com:443 --cert hub.der\n"
	);
	std::process::exit(2)
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,relay_client=debug".to_string());
	tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

struct Args {
	endpoint: QuicEndpoint,
	addr: Option<SocketAddr>,
	sni: Option<String>,
	token: String,
	cert: Option<PathBuf>,
}

fn parse_args() -> Args {
	let mut endpoint = DEFAULT_ENDPOINT.to_string();
	let mut addr: Option<SocketAddr> = None;
	let mut sni: Option<String> = None;
	let mut cert: Option<PathBuf> = None;
	let mut token: Option<String> = std::env::var("RELAY_CLIENT_AUTH_TOKEN")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--connect" | "--endpoint" => endpoint = it.next().unwrap_or_else(|| usage_and_exit()),
			"--addr" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				addr = Some(v.parse().unwrap_or_else(|_| {
					eprintln!("Invalid --addr value: {v}");
					usage_and_exit()
				}));
			}
			"--sni" => sni = Some(it.next().unwrap_or_else(|| usage_and_exit())),
			"--token" => token = Some(it.next().unwrap_or_else(|| usage_and_exit())),
			"--cert" => cert = Some(PathBuf::from(it.next().unwrap_or_else(|| usage_and_exit()))),
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	let endpoint = QuicEndpoint::parse(&endpoint).unwrap_or_else(|e| {
		eprintln!("Invalid --connect value: {endpoint}\n{e}");
		usage_and_exit()
	});

	let Some(token) = token else {
		eprintln!("An auth token is required (--token or RELAY_CLIENT_AUTH_TOKEN)");
		usage_and_exit()
	};

	Args {
		endpoint,
		addr,
		sni,
		token,
		cert,
	}
}

enum Step {
	Event(Result<ServerEvent, ClientError>),
	Line(std::io::Result<Option<String>>),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();
	let args = parse_args();

	let mut cfg = ClientConfig::new(args.endpoint, args.token);
	cfg.server_addr = args.addr.or_else(|| cfg.endpoint.to_socket_addr_if_ip_literal().ok());
	cfg.server_name = args.sni;
	if let Some(path) = args.cert {
		let der = std::fs::read(&path).with_context(|| format!("read {}", path.display()))?;
		cfg.trust = ServerTrust::Certificate(der);
	}

	info!(endpoint = %cfg.endpoint, "connecting");
	let (mut client, welcome) = HubClient::connect(cfg).await?;
	let user = welcome.user.as_ref().map(|u| u.username.as_str()).unwrap_or("<unknown>");
	println!("connected to {} as {user}; rooms: {}", welcome.server_name, welcome.room_ids.join(", "));

	let mut lines = BufReader::new(tokio::io::stdin()).lines();
	let mut stdin_open = true;

	loop {
		let step = tokio::select! {
			ev = client.next_event() => Step::Event(ev),
			line = lines.next_line(), if stdin_open => Step::Line(line),
		};

		match step {
			Step::Event(Ok(ServerEvent::Accepted { request_id, message })) => {
				println!("[{}] accepted {request_id} as {}", message.room_id, message.id);
			}
			Step::Event(Ok(ServerEvent::Delivered(m))) => println!("[{}] {}: {}", m.room_id, m.sender_id, m.text),
			Step::Event(Ok(ServerEvent::Pong(p))) => {
				println!("pong: rtt {} ms", unix_ms_now() - p.client_time_unix_ms);
			}
			Step::Event(Ok(ServerEvent::Error { code, message })) => {
				println!("hub error ({}): {message}", code.as_str_name());
			}
			Step::Event(Ok(ServerEvent::Closed)) => {
				info!("hub closed the session");
				return Ok(());
			}
			Step::Event(Err(e)) => return Err(e.into()),
			Step::Line(Ok(Some(line))) => {
				let line = line.trim();
				match line {
					"" => {}
					"/quit" => {
						client.finish()?;
						stdin_open = false;
					}
					"/ping" => {
						client.ping(unix_ms_now()).await?;
					}
					_ => match line.split_once(char::is_whitespace) {
						Some((room, text)) => {
							client.send_message(room, text.trim()).await?;
						}
						None => warn!("expected `<room> <text>`"),
					},
				}
			}
			Step::Line(Ok(None)) => {
				client.finish()?;
				stdin_open = false;
			}
			Step::Line(Err(e)) => return Err(anyhow::Error::new(e).context("read stdin")),
		}
	}
}
