//! An intercepting HTTP/HTTPS/WebSocket proxy.
//!
//! Clients point their proxy settings at the listener; TLS toward the client
//! is terminated with dynamically minted certificates, requests are
//! re-originated toward the true origin (optionally through an upstream
//! HTTP, HTTPS, SOCKS, or PAC-selected proxy), and every request/response
//! pair runs through a middleware pipeline that may observe or rewrite it.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use serde::Deserialize;

pub mod ca;
pub mod client;
pub mod http;
pub mod pipeline;
pub mod proxy;
pub mod sysproxy;

pub use pipeline::{Chain, Context, Middleware, Next, Summary};
pub use proxy::{ErrorSink, Proxy, ProxyBuilder, ProxyError, ProxyHandle};

/// Pin the process-default rustls crypto provider. Call once at startup;
/// calling again is harmless.
pub fn install_default_crypto() {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

/// Which side of the interception a request arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
	Http,
	Https,
}

impl Protocol {
	pub fn scheme(self) -> &'static str {
		match self {
			Protocol::Http => "http",
			Protocol::Https => "https",
		}
	}

	pub fn ws_scheme(self) -> &'static str {
		match self {
			Protocol::Http => "ws",
			Protocol::Https => "wss",
		}
	}

	pub fn default_port(self) -> u16 {
		match self {
			Protocol::Http => 80,
			Protocol::Https => 443,
		}
	}
}

impl std::fmt::Display for Protocol {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.scheme())
	}
}

/// What a user can write in the config file. Converted into [`Config`].
#[derive(Deserialize, Default, Clone, Debug)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RawConfig {
	/// Listen address, `ip:port` or `localhost:port`.
	listen: Option<String>,
	ca: Option<RawCa>,
	upstream: Option<RawUpstream>,
	logging: Option<RawLogging>,
}

#[derive(Deserialize, Default, Clone, Debug)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawCa {
	/// PEM file holding the root CA private key. The root certificate is
	/// derived from it; absent, an ephemeral root is generated at startup.
	key_path: Option<PathBuf>,
}

#[derive(Deserialize, Default, Clone, Debug)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawUpstream {
	http: Option<String>,
	https: Option<String>,
	socks: Option<String>,
	pac: Option<String>,
}

#[derive(Deserialize, Default, Clone, Debug)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawLogging {
	filter: Option<String>,
}

#[derive(Clone, Debug)]
pub struct Config {
	pub listen: SocketAddr,
	pub ca_key_path: Option<PathBuf>,
	pub upstream: sysproxy::UpstreamProxyConfig,
	pub log_filter: Option<String>,
}

impl Default for Config {
	fn default() -> Self {
		Self {
			listen: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8888),
			ca_key_path: None,
			upstream: sysproxy::UpstreamProxyConfig::default(),
			log_filter: None,
		}
	}
}

pub fn parse_config(contents: &str) -> anyhow::Result<Config> {
	let raw: RawConfig = serde_yaml::from_str(contents)?;
	Config::from_raw(raw)
}

impl Config {
	pub fn from_raw(raw: RawConfig) -> anyhow::Result<Config> {
		let mut cfg = Config::default();
		if let Some(listen) = raw.listen {
			cfg.listen = parse_listen(&listen)?;
		}
		if let Some(ca) = raw.ca {
			cfg.ca_key_path = ca.key_path;
		}
		if let Some(upstream) = raw.upstream {
			let parse = |field: &str, v: Option<String>| -> anyhow::Result<Option<url::Url>> {
				v.map(|s| {
					url::Url::parse(&s).map_err(|e| anyhow::anyhow!("upstream.{field}: {e}"))
				})
				.transpose()
			};
			cfg.upstream = sysproxy::UpstreamProxyConfig {
				http: parse("http", upstream.http)?,
				https: parse("https", upstream.https)?,
				socks: parse("socks", upstream.socks)?,
				pac: parse("pac", upstream.pac)?,
			};
		}
		if let Some(logging) = raw.logging {
			cfg.log_filter = logging.filter;
		}
		Ok(cfg)
	}
}

fn parse_listen(s: &str) -> anyhow::Result<SocketAddr> {
	if let Some(port) = s.strip_prefix("localhost:") {
		let port: u16 = port.parse()?;
		return Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port));
	}
	Ok(s.parse()?)
}
