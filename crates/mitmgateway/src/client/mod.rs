//! Outbound side of the proxy: picks how a request reaches its origin and
//! issues it.
//!
//! Exactly one transport is chosen per request, in strict priority order:
//! PAC, then SOCKS, then the protocol-matched HTTP(S) upstream, then a direct
//! connection. The choice is recorded into the request summary so observers
//! can see which upstream carried the traffic.

pub mod pac;

mod connect_tunnel;
mod socks_tunnel;
mod tls;

use std::net::IpAddr;
use std::sync::Arc;

use http_body_util::BodyExt;
use hyper_util::rt::TokioIo;
use rustls::{ClientConfig, RootCertStore};
use rustls_pki_types::CertificateDer;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, warn};
use url::Url;

use crate::Protocol;
use crate::http::{Body, boxed};
use crate::proxy::ProxyError;
use crate::sysproxy::UpstreamProxyConfig;

pub trait Io: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Io for T {}

/// Established transports stack TLS over tunnels over TCP, so everything is
/// erased to a boxed stream once connected.
pub type BoxedIo = Box<dyn Io>;

/// How one request reaches its origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
	Direct,
	/// An upstream HTTP(S) forward proxy. `tunnel` is set when the origin
	/// protocol is https, in which case a CONNECT tunnel is opened first.
	HttpProxy { proxy: Url, tunnel: bool },
	/// SOCKS5 upstream.
	Socks { proxy: Url },
}

/// What the summary records about the chosen upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxySummary {
	pub kind: &'static str,
	pub address: String,
}

pub struct Selection {
	pub transport: Transport,
	pub summary: Option<ProxySummary>,
}

/// Upstream HTTP client. One instance is shared across all requests; each
/// request establishes its own connection according to its [`Selection`].
#[derive(Clone)]
pub struct Client {
	tls: Arc<ClientConfig>,
}

impl Client {
	/// Build the client trust store from the platform roots plus any extra
	/// roots (test CAs, corporate roots).
	pub fn new(extra_roots: &[CertificateDer<'static>]) -> anyhow::Result<Self> {
		let mut roots = RootCertStore::empty();
		let native = rustls_native_certs::load_native_certs();
		for err in &native.errors {
			warn!("failed to load a native root certificate: {err}");
		}
		for cert in native.certs {
			let _ = roots.add(cert);
		}
		for cert in extra_roots {
			roots.add(cert.clone())?;
		}
		let mut cfg = ClientConfig::builder()
			.with_root_certificates(roots)
			.with_no_client_auth();
		cfg.alpn_protocols = vec![b"http/1.1".to_vec()];
		Ok(Self { tls: Arc::new(cfg) })
	}

	/// Choose the transport for one request: PAC, then SOCKS, then the
	/// protocol-matched HTTP(S) upstream, then direct.
	pub async fn select(
		&self,
		cfg: &UpstreamProxyConfig,
		protocol: Protocol,
		url: &str,
		host: &str,
	) -> Result<Selection, ProxyError> {
		if let Some(pac_url) = &cfg.pac {
			let transport = match pac::select(self, pac_url, url, host).await? {
				pac::PacDirective::Direct => Transport::Direct,
				pac::PacDirective::Proxy(proxy) => Transport::HttpProxy {
					proxy,
					tunnel: protocol == Protocol::Https,
				},
				pac::PacDirective::Socks(proxy) => Transport::Socks { proxy },
			};
			return Ok(Selection {
				transport,
				summary: Some(ProxySummary {
					kind: "PAC",
					address: pac_url.to_string(),
				}),
			});
		}
		if let Some(socks) = &cfg.socks {
			return Ok(Selection {
				transport: Transport::Socks {
					proxy: socks.clone(),
				},
				summary: Some(ProxySummary {
					kind: "SOCKS",
					address: socks.to_string(),
				}),
			});
		}
		let matched = match protocol {
			Protocol::Https => cfg.https.as_ref().map(|u| (u, "HTTPS")),
			Protocol::Http => cfg.http.as_ref().map(|u| (u, "HTTP")),
		};
		if let Some((proxy, kind)) = matched {
			return Ok(Selection {
				transport: Transport::HttpProxy {
					proxy: proxy.clone(),
					tunnel: protocol == Protocol::Https,
				},
				summary: Some(ProxySummary {
					kind,
					address: proxy.to_string(),
				}),
			});
		}
		Ok(Selection {
			transport: Transport::Direct,
			summary: None,
		})
	}

	/// Issue one request over a fresh connection built for `transport`.
	pub async fn request(
		&self,
		transport: &Transport,
		protocol: Protocol,
		host: &str,
		port: u16,
		mut req: http::Request<Body>,
	) -> Result<http::Response<Body>, ProxyError> {
		let io = self
			.establish(transport, host, port, protocol == Protocol::Https)
			.await?;

		// A plain-HTTP forward proxy needs the absolute request-target;
		// everything else gets origin-form.
		let absolute = matches!(
			transport,
			Transport::HttpProxy { tunnel: false, .. }
		);
		set_request_target(&mut req, absolute, protocol, host, port)?;

		let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(io))
			.await
			.map_err(ProxyError::UpstreamHttp)?;
		tokio::spawn(async move {
			if let Err(e) = conn.await {
				debug!("upstream connection ended: {e}");
			}
		});
		let resp = sender
			.send_request(req)
			.await
			.map_err(ProxyError::UpstreamHttp)?;
		Ok(resp.map(boxed))
	}

	async fn establish(
		&self,
		transport: &Transport,
		host: &str,
		port: u16,
		tls_to_origin: bool,
	) -> Result<BoxedIo, ProxyError> {
		let io: BoxedIo = match transport {
			Transport::Direct => Box::new(dial(host, port).await?),
			Transport::HttpProxy { proxy, tunnel } => {
				let mut io = self.dial_proxy(proxy).await?;
				if *tunnel {
					connect_tunnel::handshake(&mut io, &format!("{host}:{port}")).await?;
				}
				io
			},
			Transport::Socks { proxy } => Box::new(socks_tunnel::connect(proxy, host, port).await?),
		};
		if tls_to_origin {
			tls::handshake(io, self.tls.clone(), host).await
		} else {
			Ok(io)
		}
	}

	async fn dial_proxy(&self, proxy: &Url) -> Result<BoxedIo, ProxyError> {
		let host = proxy
			.host_str()
			.ok_or_else(|| ProxyError::UpstreamUnavailable(format!("proxy url has no host: {proxy}")))?;
		let port = proxy
			.port_or_known_default()
			.ok_or_else(|| ProxyError::UpstreamUnavailable(format!("proxy url has no port: {proxy}")))?;
		let tcp = dial(host, port)
			.await
			.map_err(|e| ProxyError::UpstreamUnavailable(format!("{proxy}: {e}")))?;
		if proxy.scheme() == "https" {
			tls::handshake(Box::new(tcp), self.tls.clone(), host).await
		} else {
			Ok(Box::new(tcp))
		}
	}

	/// Plain GET used for PAC retrieval, over a direct connection.
	pub(crate) async fn fetch_text(&self, url: &Url) -> Result<String, ProxyError> {
		let host = url
			.host_str()
			.ok_or_else(|| ProxyError::UpstreamUnavailable(format!("url has no host: {url}")))?
			.to_string();
		let port = url
			.port_or_known_default()
			.ok_or_else(|| ProxyError::UpstreamUnavailable(format!("url has no port: {url}")))?;
		let protocol = if url.scheme() == "https" {
			Protocol::Https
		} else {
			Protocol::Http
		};
		let mut path = url.path().to_string();
		if let Some(q) = url.query() {
			path = format!("{path}?{q}");
		}
		let req = http::Request::builder()
			.method(http::Method::GET)
			.uri(path)
			.header(http::header::HOST, &host)
			.body(crate::http::empty())
			.map_err(|e| ProxyError::UpstreamUnavailable(e.to_string()))?;
		let resp = self
			.request(&Transport::Direct, protocol, &host, port, req)
			.await?;
		if !resp.status().is_success() {
			return Err(ProxyError::UpstreamUnavailable(format!(
				"fetching {url} returned {}",
				resp.status()
			)));
		}
		let body = resp
			.into_body()
			.collect()
			.await
			.map_err(|e| ProxyError::UpstreamUnavailable(format!("reading {url}: {e}")))?
			.to_bytes();
		String::from_utf8(body.to_vec())
			.map_err(|e| ProxyError::UpstreamUnavailable(format!("{url} is not utf-8: {e}")))
	}
}

async fn dial(host: &str, port: u16) -> Result<TcpStream, ProxyError> {
	let stream = if let Ok(ip) = host.parse::<IpAddr>() {
		TcpStream::connect((ip, port)).await
	} else {
		TcpStream::connect((host, port)).await
	}
	.map_err(ProxyError::upstream_io)?;
	let _ = stream.set_nodelay(true);
	Ok(stream)
}

/// Rewrite the request-target for the wire: absolute-form toward a plain
/// forward proxy, origin-form otherwise.
fn set_request_target(
	req: &mut http::Request<Body>,
	absolute: bool,
	protocol: Protocol,
	host: &str,
	port: u16,
) -> Result<(), ProxyError> {
	let path_and_query = req
		.uri()
		.path_and_query()
		.map(|pq| pq.as_str())
		.filter(|pq| !pq.is_empty())
		.unwrap_or("/")
		.to_string();
	let target = if absolute {
		if port == protocol.default_port() {
			format!("{}://{host}{path_and_query}", protocol.scheme())
		} else {
			format!("{}://{host}:{port}{path_and_query}", protocol.scheme())
		}
	} else {
		path_and_query
	};
	*req.uri_mut() = target
		.parse()
		.map_err(|e| ProxyError::Protocol(format!("invalid request target {target}: {e}")))?;
	Ok(())
}
