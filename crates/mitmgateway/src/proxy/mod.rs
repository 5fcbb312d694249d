//! The serving core: the outer proxy listener, the loopback inner listeners,
//! and the CONNECT dispatch between them.
//!
//! One plain listener faces clients. CONNECTs are sniffed and spliced onto a
//! loopback inner listener (plain HTTP, or a per-host TLS listener from the
//! pool); everything the inner listeners accept flows through the middleware
//! pipeline. WebSocket upgrades peel off into the bridge.

pub mod connect;
pub mod hostport;
pub mod pool;
pub mod registry;
pub mod websocket;

use std::convert::Infallible;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use rustls_pki_types::CertificateDer;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::AbortHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::Protocol;
use crate::ca::{CertificateAuthority, RcgenAuthority};
use crate::client::Client;
use crate::http::{Body, BoxError, boxed, status_response};
use crate::pipeline::{Chain, Context, Middleware};
use crate::proxy::pool::ServerPool;
use crate::proxy::registry::{ConnectInfo, ConnectRegistry};
use crate::sysproxy::{NoSystemProxy, SystemProxyResolver, SystemProxySnapshot, UpstreamProxyConfig};

#[derive(thiserror::Error, Debug)]
pub enum ProxyError {
	/// I/O toward the client; closes the transaction.
	#[error("client socket error: {0}")]
	ClientSocket(#[source] std::io::Error),

	/// I/O toward the origin or upstream proxy; surfaces as 502.
	#[error("upstream socket error: {0}")]
	UpstreamSocket(#[source] std::io::Error),

	/// Absorbed silently; never reported.
	#[error("connection reset by peer")]
	ConnectionReset,

	/// Certificate mint or ephemeral bind failed.
	#[error("tls pool error: {0}")]
	TlsPool(String),

	/// The chosen upstream proxy cannot be reached or the PAC policy failed.
	#[error("upstream unavailable: {0}")]
	UpstreamUnavailable(String),

	/// Escaped from user middleware; surfaces as 500 unless the middleware
	/// already wrote a response.
	#[error("middleware error: {0}")]
	Middleware(#[source] BoxError),

	/// Malformed request-target or missing Host; surfaces as 400.
	#[error("malformed request: {0}")]
	Protocol(String),

	#[error("upstream http error: {0}")]
	UpstreamHttp(#[source] hyper::Error),
}

impl ProxyError {
	pub fn status(&self) -> http::StatusCode {
		match self {
			ProxyError::Protocol(_) => http::StatusCode::BAD_REQUEST,
			ProxyError::Middleware(_) => http::StatusCode::INTERNAL_SERVER_ERROR,
			_ => http::StatusCode::BAD_GATEWAY,
		}
	}

	/// Connection resets are absorbed without reporting.
	pub fn is_silent(&self) -> bool {
		matches!(self, ProxyError::ConnectionReset)
	}

	pub(crate) fn internal(msg: impl Into<String>) -> Self {
		ProxyError::Middleware(msg.into().into())
	}

	pub(crate) fn client_io(err: std::io::Error) -> Self {
		if err.kind() == std::io::ErrorKind::ConnectionReset {
			ProxyError::ConnectionReset
		} else {
			ProxyError::ClientSocket(err)
		}
	}

	pub(crate) fn upstream_io(err: std::io::Error) -> Self {
		if err.kind() == std::io::ErrorKind::ConnectionReset {
			ProxyError::ConnectionReset
		} else {
			ProxyError::UpstreamSocket(err)
		}
	}
}

/// Process-wide error observer. Every uncaught socket and server error lands
/// here; resets are dropped on the floor.
#[derive(Clone, Default)]
pub struct ErrorSink {
	observer: Option<UnboundedSender<ProxyError>>,
}

impl ErrorSink {
	pub(crate) fn emit(&self, err: ProxyError) {
		if err.is_silent() {
			return;
		}
		warn!(target: "proxy", error = %err, "uncaught error");
		if let Some(tx) = &self.observer {
			let _ = tx.send(err);
		}
	}
}

pub(crate) struct ProxyState {
	pub(crate) ca: Arc<dyn CertificateAuthority>,
	pub(crate) chain: Chain,
	pub(crate) registry: ConnectRegistry,
	pub(crate) pool: ServerPool,
	pub(crate) errors: ErrorSink,
	/// Loopback address the inner listeners bind on.
	pub(crate) bind_ip: IpAddr,
	/// Port of the plain inner HTTP listener.
	pub(crate) plain_port: u16,
	pub(crate) shutdown: CancellationToken,
}

pub struct ProxyBuilder {
	listen: SocketAddr,
	ca: Option<Arc<dyn CertificateAuthority>>,
	middleware: Vec<Arc<dyn Middleware>>,
	snapshot: Arc<dyn SystemProxySnapshot>,
	upstream: UpstreamProxyConfig,
	extra_roots: Vec<CertificateDer<'static>>,
	observer: Option<UnboundedSender<ProxyError>>,
}

impl ProxyBuilder {
	/// Address of the outer listener.
	pub fn listen(mut self, addr: SocketAddr) -> Self {
		self.listen = addr;
		self
	}

	/// Certificate authority minting leaf certificates for intercepted
	/// hosts. A fresh in-memory root is generated when unset.
	pub fn certificate_authority(mut self, ca: Arc<dyn CertificateAuthority>) -> Self {
		self.ca = Some(ca);
		self
	}

	/// Append a user middleware; runs between summary and gunzip in
	/// registration order.
	pub fn middleware(mut self, mw: Arc<dyn Middleware>) -> Self {
		self.middleware.push(mw);
		self
	}

	/// OS-level proxy discovery hook.
	pub fn system_proxy(mut self, snapshot: Arc<dyn SystemProxySnapshot>) -> Self {
		self.snapshot = snapshot;
		self
	}

	/// Pin upstream-proxy settings; these win over OS and environment.
	pub fn upstream(mut self, cfg: UpstreamProxyConfig) -> Self {
		self.upstream = cfg;
		self
	}

	/// Extra root certificates trusted when connecting to origins.
	pub fn extra_root_ca(mut self, cert: CertificateDer<'static>) -> Self {
		self.extra_roots.push(cert);
		self
	}

	/// Channel receiving every uncaught error.
	pub fn error_observer(mut self, tx: UnboundedSender<ProxyError>) -> Self {
		self.observer = Some(tx);
		self
	}

	/// Bind the outer listener and the plain inner listener.
	pub async fn bind(self) -> anyhow::Result<Proxy> {
		let ca: Arc<dyn CertificateAuthority> = match self.ca {
			Some(ca) => ca,
			None => Arc::new(RcgenAuthority::generate()?),
		};
		let client = Client::new(&self.extra_roots)?;
		let resolver = Arc::new(SystemProxyResolver::new(self.snapshot));
		let chain = Chain::new(resolver, self.upstream, client, self.middleware);

		let outer = TcpListener::bind(self.listen).await?;
		let local_addr = outer.local_addr()?;
		// Inner listeners stay on loopback; they are never exposed beyond it.
		let bind_ip = IpAddr::V4(Ipv4Addr::LOCALHOST);
		let plain = TcpListener::bind((bind_ip, 0)).await?;
		let plain_port = plain.local_addr()?.port();

		let state = Arc::new(ProxyState {
			ca,
			chain,
			registry: ConnectRegistry::default(),
			pool: ServerPool::default(),
			errors: ErrorSink {
				observer: self.observer,
			},
			bind_ip,
			plain_port,
			shutdown: CancellationToken::new(),
		});
		Ok(Proxy {
			state,
			outer,
			plain,
			local_addr,
		})
	}
}

pub struct Proxy {
	pub(crate) state: Arc<ProxyState>,
	outer: TcpListener,
	plain: TcpListener,
	local_addr: SocketAddr,
}

/// Control handle detached from the serving future.
#[derive(Clone)]
pub struct ProxyHandle {
	state: Arc<ProxyState>,
}

impl ProxyHandle {
	/// Close the outer listener, then every owned pool listener, then forget
	/// the pool. Calling this twice is a no-op the second time.
	pub fn shutdown(&self) {
		self.state.shutdown.cancel();
		self.state.pool.shutdown();
	}
}

impl Proxy {
	pub fn builder() -> ProxyBuilder {
		ProxyBuilder {
			listen: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
			ca: None,
			middleware: Vec::new(),
			snapshot: Arc::new(NoSystemProxy),
			upstream: UpstreamProxyConfig::default(),
			extra_roots: Vec::new(),
			observer: None,
		}
	}

	pub fn local_addr(&self) -> SocketAddr {
		self.local_addr
	}

	pub fn handle(&self) -> ProxyHandle {
		ProxyHandle {
			state: self.state.clone(),
		}
	}

	/// Serve until shut down.
	pub async fn serve(self) -> anyhow::Result<()> {
		let Proxy {
			state,
			outer,
			plain,
			local_addr,
		} = self;
		info!("proxy listening on {local_addr}");

		let plain_state = state.clone();
		tokio::spawn(async move {
			serve_plain_listener(plain_state, plain).await;
		});

		loop {
			tokio::select! {
				_ = state.shutdown.cancelled() => break,
				accepted = outer.accept() => match accepted {
					Ok((tcp, peer)) => {
						let state = state.clone();
						tokio::spawn(async move {
							serve_outer_connection(state, tcp, peer).await;
						});
					},
					Err(e) => {
						state.errors.emit(ProxyError::client_io(e));
					},
				},
			}
		}
		Ok(())
	}
}

async fn serve_outer_connection(state: Arc<ProxyState>, tcp: TcpStream, peer: SocketAddr) {
	let _ = tcp.set_nodelay(true);
	let service_state = state.clone();
	let service = service_fn(move |req: http::Request<Incoming>| {
		let state = service_state.clone();
		async move {
			let resp = if req.method() == http::Method::CONNECT {
				connect::handle(state, req, peer)
			} else if req.uri().scheme().is_some() {
				if hyper_tungstenite::is_upgrade_request(&req) {
					websocket::bridge(state, req, Protocol::Http, None).await
				} else {
					handle_request(state, req.map(boxed), Protocol::Http, None, peer).await
				}
			} else {
				status_response(
					http::StatusCode::BAD_REQUEST,
					"proxy requests must use absolute-form targets",
				)
			};
			Ok::<_, Infallible>(resp)
		}
	});
	if let Err(e) = hyper::server::conn::http1::Builder::new()
		.preserve_header_case(true)
		.serve_connection(TokioIo::new(tcp), service)
		.with_upgrades()
		.await
	{
		debug!("client connection ended: {e}");
	}
}

async fn serve_plain_listener(state: Arc<ProxyState>, listener: TcpListener) {
	loop {
		tokio::select! {
			_ = state.shutdown.cancelled() => break,
			accepted = listener.accept() => match accepted {
				Ok((tcp, _)) => {
					let state = state.clone();
					tokio::spawn(async move {
						serve_intercepted_connection(state, tcp, Protocol::Http).await;
					});
				},
				Err(e) => state.errors.emit(ProxyError::client_io(e)),
			},
		}
	}
}

/// Accept loop for one pool listener. Returned handle is owned by the pool
/// entry and aborted at shutdown.
pub(crate) fn spawn_tls_listener(
	state: Arc<ProxyState>,
	listener: TcpListener,
	acceptor: TlsAcceptor,
) -> AbortHandle {
	tokio::spawn(async move {
		loop {
			tokio::select! {
				_ = state.shutdown.cancelled() => break,
				accepted = listener.accept() => match accepted {
					Ok((tcp, _)) => {
						let state = state.clone();
						let acceptor = acceptor.clone();
						tokio::spawn(async move {
							let local_port = tcp.local_addr().map(|a| a.port()).unwrap_or_default();
							let peer_port = tcp.peer_addr().map(|a| a.port()).unwrap_or_default();
							match acceptor.accept(tcp).await {
								Ok(tls) => {
									serve_inner_io(state, tls, Protocol::Https, local_port, peer_port).await;
								},
								Err(e) => state.errors.emit(ProxyError::client_io(e)),
							}
						});
					},
					Err(e) => state.errors.emit(ProxyError::client_io(e)),
				},
			}
		}
	})
	.abort_handle()
}

async fn serve_intercepted_connection(state: Arc<ProxyState>, tcp: TcpStream, protocol: Protocol) {
	let local_port = tcp.local_addr().map(|a| a.port()).unwrap_or_default();
	let peer_port = tcp.peer_addr().map(|a| a.port()).unwrap_or_default();
	serve_inner_io(state, tcp, protocol, local_port, peer_port).await;
}

/// Serve HTTP on an inner connection. The `(local_port, peer_port)` pair is
/// the CONNECT-registry key for everything this connection carries.
async fn serve_inner_io<S>(
	state: Arc<ProxyState>,
	io: S,
	protocol: Protocol,
	local_port: u16,
	peer_port: u16,
) where
	S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
	let service_state = state.clone();
	let service = service_fn(move |req: http::Request<Incoming>| {
		let state = service_state.clone();
		async move {
			let connect = state.registry.lookup((local_port, peer_port));
			let peer = connect
				.as_ref()
				.map(|c| c.client_addr)
				.unwrap_or_else(|| SocketAddr::new(state.bind_ip, peer_port));
			let resp = if hyper_tungstenite::is_upgrade_request(&req) {
				websocket::bridge(state, req, protocol, connect).await
			} else {
				handle_request(state, req.map(boxed), protocol, connect, peer).await
			};
			Ok::<_, Infallible>(resp)
		}
	});
	if let Err(e) = hyper::server::conn::http1::Builder::new()
		.preserve_header_case(true)
		.serve_connection(TokioIo::new(io), service)
		.with_upgrades()
		.await
	{
		debug!("inner connection ended: {e}");
	}
}

/// Pipeline intake: bind the request to its CONNECT (when the socket pair
/// has one), fix up protocol and client address, and run the chain.
async fn handle_request(
	state: Arc<ProxyState>,
	mut req: http::Request<Body>,
	protocol: Protocol,
	connect: Option<Arc<ConnectInfo>>,
	peer: SocketAddr,
) -> http::Response<Body> {
	let host_port = match hostport::from_request(&mut req) {
		Ok(hp) => hp,
		Err(e) => return error_response(&state, e),
	};
	let port = host_port
		.port
		.or_else(|| connect.as_ref().map(|c| c.port))
		.unwrap_or_else(|| protocol.default_port());
	let mut ctx = Context::new(protocol, host_port.host, port, peer, req, connect);
	match state.chain.run(&mut ctx).await {
		Ok(resp) => resp,
		Err(e) => error_response(&state, e),
	}
}

/// Convert an escaped error into the terminating response and forward it to
/// the error observer.
pub(crate) fn error_response(state: &ProxyState, err: ProxyError) -> http::Response<Body> {
	let resp = status_response(err.status(), &err.to_string());
	state.errors.emit(err);
	resp
}
