use std::net::SocketAddr;
use std::sync::Arc;

use crate::Protocol;
use crate::client::{ProxySummary, Transport};
use crate::http::Body;
use crate::proxy::registry::ConnectInfo;
use crate::sysproxy::UpstreamProxyConfig;

/// Per-transaction state threaded through the middleware chain.
///
/// Created when an inner listener (or the outer proxy-form path) takes in a
/// request, mutated by middleware, dropped when the response completes.
pub struct Context {
	/// Whether the request arrived on the plain inner listener or one of the
	/// TLS pool listeners.
	pub protocol: Protocol,
	pub hostname: String,
	pub port: u16,
	/// The real client address; for intercepted requests this comes from the
	/// originating CONNECT, not the loopback splice.
	pub client_addr: SocketAddr,
	/// Upstream-proxy configuration resolved for this request.
	pub proxy: UpstreamProxyConfig,
	/// The request to forward. The terminal middleware takes it; middleware
	/// that wants to rewrite it mutates in place.
	pub request: Option<http::Request<Body>>,
	/// Observation record emitted when the transaction finishes.
	pub summary: Summary,
	/// Back-pointer to the originating CONNECT, when the request came through
	/// an intercepted tunnel.
	pub connect: Option<Arc<ConnectInfo>>,
	/// Transport decision made by the upstream selector.
	pub transport: Option<Transport>,
	/// Scratch space for user middleware.
	pub extensions: http::Extensions,
}

#[derive(Debug, Default, Clone)]
pub struct Summary {
	pub method: Option<http::Method>,
	pub target: String,
	pub status: Option<http::StatusCode>,
	pub proxy: Option<ProxySummary>,
}

impl Context {
	pub fn new(
		protocol: Protocol,
		hostname: String,
		port: u16,
		client_addr: SocketAddr,
		request: http::Request<Body>,
		connect: Option<Arc<ConnectInfo>>,
	) -> Self {
		let summary = Summary {
			method: Some(request.method().clone()),
			target: absolute_url(protocol, &hostname, port, request.uri()),
			status: None,
			proxy: None,
		};
		Self {
			protocol,
			hostname,
			port,
			client_addr,
			proxy: UpstreamProxyConfig::default(),
			request: Some(request),
			summary,
			connect,
			transport: None,
			extensions: http::Extensions::new(),
		}
	}

	/// The absolute URL of this transaction, used for PAC evaluation and the
	/// summary record.
	pub fn url(&self) -> String {
		self.summary.target.clone()
	}
}

fn absolute_url(protocol: Protocol, hostname: &str, port: u16, uri: &http::Uri) -> String {
	let path = uri
		.path_and_query()
		.map(|pq| pq.as_str())
		.filter(|pq| !pq.is_empty())
		.unwrap_or("/");
	if port == protocol.default_port() {
		format!("{}://{hostname}{path}", protocol.scheme())
	} else {
		format!("{}://{hostname}:{port}{path}", protocol.scheme())
	}
}
