//! WebSocket bridging for intercepted upgrades.
//!
//! The upstream connection is opened before the client's handshake response
//! goes out, so the client stays paused until the upstream is known good.
//! `sec-websocket*` headers from the client never reach the upstream
//! handshake; tungstenite regenerates them. Both directions are pumped by a
//! single controller task, which is also the one place close propagation and
//! its code mapping happen.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use hyper::body::Incoming;
use hyper::upgrade::Upgraded;
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::debug;

use crate::Protocol;
use crate::http::{Body, boxed};
use crate::proxy::registry::ConnectInfo;
use crate::proxy::{ProxyError, ProxyState, error_response};

#[cfg(test)]
#[path = "websocket_tests.rs"]
mod tests;

type ClientWs = WebSocketStream<TokioIo<Upgraded>>;
type ServerWs = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub(crate) async fn bridge(
	state: Arc<ProxyState>,
	mut req: http::Request<Incoming>,
	protocol: Protocol,
	connect: Option<Arc<ConnectInfo>>,
) -> http::Response<Body> {
	match upgrade_and_bridge(&state, &mut req, protocol, connect).await {
		Ok(resp) => resp,
		Err(e) => error_response(&state, e),
	}
}

async fn upgrade_and_bridge(
	state: &Arc<ProxyState>,
	req: &mut http::Request<Incoming>,
	protocol: Protocol,
	connect: Option<Arc<ConnectInfo>>,
) -> Result<http::Response<Body>, ProxyError> {
	let url = upstream_url(req, protocol, connect.as_deref())?;
	let upstream_req = upstream_request(&url, req.headers())?;

	let (response, client_ws) = hyper_tungstenite::upgrade(req, None)
		.map_err(|e| ProxyError::Protocol(format!("websocket upgrade: {e}")))?;

	// Upstream first: the handshake response to the client is withheld until
	// the upstream socket is open.
	let (server_ws, _handshake) = connect_async(upstream_req)
		.await
		.map_err(|e| ProxyError::UpstreamUnavailable(format!("websocket upstream {url}: {e}")))?;
	debug!(url, "websocket bridge established");

	let task_state = state.clone();
	tokio::spawn(async move {
		match client_ws.await {
			Ok(client_ws) => {
				if let Err(e) = pump(client_ws, server_ws).await {
					task_state.errors.emit(e);
				}
			},
			Err(e) => {
				let mut server_ws = server_ws;
				let _ = server_ws.close(None).await;
				task_state
					.errors
					.emit(ProxyError::ClientSocket(std::io::Error::other(e)));
			},
		}
	});

	Ok(response.map(boxed))
}

/// Resolve the upstream URL: an absolute request-target is used verbatim
/// (normalized onto ws/wss); a relative one combines the `Host` header, or
/// the originating CONNECT, with the scheme of the intercepted listener.
fn upstream_url<B>(
	req: &http::Request<B>,
	protocol: Protocol,
	connect: Option<&ConnectInfo>,
) -> Result<String, ProxyError> {
	let uri = req.uri();
	if uri.scheme().is_some() {
		let s = uri.to_string();
		return Ok(if let Some(rest) = s.strip_prefix("https://") {
			format!("wss://{rest}")
		} else if let Some(rest) = s.strip_prefix("http://") {
			format!("ws://{rest}")
		} else {
			s
		});
	}
	let authority = req
		.headers()
		.get(http::header::HOST)
		.and_then(|v| v.to_str().ok())
		.map(str::to_string)
		.or_else(|| {
			connect.map(|c| {
				if c.port == protocol.default_port() {
					c.host.clone()
				} else {
					format!("{}:{}", c.host, c.port)
				}
			})
		})
		.ok_or_else(|| ProxyError::Protocol("websocket upgrade without Host".to_string()))?;
	let path = uri
		.path_and_query()
		.map(|pq| pq.as_str())
		.filter(|pq| !pq.is_empty())
		.unwrap_or("/");
	Ok(format!("{}://{authority}{path}", protocol.ws_scheme()))
}

/// Build the upstream handshake request: tungstenite generates the
/// `sec-websocket*` and hop-by-hop headers, everything else is carried over
/// from the client's upgrade.
fn upstream_request(
	url: &str,
	client_headers: &http::HeaderMap,
) -> Result<tungstenite::handshake::client::Request, ProxyError> {
	let mut req = url
		.into_client_request()
		.map_err(|e| ProxyError::Protocol(format!("websocket url {url}: {e}")))?;
	for (name, value) in client_headers {
		if strip_for_upstream(name) {
			continue;
		}
		req.headers_mut().append(name.clone(), value.clone());
	}
	Ok(req)
}

/// Headers that must not be replayed on the upstream handshake. Everything
/// starting `sec-websocket` is regenerated; the rest are hop-by-hop.
fn strip_for_upstream(name: &http::HeaderName) -> bool {
	let name = name.as_str();
	name.starts_with("sec-websocket")
		|| matches!(
			name,
			"host" | "connection" | "upgrade" | "proxy-connection" | "keep-alive" | "te" | "trailer"
		)
}

/// Close codes 1004 through 1006 are reserved and must not appear on the
/// wire; an absent code is the 1005 case. All of them are forwarded as 1001.
/// The remap applies to every forwarded close, whatever state the peers are
/// in, since those codes are never legal to send.
fn map_close_frame(frame: Option<CloseFrame>) -> Option<CloseFrame> {
	match frame {
		None => Some(CloseFrame {
			code: CloseCode::Away,
			reason: Default::default(),
		}),
		Some(frame) if (1004..=1006).contains(&u16::from(frame.code)) => Some(CloseFrame {
			code: CloseCode::Away,
			reason: frame.reason,
		}),
		Some(frame) => Some(frame),
	}
}

fn should_forward(msg: &Message) -> bool {
	matches!(
		msg,
		Message::Text(_) | Message::Binary(_) | Message::Ping(_) | Message::Pong(_)
	)
}

fn into_io(err: tungstenite::Error) -> std::io::Error {
	match err {
		tungstenite::Error::Io(e) => e,
		other => std::io::Error::other(other),
	}
}

/// The bridge controller. Owns both halves; every close path runs through
/// here, so the first close is authoritative and the flags are mutually
/// exclusive by construction.
async fn pump(mut client: ClientWs, mut server: ServerWs) -> Result<(), ProxyError> {
	let mut closed_by_client = false;
	let mut closed_by_server = false;
	loop {
		tokio::select! {
			from_client = client.next() => match from_client {
				Some(Ok(Message::Close(frame))) => {
					closed_by_client = !closed_by_server;
					if closed_by_client {
						let _ = server.close(map_close_frame(frame)).await;
					}
					let _ = client.close(None).await;
					return Ok(());
				},
				Some(Ok(msg)) => {
					if should_forward(&msg) && server.send(msg).await.is_err() {
						let _ = client.close(None).await;
						return Err(ProxyError::UpstreamSocket(std::io::Error::other(
							"websocket forward to origin failed",
						)));
					}
				},
				Some(Err(e)) => {
					let _ = server.close(None).await;
					return Err(ProxyError::client_io(into_io(e)));
				},
				None => {
					// ended without a close frame: abnormal closure
					closed_by_client = !closed_by_server;
					if closed_by_client {
						let _ = server.close(map_close_frame(None)).await;
					}
					return Ok(());
				},
			},
			from_server = server.next() => match from_server {
				Some(Ok(Message::Close(frame))) => {
					closed_by_server = !closed_by_client;
					if closed_by_server {
						let _ = client.close(map_close_frame(frame)).await;
					}
					let _ = server.close(None).await;
					return Ok(());
				},
				Some(Ok(msg)) => {
					if should_forward(&msg) && client.send(msg).await.is_err() {
						let _ = server.close(None).await;
						return Err(ProxyError::ClientSocket(std::io::Error::other(
							"websocket forward to client failed",
						)));
					}
				},
				Some(Err(e)) => {
					let _ = client.close(None).await;
					return Err(ProxyError::upstream_io(into_io(e)));
				},
				None => {
					closed_by_server = !closed_by_client;
					if closed_by_server {
						let _ = client.close(map_close_frame(None)).await;
					}
					return Ok(());
				},
			},
		}
	}
}
