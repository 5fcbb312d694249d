//! CONNECT dispatch: sniff the first tunneled byte and splice the client
//! onto the right inner listener.
//!
//! The 200 goes out immediately; the first byte the client then sends
//! decides between TLS interception (via the server pool) and the plaintext
//! path (the plain inner listener). The preview byte is written to the inner
//! connection before any piping starts, so the inner TLS stack sees an
//! intact ClientHello, and the registry entry is inserted before that write,
//! so the inner listener can always resolve the tunnel's origin CONNECT.

use std::net::SocketAddr;
use std::sync::Arc;

use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::http::{Body, empty};
use crate::proxy::registry::ConnectInfo;
use crate::proxy::{ProxyError, ProxyState, error_response, hostport};

/// TLS handshake record (1.0+), or an SSLv2 record with the length MSB set.
fn looks_like_tls(first: u8) -> bool {
	matches!(first, 0x16 | 0x80 | 0x00)
}

pub(crate) fn handle(
	state: Arc<ProxyState>,
	req: http::Request<Incoming>,
	peer: SocketAddr,
) -> http::Response<Body> {
	let target = match hostport::from_connect_target(req.uri()) {
		Ok(hp) => hp,
		Err(e) => return error_response(&state, e),
	};
	let port = target.port.unwrap_or(443);
	let host = target.host;
	debug!(host, port, client = %peer, "connect tunnel opening");

	tokio::spawn(async move {
		if let Err(e) = tunnel(&state, req, host, port, peer).await {
			state.errors.emit(e);
		}
	});

	http::Response::builder()
		.status(http::StatusCode::OK)
		.body(empty())
		.expect("static response must build")
}

async fn tunnel(
	state: &Arc<ProxyState>,
	req: http::Request<Incoming>,
	host: String,
	port: u16,
	peer: SocketAddr,
) -> Result<(), ProxyError> {
	let upgraded = hyper::upgrade::on(req)
		.await
		.map_err(|e| ProxyError::ClientSocket(std::io::Error::other(e)))?;
	let mut client = TokioIo::new(upgraded);

	let mut preview = [0u8; 1];
	let n = client
		.read(&mut preview)
		.await
		.map_err(ProxyError::client_io)?;
	if n == 0 {
		// client hung up before sending anything through the tunnel
		return Ok(());
	}

	let inner_port = if looks_like_tls(preview[0]) {
		state.pool.acquire(state, &host).await?
	} else {
		state.plain_port
	};

	let mut inner = TcpStream::connect((state.bind_ip, inner_port))
		.await
		.map_err(|e| ProxyError::internal(format!("inner listener unreachable: {e}")))?;
	let _ = inner.set_nodelay(true);
	let key = (
		inner
			.peer_addr()
			.map_err(|e| ProxyError::internal(e.to_string()))?
			.port(),
		inner
			.local_addr()
			.map_err(|e| ProxyError::internal(e.to_string()))?
			.port(),
	);

	// Registered before the preview byte goes out: the inner listener cannot
	// see a request until after this write.
	state.registry.insert(
		key,
		Arc::new(ConnectInfo {
			host,
			port,
			client_addr: peer,
		}),
	);

	let spliced = async {
		inner.write_all(&preview[..n]).await?;
		// copy_bidirectional half-closes each direction independently, so
		// one side finishing its writes does not abort the other direction.
		tokio::io::copy_bidirectional(&mut client, &mut inner).await?;
		Ok::<_, std::io::Error>(())
	}
	.await;
	state.registry.remove(key);
	spliced.map_err(ProxyError::client_io)?;
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn tls_record_types_are_sniffed() {
		assert!(looks_like_tls(0x16));
		assert!(looks_like_tls(0x80));
		assert!(looks_like_tls(0x00));
	}

	#[test]
	fn plaintext_bytes_are_not() {
		assert!(!looks_like_tls(b'G'));
		assert!(!looks_like_tls(b'S'));
		assert!(!looks_like_tls(0x17));
	}
}
