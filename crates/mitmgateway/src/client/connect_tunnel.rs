use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::proxy::ProxyError;

const MAX_RESPONSE_HEADERS: usize = 8192;

/// Open a CONNECT tunnel to `dest` through an already-connected upstream
/// proxy stream. Raw HTTP/1 is sufficient here; the reply is consumed up to
/// the end of its header block and nothing past it is read.
pub(super) async fn handshake<S>(conn: &mut S, dest: &str) -> Result<(), ProxyError>
where
	S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
	let request = format!("CONNECT {dest} HTTP/1.1\r\nHost: {dest}\r\n\r\n");
	conn
		.write_all(request.as_bytes())
		.await
		.map_err(ProxyError::upstream_io)?;

	let mut response = Vec::with_capacity(512);
	let mut chunk = [0u8; 512];
	loop {
		let n = conn
			.read(&mut chunk)
			.await
			.map_err(ProxyError::upstream_io)?;
		if n == 0 {
			return Err(ProxyError::UpstreamUnavailable(
				"tunnel closed before responding".to_string(),
			));
		}
		response.extend_from_slice(&chunk[..n]);
		if let Some(end) = header_end(&response) {
			return check_status(&response[..end]);
		}
		if response.len() > MAX_RESPONSE_HEADERS {
			return Err(ProxyError::UpstreamUnavailable(
				"tunnel response headers too long".to_string(),
			));
		}
	}
}

fn header_end(buf: &[u8]) -> Option<usize> {
	buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Any 2xx establishes the tunnel. 407 gets its own message since a proxy
/// demanding credentials is the common misconfiguration.
fn check_status(head: &[u8]) -> Result<(), ProxyError> {
	let status_line = head.split(|b| *b == b'\r').next().unwrap_or(head);
	let status_line = std::str::from_utf8(status_line).unwrap_or_default();
	let mut parts = status_line.split_whitespace();
	let version = parts.next().unwrap_or_default();
	let code = parts.next().and_then(|c| c.parse::<u16>().ok());
	if !version.starts_with("HTTP/1") {
		return Err(ProxyError::UpstreamUnavailable(format!(
			"tunnel sent a non-http reply: {status_line}"
		)));
	}
	match code {
		Some(code) if (200..300).contains(&code) => Ok(()),
		Some(407) => Err(ProxyError::UpstreamUnavailable(
			"tunnel requires authentication".to_string(),
		)),
		Some(_) => Err(ProxyError::UpstreamUnavailable(format!(
			"tunnel refused: {status_line}"
		))),
		None => Err(ProxyError::UpstreamUnavailable(format!(
			"tunnel sent a malformed status line: {status_line}"
		))),
	}
}
