//! Built-in middleware, in the order they sit in the chain.

use std::sync::Arc;
use std::time::Instant;

use async_compression::tokio::bufread::GzipDecoder;
use async_trait::async_trait;
use futures_util::TryStreamExt;
use http::header;
use http_body_util::{BodyExt, StreamBody};
use tokio::io::BufReader;
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::{Level, event};

use crate::client::{Client, Transport};
use crate::http::BoxError;
use crate::pipeline::{Context, Middleware, Next, Response};
use crate::proxy::ProxyError;
use crate::sysproxy::{SystemProxyResolver, UpstreamProxyConfig};

/// Resolves the upstream-proxy configuration for this request. Runs first so
/// every later stage sees `ctx.proxy`. Configuration-pinned upstreams are
/// overlaid here, on top of whatever the resolver found.
pub(super) struct ClientProxy {
	pub resolver: Arc<SystemProxyResolver>,
	pub pins: UpstreamProxyConfig,
}

#[async_trait]
impl Middleware for ClientProxy {
	async fn handle(&self, ctx: &mut Context, next: Next<'_>) -> Result<Response, ProxyError> {
		ctx.proxy = self.pins.clone().over(self.resolver.resolve());
		next.run(ctx).await
	}
}

/// Emits the access-log line when the transaction completes, success or not.
pub(super) struct SummaryLog;

#[async_trait]
impl Middleware for SummaryLog {
	async fn handle(&self, ctx: &mut Context, next: Next<'_>) -> Result<Response, ProxyError> {
		let start = Instant::now();
		let result = next.run(ctx).await;
		if let Ok(resp) = &result {
			ctx.summary.status = Some(resp.status());
		}
		let duration = format!("{}ms", start.elapsed().as_millis());
		match &result {
			Ok(_) => event!(
				target: "request",
				Level::INFO,

				method = ctx.summary.method.as_ref().map(|m| m.as_str()),
				url = %ctx.summary.target,
				status = ctx.summary.status.map(|s| s.as_u16()),
				proxy.kind = ctx.summary.proxy.as_ref().map(|p| p.kind),
				proxy.address = ctx.summary.proxy.as_ref().map(|p| p.address.as_str()),
				client = %ctx.client_addr,

				duration = duration,

				"complete"
			),
			Err(e) => event!(
				target: "request",
				Level::WARN,

				method = ctx.summary.method.as_ref().map(|m| m.as_str()),
				url = %ctx.summary.target,
				client = %ctx.client_addr,

				duration = duration,
				error = %e,

				"failed"
			),
		}
		result
	}
}

/// Forces `Accept-Encoding: gzip` upstream and transparently decodes gzip
/// responses so downstream middleware always observes plaintext bodies.
pub(super) struct Gunzip;

#[async_trait]
impl Middleware for Gunzip {
	async fn handle(&self, ctx: &mut Context, next: Next<'_>) -> Result<Response, ProxyError> {
		if let Some(req) = ctx.request.as_mut() {
			req.headers_mut().insert(
				header::ACCEPT_ENCODING,
				header::HeaderValue::from_static("gzip"),
			);
		}
		let resp = next.run(ctx).await?;
		Ok(maybe_gunzip(resp))
	}
}

fn maybe_gunzip(resp: Response) -> Response {
	let gzipped = resp
		.headers()
		.get(header::CONTENT_ENCODING)
		.map(|v| v.as_bytes().eq_ignore_ascii_case(b"gzip"))
		.unwrap_or(false);
	if !gzipped {
		return resp;
	}
	let (mut parts, body) = resp.into_parts();
	parts.headers.remove(header::CONTENT_ENCODING);
	// length changes under decompression; the body is re-framed as chunked
	parts.headers.remove(header::CONTENT_LENGTH);

	let reader = StreamReader::new(
		body
			.into_data_stream()
			.map_err(std::io::Error::other),
	);
	let decoder = GzipDecoder::new(BufReader::new(reader));
	let stream = ReaderStream::new(decoder)
		.map_ok(http_body::Frame::data)
		.map_err(|e| -> BoxError { e.into() });
	http::Response::from_parts(parts, BodyExt::boxed_unsync(StreamBody::new(stream)))
}

/// Runs the upstream selector and records the decision for observation.
pub(super) struct ServerProxy {
	pub client: Client,
}

#[async_trait]
impl Middleware for ServerProxy {
	async fn handle(&self, ctx: &mut Context, next: Next<'_>) -> Result<Response, ProxyError> {
		let url = ctx.url();
		let selection = self
			.client
			.select(&ctx.proxy, ctx.protocol, &url, &ctx.hostname)
			.await?;
		ctx.summary.proxy = selection.summary;
		ctx.transport = Some(selection.transport);
		next.run(ctx).await
	}
}

/// Terminal middleware: issues the outbound request and streams the response
/// back down the chain. Never calls `next`.
pub(super) struct ServerEnd {
	pub client: Client,
}

#[async_trait]
impl Middleware for ServerEnd {
	async fn handle(&self, ctx: &mut Context, _next: Next<'_>) -> Result<Response, ProxyError> {
		let mut req = ctx
			.request
			.take()
			.ok_or_else(|| ProxyError::internal("request already consumed"))?;
		strip_hop_by_hop(req.headers_mut());
		let transport = ctx.transport.clone().unwrap_or(Transport::Direct);
		self
			.client
			.request(&transport, ctx.protocol, &ctx.hostname, ctx.port, req)
			.await
	}
}

/// Connection-scoped headers from the client must not be replayed on the
/// fresh upstream connection; hyper frames the outbound body itself.
fn strip_hop_by_hop(headers: &mut http::HeaderMap) {
	for name in [
		"connection",
		"proxy-connection",
		"keep-alive",
		"te",
		"trailer",
		"transfer-encoding",
	] {
		headers.remove(name);
	}
}

#[cfg(test)]
mod tests {
	use async_compression::tokio::bufread::GzipEncoder;
	use tokio::io::AsyncReadExt;

	use super::*;
	use crate::http::full;

	async fn gzip(data: &[u8]) -> Vec<u8> {
		let mut encoder = GzipEncoder::new(data);
		let mut out = Vec::new();
		encoder.read_to_end(&mut out).await.unwrap();
		out
	}

	#[tokio::test]
	async fn gzip_responses_are_decoded_in_place() {
		let compressed = gzip(b"hello from the origin").await;
		let resp = http::Response::builder()
			.header(header::CONTENT_ENCODING, "gzip")
			.header(header::CONTENT_LENGTH, compressed.len())
			.body(full(compressed))
			.unwrap();
		let resp = maybe_gunzip(resp);
		assert!(resp.headers().get(header::CONTENT_ENCODING).is_none());
		assert!(resp.headers().get(header::CONTENT_LENGTH).is_none());
		let body = resp.into_body().collect().await.unwrap().to_bytes();
		assert_eq!(body.as_ref(), b"hello from the origin");
	}

	#[tokio::test]
	async fn plain_responses_pass_through() {
		let resp = http::Response::builder()
			.body(full("plain"))
			.unwrap();
		let resp = maybe_gunzip(resp);
		let body = resp.into_body().collect().await.unwrap().to_bytes();
		assert_eq!(body.as_ref(), b"plain");
	}

	#[tokio::test]
	async fn other_encodings_are_left_alone() {
		let resp = http::Response::builder()
			.header(header::CONTENT_ENCODING, "br")
			.body(full("not-touched"))
			.unwrap();
		let resp = maybe_gunzip(resp);
		assert_eq!(
			resp.headers().get(header::CONTENT_ENCODING).unwrap(),
			"br"
		);
	}

	#[tokio::test]
	async fn config_pins_overlay_the_resolved_config() {
		use std::net::SocketAddr;

		use url::Url;

		use crate::Protocol;
		use crate::sysproxy::SystemProxySnapshot;

		struct FixedSnapshot(UpstreamProxyConfig);
		impl SystemProxySnapshot for FixedSnapshot {
			fn snapshot(&self) -> UpstreamProxyConfig {
				self.0.clone()
			}
		}

		struct Probe;
		#[async_trait]
		impl Middleware for Probe {
			async fn handle(&self, ctx: &mut Context, _next: Next<'_>) -> Result<Response, ProxyError> {
				// the pin wins; snapshot fields it leaves alone survive
				assert_eq!(ctx.proxy.https.as_ref().unwrap().as_str(), "https://pinned:2/");
				assert_eq!(
					ctx.proxy.pac.as_ref().unwrap().as_str(),
					"http://wpad/proxy.pac"
				);
				Ok(crate::http::status_response(http::StatusCode::OK, "ok"))
			}
		}

		let os = UpstreamProxyConfig {
			https: Some(Url::parse("https://from-os:1").unwrap()),
			pac: Some(Url::parse("http://wpad/proxy.pac").unwrap()),
			..Default::default()
		};
		let pins = UpstreamProxyConfig {
			https: Some(Url::parse("https://pinned:2").unwrap()),
			..Default::default()
		};
		let client_proxy = ClientProxy {
			resolver: Arc::new(SystemProxyResolver::new(Arc::new(FixedSnapshot(os)))),
			pins,
		};
		let stack: Vec<Arc<dyn Middleware>> = vec![Arc::new(client_proxy), Arc::new(Probe)];

		let addr: SocketAddr = "127.0.0.1:40000".parse().unwrap();
		let req = http::Request::builder()
			.uri("/")
			.header(http::header::HOST, "example.com")
			.body(crate::http::empty())
			.unwrap();
		let mut ctx = Context::new(Protocol::Http, "example.com".into(), 80, addr, req, None);
		let resp = Next { rest: &stack }.run(&mut ctx).await.unwrap();
		assert_eq!(resp.status(), http::StatusCode::OK);
	}
}
