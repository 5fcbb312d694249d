//! Shared harness for the end-to-end tests: a full proxy on an ephemeral
//! port, plus tiny origins to intercept against.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use mitmgateway::ca::RcgenAuthority;
use mitmgateway::sysproxy::UpstreamProxyConfig;
use mitmgateway::{Proxy, ProxyHandle};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerConfig};

pub struct TestProxy {
	pub addr: SocketAddr,
	pub handle: ProxyHandle,
	pub ca: Arc<RcgenAuthority>,
}

impl TestProxy {
	pub async fn start(upstream: UpstreamProxyConfig) -> TestProxy {
		mitmgateway::install_default_crypto();
		let ca = Arc::new(RcgenAuthority::generate().unwrap());
		let proxy = Proxy::builder()
			.certificate_authority(ca.clone())
			.extra_root_ca(ca.root_cert_der())
			.upstream(upstream)
			.bind()
			.await
			.unwrap();
		let addr = proxy.local_addr();
		let handle = proxy.handle();
		tokio::spawn(async move {
			let _ = proxy.serve().await;
		});
		TestProxy { addr, handle, ca }
	}

	pub async fn connect(&self) -> TcpStream {
		TcpStream::connect(self.addr).await.unwrap()
	}

	/// Open a CONNECT tunnel through the proxy and consume the 200.
	pub async fn open_tunnel(&self, target: &str) -> TcpStream {
		let mut stream = self.connect().await;
		stream
			.write_all(format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n").as_bytes())
			.await
			.unwrap();
		let mut head = Vec::new();
		let mut buf = [0u8; 256];
		while find_header_end(&head).is_none() {
			let n = stream.read(&mut buf).await.unwrap();
			assert!(n > 0, "connection closed during CONNECT handshake");
			head.extend_from_slice(&buf[..n]);
		}
		let head = String::from_utf8_lossy(&head).to_string();
		assert!(
			head.starts_with("HTTP/1.1 200"),
			"unexpected CONNECT response: {head}"
		);
		stream
	}

	/// A rustls client config trusting only this proxy's root.
	pub fn client_tls_config(&self) -> Arc<ClientConfig> {
		let mut roots = RootCertStore::empty();
		roots.add(self.ca.root_cert_der()).unwrap();
		Arc::new(
			ClientConfig::builder()
				.with_root_certificates(roots)
				.with_no_client_auth(),
		)
	}
}

/// A minimal HTTP response read off a raw stream: status line, headers,
/// content-length body.
pub struct RawResponse {
	pub status: u16,
	pub headers: Vec<(String, String)>,
	pub body: Vec<u8>,
}

impl RawResponse {
	pub fn body_str(&self) -> String {
		String::from_utf8_lossy(&self.body).to_string()
	}

	pub fn header(&self, name: &str) -> Option<&str> {
		self
			.headers
			.iter()
			.find(|(n, _)| n.eq_ignore_ascii_case(name))
			.map(|(_, v)| v.as_str())
	}
}

pub async fn read_response<S>(stream: &mut S) -> RawResponse
where
	S: AsyncReadExt + Unpin,
{
	let mut buf = Vec::new();
	let header_end = loop {
		let mut chunk = [0u8; 1024];
		let n = stream.read(&mut chunk).await.unwrap();
		assert!(n > 0, "connection closed before response headers completed");
		buf.extend_from_slice(&chunk[..n]);
		if let Some(pos) = find_header_end(&buf) {
			break pos;
		}
	};
	let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
	let mut lines = head.split("\r\n");
	let status_line = lines.next().unwrap();
	let status: u16 = status_line
		.split_whitespace()
		.nth(1)
		.expect("status line")
		.parse()
		.unwrap();
	let headers: Vec<(String, String)> = lines
		.filter_map(|line| {
			line.split_once(':')
				.map(|(n, v)| (n.trim().to_string(), v.trim().to_string()))
		})
		.collect();
	let content_length: usize = headers
		.iter()
		.find(|(n, _)| n.eq_ignore_ascii_case("content-length"))
		.map(|(_, v)| v.parse().unwrap())
		.unwrap_or(0);

	let mut body = buf[header_end + 4..].to_vec();
	while body.len() < content_length {
		let mut chunk = vec![0u8; content_length - body.len()];
		let n = stream.read(&mut chunk).await.unwrap();
		assert!(n > 0, "connection closed mid-body");
		body.extend_from_slice(&chunk[..n]);
	}
	RawResponse {
		status,
		headers,
		body,
	}
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
	buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// A TLS origin answering every request with a fixed body, presenting a
/// certificate minted by the given CA for `127.0.0.1`.
pub async fn spawn_tls_origin(ca: &RcgenAuthority, body: &'static str) -> SocketAddr {
	use mitmgateway::ca::CertificateAuthority;

	let minted = ca.mint("127.0.0.1").unwrap();
	let config = ServerConfig::builder()
		.with_no_client_auth()
		.with_single_cert(minted.chain.clone(), minted.key.clone_key())
		.unwrap();
	let acceptor = TlsAcceptor::from(Arc::new(config));

	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	tokio::spawn(async move {
		loop {
			let Ok((tcp, _)) = listener.accept().await else {
				break;
			};
			let acceptor = acceptor.clone();
			tokio::spawn(async move {
				let Ok(mut tls) = acceptor.accept(tcp).await else {
					return;
				};
				let mut buf = vec![0u8; 4096];
				let mut seen = Vec::new();
				loop {
					let Ok(n) = tls.read(&mut buf).await else {
						return;
					};
					if n == 0 {
						return;
					}
					seen.extend_from_slice(&buf[..n]);
					if find_header_end(&seen).is_some() {
						break;
					}
				}
				let response = format!(
					"HTTP/1.1 200 OK\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
					body.len(),
					body
				);
				let _ = tls.write_all(response.as_bytes()).await;
				let _ = tls.shutdown().await;
			});
		}
	});
	addr
}
