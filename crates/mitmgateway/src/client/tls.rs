use std::sync::Arc;

use rustls::ClientConfig;
use rustls_pki_types::{DnsName, ServerName};
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::client::BoxedIo;
use crate::proxy::ProxyError;

/// The SNI for an outbound handshake always comes from the target hostname.
/// This holds on every path, including PAC evaluating to DIRECT, so the
/// origin sees the name the client originally asked for.
pub(super) fn server_name(host: &str) -> Result<ServerName<'static>, ProxyError> {
	if let Ok(ip) = host.parse::<std::net::IpAddr>() {
		return Ok(ServerName::IpAddress(ip.into()));
	}
	DnsName::try_from(host.to_string())
		.map(ServerName::DnsName)
		.map_err(|_| ProxyError::Protocol(format!("invalid tls hostname: {host}")))
}

pub(super) async fn handshake(
	io: BoxedIo,
	cfg: Arc<ClientConfig>,
	host: &str,
) -> Result<BoxedIo, ProxyError> {
	let name = server_name(host)?;
	debug!(hostname = %host, "connecting tls");
	let tls = TlsConnector::from(cfg)
		.connect(name, io)
		.await
		.map_err(ProxyError::upstream_io)?;
	Ok(Box::new(tls))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn hostnames_become_dns_names() {
		match server_name("example.com").unwrap() {
			ServerName::DnsName(name) => assert_eq!(name.as_ref(), "example.com"),
			other => panic!("unexpected server name {other:?}"),
		}
	}

	#[test]
	fn ip_literals_become_ip_server_names() {
		assert!(matches!(
			server_name("127.0.0.1").unwrap(),
			ServerName::IpAddress(_)
		));
	}

	#[test]
	fn invalid_names_are_protocol_errors() {
		assert!(server_name("bad name!").is_err());
	}
}
