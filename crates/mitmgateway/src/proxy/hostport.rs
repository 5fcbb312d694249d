//! Extracting `(host, port)` from the three places a proxy sees them: the
//! CONNECT target, the `Host` header, and absolute-form request-targets.

use http::Uri;
use http::uri::Authority;

use crate::proxy::ProxyError;

#[cfg(test)]
#[path = "hostport_tests.rs"]
mod tests;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPort {
	pub host: String,
	pub port: Option<u16>,
}

/// Parse a CONNECT target, which is always `hostname:port`.
pub fn from_connect_target(uri: &Uri) -> Result<HostPort, ProxyError> {
	let authority = uri
		.authority()
		.ok_or_else(|| ProxyError::Protocol(format!("CONNECT target is not host:port: {uri}")))?;
	let port = authority
		.port_u16()
		.ok_or_else(|| ProxyError::Protocol(format!("CONNECT target has no port: {uri}")))?;
	Ok(HostPort {
		host: authority.host().to_string(),
		port: Some(port),
	})
}

/// Resolve host and port for a non-CONNECT request, and normalize
/// absolute-form targets to origin-form in place.
///
/// Absolute-form URIs override whatever the `Host` header says; plain
/// origin-form requests must carry a `Host` header or the request is
/// malformed.
pub fn from_request<B>(req: &mut http::Request<B>) -> Result<HostPort, ProxyError> {
	if req.uri().scheme().is_some() {
		let authority = req
			.uri()
			.authority()
			.ok_or_else(|| ProxyError::Protocol(format!("absolute uri has no host: {}", req.uri())))?
			.clone();
		let origin_form: Uri = req
			.uri()
			.path_and_query()
			.map(|pq| pq.as_str())
			.filter(|pq| !pq.is_empty())
			.unwrap_or("/")
			.parse()
			.map_err(|_| ProxyError::Protocol(format!("unparseable request target: {}", req.uri())))?;
		*req.uri_mut() = origin_form;
		// keep the Host header consistent with the authority we routed on
		if let Ok(value) = http::HeaderValue::from_str(authority.as_str()) {
			req.headers_mut().insert(http::header::HOST, value);
		}
		return Ok(HostPort {
			host: authority.host().to_string(),
			port: authority.port_u16(),
		});
	}

	let host = req
		.headers()
		.get(http::header::HOST)
		.and_then(|v| v.to_str().ok())
		.ok_or_else(|| ProxyError::Protocol("request has no Host header".to_string()))?;
	let authority: Authority = host
		.parse()
		.map_err(|_| ProxyError::Protocol(format!("invalid Host header: {host}")))?;
	Ok(HostPort {
		host: authority.host().to_string(),
		port: authority.port_u16(),
	})
}
