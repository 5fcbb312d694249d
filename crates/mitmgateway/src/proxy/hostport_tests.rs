use assert_matches::assert_matches;
use rstest::rstest;

use super::*;
use crate::http::{Body, empty};
use crate::proxy::ProxyError;

fn request(uri: &str, host_header: Option<&str>) -> http::Request<Body> {
	let mut builder = http::Request::builder().uri(uri);
	if let Some(host) = host_header {
		builder = builder.header(http::header::HOST, host);
	}
	builder.body(empty()).unwrap()
}

#[test]
fn missing_host_header_is_a_protocol_error() {
	let mut req = request("/index.html", None);
	assert_matches!(from_request(&mut req), Err(ProxyError::Protocol(_)));
}

#[rstest]
#[case("example.com", "example.com", None)]
#[case("example.com:8080", "example.com", Some(8080))]
#[case("[::1]:8443", "[::1]", Some(8443))]
fn host_header_parsing(
	#[case] header: &str,
	#[case] host: &str,
	#[case] port: Option<u16>,
) {
	let mut req = request("/x", Some(header));
	let hp = from_request(&mut req).unwrap();
	assert_eq!(hp.host, host);
	assert_eq!(hp.port, port);
}

#[test]
fn absolute_form_overrides_host_header_and_rewrites_target() {
	let mut req = request("http://real.example.com:8080/a/b?q=1", Some("stale.example.com"));
	let hp = from_request(&mut req).unwrap();
	assert_eq!(hp.host, "real.example.com");
	assert_eq!(hp.port, Some(8080));
	assert_eq!(req.uri().to_string(), "/a/b?q=1");
	assert_eq!(
		req.headers().get(http::header::HOST).unwrap(),
		"real.example.com:8080"
	);
}

#[test]
fn absolute_form_without_path_becomes_root() {
	let mut req = request("http://example.com", None);
	let hp = from_request(&mut req).unwrap();
	assert_eq!(hp.host, "example.com");
	assert_eq!(req.uri().to_string(), "/");
}

#[test]
fn connect_target_splits_host_and_port() {
	let uri: http::Uri = "example.com:443".parse().unwrap();
	let hp = from_connect_target(&uri).unwrap();
	assert_eq!(hp.host, "example.com");
	assert_eq!(hp.port, Some(443));
}

#[test]
fn connect_target_requires_a_port() {
	let uri: http::Uri = "example.com".parse().unwrap();
	assert_matches!(from_connect_target(&uri), Err(ProxyError::Protocol(_)));
}
