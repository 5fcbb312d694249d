use super::*;

fn frame(code: u16) -> Option<CloseFrame> {
	Some(CloseFrame {
		code: CloseCode::from(code),
		reason: "bye".into(),
	})
}

#[test]
fn reserved_codes_map_to_1001() {
	for code in 1004..=1006 {
		let mapped = map_close_frame(frame(code)).unwrap();
		assert_eq!(u16::from(mapped.code), 1001, "code {code}");
		assert_eq!(mapped.reason.as_str(), "bye");
	}
}

#[test]
fn absent_code_is_the_1005_case() {
	let mapped = map_close_frame(None).unwrap();
	assert_eq!(u16::from(mapped.code), 1001);
}

#[test]
fn ordinary_codes_pass_through() {
	for code in [1000u16, 1001, 1002, 1003, 1008, 1011, 4000] {
		let mapped = map_close_frame(frame(code)).unwrap();
		assert_eq!(u16::from(mapped.code), code);
	}
}

#[test]
fn sec_websocket_headers_never_reach_upstream() {
	let mut headers = http::HeaderMap::new();
	headers.insert("sec-websocket-key", "client-chosen".parse().unwrap());
	headers.insert("sec-websocket-version", "13".parse().unwrap());
	headers.insert("sec-websocket-protocol", "graphql-ws".parse().unwrap());
	headers.insert("sec-websocket-extensions", "permessage-deflate".parse().unwrap());
	headers.insert(http::header::COOKIE, "session=1".parse().unwrap());
	headers.insert("x-custom", "kept".parse().unwrap());

	let req = upstream_request("ws://origin/chat", &headers).unwrap();

	// the generated handshake key is present, the client's is not
	let key = req.headers().get("sec-websocket-key").unwrap();
	assert_ne!(key, "client-chosen");
	assert_eq!(
		req
			.headers()
			.get_all("sec-websocket-key")
			.iter()
			.count(),
		1
	);
	assert!(req.headers().get("sec-websocket-protocol").is_none());
	assert!(req.headers().get("sec-websocket-extensions").is_none());
	assert_eq!(req.headers().get(http::header::COOKIE).unwrap(), "session=1");
	assert_eq!(req.headers().get("x-custom").unwrap(), "kept");
}

#[test]
fn relative_upgrade_combines_host_and_listener_scheme() {
	let req = http::Request::builder()
		.uri("/chat?room=1")
		.header(http::header::HOST, "echo.example.com")
		.body(())
		.unwrap();
	let url = upstream_url(&req, Protocol::Https, None).unwrap();
	assert_eq!(url, "wss://echo.example.com/chat?room=1");

	let url = upstream_url(&req, Protocol::Http, None).unwrap();
	assert_eq!(url, "ws://echo.example.com/chat?room=1");
}

#[test]
fn relative_upgrade_falls_back_to_connect_info() {
	let req = http::Request::builder().uri("/").body(()).unwrap();
	let connect = ConnectInfo {
		host: "tunnel.example.com".to_string(),
		port: 8443,
		client_addr: "10.0.0.1:5000".parse().unwrap(),
	};
	let url = upstream_url(&req, Protocol::Https, Some(&connect)).unwrap();
	assert_eq!(url, "wss://tunnel.example.com:8443/");
}

#[test]
fn absolute_upgrade_is_used_verbatim() {
	let req = http::Request::builder()
		.uri("http://echo.example.com/chat")
		.body(())
		.unwrap();
	let url = upstream_url(&req, Protocol::Http, None).unwrap();
	assert_eq!(url, "ws://echo.example.com/chat");
}

#[test]
fn upgrade_without_host_is_a_protocol_error() {
	let req = http::Request::builder().uri("/").body(()).unwrap();
	assert!(upstream_url(&req, Protocol::Http, None).is_err());
}
