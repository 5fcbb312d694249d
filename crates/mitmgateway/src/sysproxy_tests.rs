use std::collections::HashMap;

use super::*;

fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
	let map: HashMap<String, String> = pairs
		.iter()
		.map(|(k, v)| (k.to_string(), v.to_string()))
		.collect();
	move |name: &str| map.get(name).cloned()
}

#[test]
fn uppercase_env_wins_over_lowercase() {
	let env = env_of(&[
		("HTTP_PROXY", "http://upper:3128"),
		("http_proxy", "http://lower:3128"),
	]);
	let cfg = from_env(&env);
	assert_eq!(cfg.http.unwrap().as_str(), "http://upper:3128/");
}

#[test]
fn lowercase_env_is_honored() {
	let env = env_of(&[("https_proxy", "https://secure:3129")]);
	let cfg = from_env(&env);
	assert_eq!(cfg.https.unwrap().as_str(), "https://secure:3129/");
	assert!(cfg.http.is_none());
}

#[test]
fn all_proxy_with_socks_scheme_fills_socks() {
	let env = env_of(&[("ALL_PROXY", "socks://sock:1080")]);
	let cfg = from_env(&env);
	assert_eq!(cfg.socks.unwrap().as_str(), "socks://sock:1080");
	assert!(cfg.http.is_none());
	assert!(cfg.https.is_none());
}

#[test]
fn all_proxy_backfills_http_and_https() {
	let env = env_of(&[
		("ALL_PROXY", "http://all:3128"),
		("HTTPS_PROXY", "https://secure:3129"),
	]);
	let cfg = from_env(&env);
	assert_eq!(cfg.http.unwrap().as_str(), "http://all:3128/");
	// the more specific variable still wins
	assert_eq!(cfg.https.unwrap().as_str(), "https://secure:3129/");
}

#[test]
fn http_proxy_ignored_in_cgi_context() {
	let env = env_of(&[
		("HTTP_PROXY", "http://attacker:3128"),
		("REQUEST_METHOD", "GET"),
	]);
	let cfg = from_env(&env);
	assert!(cfg.http.is_none());
}

#[test]
fn schemeless_value_defaults_to_http() {
	assert_eq!(
		parse_proxy_url("proxy.internal:3128").unwrap().as_str(),
		"http://proxy.internal:3128/"
	);
}

#[test]
fn snapshot_wins_over_env_field_by_field() {
	let env = env_of(&[
		("HTTPS_PROXY", "https://from-env:1"),
		("HTTP_PROXY", "http://from-env:2"),
	]);
	let os = UpstreamProxyConfig {
		https: Some(Url::parse("https://from-os:3").unwrap()),
		pac: Some(Url::parse("http://wpad/proxy.pac").unwrap()),
		..Default::default()
	};
	let cfg = resolved_from(os, &env);
	assert_eq!(cfg.https.unwrap().as_str(), "https://from-os:3/");
	// fields the snapshot leaves unset fall through to the environment
	assert_eq!(cfg.http.unwrap().as_str(), "http://from-env:2/");
	// the PAC URL from the snapshot is carried verbatim
	assert_eq!(cfg.pac.unwrap().as_str(), "http://wpad/proxy.pac");
}

#[test]
fn overlay_is_field_wise() {
	let pinned = UpstreamProxyConfig {
		https: Some(Url::parse("https://pinned:1").unwrap()),
		..Default::default()
	};
	let base = UpstreamProxyConfig {
		https: Some(Url::parse("https://base:2").unwrap()),
		socks: Some(Url::parse("socks://base:1080").unwrap()),
		..Default::default()
	};
	let merged = pinned.over(base);
	assert_eq!(merged.https.unwrap().as_str(), "https://pinned:1/");
	assert_eq!(merged.socks.unwrap().as_str(), "socks://base:1080");
	assert!(merged.http.is_none());
}
