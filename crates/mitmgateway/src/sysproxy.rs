//! Per-request upstream-proxy resolution.
//!
//! The resolver combines two layers, strongest first: an OS snapshot (behind
//! [`SystemProxySnapshot`] so each platform can plug in its own discovery)
//! and the conventional environment variables. It is pure with respect to
//! those two inputs and is invoked once per request, so changes to the
//! environment or OS settings take effect on the next request.
//! Configuration-pinned upstreams are not the resolver's business; the
//! client-proxy pipeline stage overlays them on the resolved result.

use std::sync::Arc;

use url::Url;

#[cfg(test)]
#[path = "sysproxy_tests.rs"]
mod tests;

/// Upstream proxy configuration for one request. At most one of
/// `pac | socks | protocol-matched http/https` is acted on, in that order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpstreamProxyConfig {
	pub http: Option<Url>,
	pub https: Option<Url>,
	pub socks: Option<Url>,
	pub pac: Option<Url>,
}

impl UpstreamProxyConfig {
	pub fn is_empty(&self) -> bool {
		self.http.is_none() && self.https.is_none() && self.socks.is_none() && self.pac.is_none()
	}

	/// Field-wise overlay, `self` winning over `base`.
	pub fn over(self, base: UpstreamProxyConfig) -> UpstreamProxyConfig {
		UpstreamProxyConfig {
			http: self.http.or(base.http),
			https: self.https.or(base.https),
			socks: self.socks.or(base.socks),
			pac: self.pac.or(base.pac),
		}
	}
}

/// OS-level proxy discovery. The PAC URL, when present, is carried verbatim.
pub trait SystemProxySnapshot: Send + Sync {
	fn snapshot(&self) -> UpstreamProxyConfig;
}

/// Default snapshot for platforms without OS discovery wired up.
pub struct NoSystemProxy;

impl SystemProxySnapshot for NoSystemProxy {
	fn snapshot(&self) -> UpstreamProxyConfig {
		UpstreamProxyConfig::default()
	}
}

pub struct SystemProxyResolver {
	os: Arc<dyn SystemProxySnapshot>,
}

impl SystemProxyResolver {
	pub fn new(os: Arc<dyn SystemProxySnapshot>) -> Self {
		Self { os }
	}

	/// Precedence per field: OS snapshot, then environment.
	pub fn resolve(&self) -> UpstreamProxyConfig {
		let env = |name: &str| std::env::var(name).ok();
		resolved_from(self.os.snapshot(), &env)
	}
}

pub(crate) fn resolved_from(
	os: UpstreamProxyConfig,
	env: &dyn Fn(&str) -> Option<String>,
) -> UpstreamProxyConfig {
	os.over(from_env(env))
}

/// Environment fallback: `HTTP_PROXY|http_proxy`, `HTTPS_PROXY|https_proxy`,
/// `ALL_PROXY|all_proxy`. A socks-schemed `ALL_PROXY` fills the socks slot;
/// any other scheme backfills http and https.
pub(crate) fn from_env(env: &dyn Fn(&str) -> Option<String>) -> UpstreamProxyConfig {
	let lookup = |upper: &str, lower: &str| {
		env(upper)
			.or_else(|| env(lower))
			.and_then(|v| parse_proxy_url(&v))
	};

	let mut cfg = UpstreamProxyConfig {
		// In a CGI context request headers become environment variables, so
		// "Proxy:" would appear as HTTP_PROXY; ignore it there.
		http: if env("REQUEST_METHOD").is_none() {
			lookup("HTTP_PROXY", "http_proxy")
		} else {
			None
		},
		https: lookup("HTTPS_PROXY", "https_proxy"),
		socks: None,
		pac: None,
	};

	if let Some(all) = lookup("ALL_PROXY", "all_proxy") {
		if all.scheme().starts_with("socks") {
			cfg.socks = Some(all);
		} else {
			cfg.http.get_or_insert_with(|| all.clone());
			cfg.https.get_or_insert(all);
		}
	}
	cfg
}

/// Parse a proxy environment value, tolerating a missing scheme the way
/// every other proxy-aware tool does (`proxy:3128` means `http://proxy:3128`).
pub(crate) fn parse_proxy_url(value: &str) -> Option<Url> {
	let value = value.trim();
	if value.is_empty() {
		return None;
	}
	match Url::parse(value) {
		Ok(url) if !url.scheme().is_empty() && url.host_str().is_some() => Some(url),
		_ => Url::parse(&format!("http://{value}")).ok(),
	}
}
