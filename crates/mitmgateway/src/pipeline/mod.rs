//! The middleware chain every proxied HTTP transaction runs through.
//!
//! Order, client side first: client-proxy (resolve the upstream config),
//! summary (observation at scope exit), user middleware, gunzip, server-proxy
//! (transport selection), server-end (the terminal that issues the outbound
//! request). Each middleware receives the context and a [`Next`]; `Next` is
//! consumed by value, so "next called at most once" holds by construction. A
//! middleware that never calls `next` short-circuits with its own response;
//! errors unwind back through the chain.

mod builtin;
mod context;

use std::sync::Arc;

use async_trait::async_trait;

pub use context::{Context, Summary};

use crate::client::Client;
use crate::http::Body;
use crate::proxy::ProxyError;
use crate::sysproxy::{SystemProxyResolver, UpstreamProxyConfig};

pub type Response = http::Response<Body>;

#[async_trait]
pub trait Middleware: Send + Sync + 'static {
	async fn handle(&self, ctx: &mut Context, next: Next<'_>) -> Result<Response, ProxyError>;
}

/// Handle to the remainder of the chain. Consumed by [`Next::run`].
pub struct Next<'a> {
	pub(crate) rest: &'a [Arc<dyn Middleware>],
}

impl Next<'_> {
	pub async fn run(self, ctx: &mut Context) -> Result<Response, ProxyError> {
		match self.rest.split_first() {
			Some((mw, rest)) => mw.handle(ctx, Next { rest }).await,
			// The terminal middleware never calls next, so an exhausted chain
			// means a build bug rather than a runtime condition.
			None => Err(ProxyError::internal("middleware chain has no terminal")),
		}
	}
}

/// The composed chain: built-ins in their fixed positions with user
/// middleware slotted between summary and gunzip.
#[derive(Clone)]
pub struct Chain {
	stack: Arc<[Arc<dyn Middleware>]>,
}

impl Chain {
	pub fn new(
		resolver: Arc<SystemProxyResolver>,
		pins: UpstreamProxyConfig,
		client: Client,
		user: Vec<Arc<dyn Middleware>>,
	) -> Self {
		let mut stack: Vec<Arc<dyn Middleware>> = Vec::with_capacity(user.len() + 5);
		stack.push(Arc::new(builtin::ClientProxy { resolver, pins }));
		stack.push(Arc::new(builtin::SummaryLog));
		stack.extend(user);
		stack.push(Arc::new(builtin::Gunzip));
		stack.push(Arc::new(builtin::ServerProxy {
			client: client.clone(),
		}));
		stack.push(Arc::new(builtin::ServerEnd { client }));
		Self {
			stack: stack.into(),
		}
	}

	pub async fn run(&self, ctx: &mut Context) -> Result<Response, ProxyError> {
		Next { rest: &self.stack }.run(ctx).await
	}
}

#[cfg(test)]
mod tests {
	use std::net::SocketAddr;
	use std::sync::Mutex;

	use super::*;
	use crate::Protocol;
	use crate::http;

	struct Recorder {
		label: &'static str,
		log: Arc<Mutex<Vec<String>>>,
	}

	#[async_trait]
	impl Middleware for Recorder {
		async fn handle(&self, ctx: &mut Context, next: Next<'_>) -> Result<Response, ProxyError> {
			self.log.lock().unwrap().push(format!("{}:enter", self.label));
			let result = next.run(ctx).await;
			self.log.lock().unwrap().push(format!("{}:exit", self.label));
			result
		}
	}

	struct Terminal;

	#[async_trait]
	impl Middleware for Terminal {
		async fn handle(&self, _ctx: &mut Context, _next: Next<'_>) -> Result<Response, ProxyError> {
			Ok(http::status_response(::http::StatusCode::OK, "done"))
		}
	}

	struct ShortCircuit;

	#[async_trait]
	impl Middleware for ShortCircuit {
		async fn handle(&self, _ctx: &mut Context, _next: Next<'_>) -> Result<Response, ProxyError> {
			Ok(http::status_response(
				::http::StatusCode::FORBIDDEN,
				"blocked",
			))
		}
	}

	struct Failing;

	#[async_trait]
	impl Middleware for Failing {
		async fn handle(&self, _ctx: &mut Context, _next: Next<'_>) -> Result<Response, ProxyError> {
			Err(ProxyError::internal("boom"))
		}
	}

	fn test_ctx() -> Context {
		let addr: SocketAddr = "127.0.0.1:40000".parse().unwrap();
		let req = ::http::Request::builder()
			.uri("/")
			.header(::http::header::HOST, "example.com")
			.body(http::empty())
			.unwrap();
		Context::new(Protocol::Http, "example.com".into(), 80, addr, req, None)
	}

	async fn run(stack: Vec<Arc<dyn Middleware>>) -> (Result<Response, ProxyError>, Vec<String>) {
		let log = Arc::new(Mutex::new(Vec::new()));
		let stack: Vec<Arc<dyn Middleware>> = stack
			.into_iter()
			.enumerate()
			.flat_map(|(i, mw)| {
				let label: &'static str = ["a", "b", "c"][i];
				vec![
					Arc::new(Recorder {
						label,
						log: log.clone(),
					}) as Arc<dyn Middleware>,
					mw,
				]
			})
			.collect();
		let mut ctx = test_ctx();
		let result = Next { rest: &stack }.run(&mut ctx).await;
		let entries = log.lock().unwrap().clone();
		(result, entries)
	}

	#[tokio::test]
	async fn middleware_runs_in_order_and_unwinds_in_reverse() {
		let log = Arc::new(Mutex::new(Vec::new()));
		let stack: Vec<Arc<dyn Middleware>> = vec![
			Arc::new(Recorder {
				label: "outer",
				log: log.clone(),
			}),
			Arc::new(Recorder {
				label: "inner",
				log: log.clone(),
			}),
			Arc::new(Terminal),
		];
		let mut ctx = test_ctx();
		let resp = Next { rest: &stack }.run(&mut ctx).await.unwrap();
		assert_eq!(resp.status(), ::http::StatusCode::OK);
		assert_eq!(
			log.lock().unwrap().as_slice(),
			["outer:enter", "inner:enter", "inner:exit", "outer:exit"]
		);
	}

	#[tokio::test]
	async fn short_circuit_skips_deeper_middleware() {
		let (result, entries) = run(vec![Arc::new(ShortCircuit), Arc::new(Terminal)]).await;
		assert_eq!(
			result.unwrap().status(),
			::http::StatusCode::FORBIDDEN
		);
		// the recorder in front of the terminal never ran
		assert_eq!(entries, ["a:enter", "a:exit"]);
	}

	#[tokio::test]
	async fn errors_unwind_through_every_frame() {
		let (result, entries) = run(vec![Arc::new(Failing), Arc::new(Terminal)]).await;
		assert!(result.is_err());
		assert_eq!(entries, ["a:enter", "a:exit"]);
	}

	#[tokio::test]
	async fn exhausted_chain_is_an_internal_error() {
		let mut ctx = test_ctx();
		let result = Next { rest: &[] }.run(&mut ctx).await;
		assert!(result.is_err());
	}
}
