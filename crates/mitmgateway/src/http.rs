//! Shared HTTP plumbing: the boxed body type used on both sides of the
//! proxy, and the handful of constructors everything else leans on.

use bytes::Bytes;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Body type flowing through the pipeline. Inbound `hyper` bodies and
/// outbound streaming bodies are both erased into this.
pub type Body = UnsyncBoxBody<Bytes, BoxError>;

pub fn empty() -> Body {
	Empty::<Bytes>::new()
		.map_err(|never| match never {})
		.boxed_unsync()
}

pub fn full(chunk: impl Into<Bytes>) -> Body {
	Full::new(chunk.into())
		.map_err(|never| match never {})
		.boxed_unsync()
}

/// Erase any compatible body into [`Body`].
pub fn boxed<B>(body: B) -> Body
where
	B: http_body::Body<Data = Bytes> + Send + 'static,
	B::Error: Into<BoxError>,
{
	body.map_err(Into::into).boxed_unsync()
}

/// Build a plain-text response with the given status, used for error
/// replies on every serving surface.
pub fn status_response(status: http::StatusCode, message: &str) -> http::Response<Body> {
	http::Response::builder()
		.status(status)
		.header(http::header::CONTENT_TYPE, "text/plain; charset=utf-8")
		.body(full(message.to_string()))
		.expect("static response must build")
}
