//! HTTP vocabulary shared across the crate.

pub use http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header};

pub type Body = axum::body::Body;
pub type Request = http::Request<Body>;
pub type Response = http::Response<Body>;

/// Outcome of applying a filter to a request.
///
/// `direct_response` short-circuits the request with a locally generated
/// response. When it is `None` the request continues to the next filter;
/// any `response_headers` are appended to the eventual upstream response
/// exactly once, at response encode time. This is how deferred Set-Cookie
/// emission from the refresh flow reaches the client.
#[derive(Debug, Default)]
pub struct PolicyResponse {
	pub direct_response: Option<Response>,
	pub response_headers: Option<HeaderMap>,
}

impl PolicyResponse {
	pub fn with_response(mut self, resp: Response) -> Self {
		self.direct_response = Some(resp);
		self
	}

	pub fn should_short_circuit(&self) -> bool {
		self.direct_response.is_some()
	}

	/// Stage the deferred headers onto an upstream response. The proxy's
	/// encode phase calls this once per request.
	pub fn apply_response_headers(&mut self, resp: &mut Response) {
		if let Some(headers) = self.response_headers.take() {
			for (name, value) in headers {
				if let Some(name) = name {
					resp.headers_mut().append(name, value);
				}
			}
		}
	}
}
