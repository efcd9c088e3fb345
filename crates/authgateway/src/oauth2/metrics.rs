//! Filter counters, exported through `prometheus-client`.

use prometheus_client::metrics::counter::Counter;
use prometheus_client::registry::Registry;

/// Counters the filter maintains over its lifetime. Cloning shares the
/// underlying atomics.
#[derive(Debug, Default, Clone)]
pub struct FilterStats {
	pub oauth_passthrough: Counter,
	pub oauth_success: Counter,
	pub oauth_failure: Counter,
	pub oauth_unauthorized_rq: Counter,
	pub oauth_refreshtoken_success: Counter,
	pub oauth_refreshtoken_failure: Counter,
}

impl FilterStats {
	pub fn register(registry: &mut Registry) -> Self {
		let stats = FilterStats::default();
		registry.register(
			"oauth_passthrough",
			"Requests released untouched by a pass-through matcher",
			stats.oauth_passthrough.clone(),
		);
		registry.register(
			"oauth_success",
			"Requests carrying a valid session or completing a token grant",
			stats.oauth_success.clone(),
		);
		registry.register(
			"oauth_failure",
			"Requests answered with a local 401",
			stats.oauth_failure.clone(),
		);
		registry.register(
			"oauth_unauthorized_rq",
			"Unauthenticated requests redirected to the authorization server",
			stats.oauth_unauthorized_rq.clone(),
		);
		registry.register(
			"oauth_refreshtoken_success",
			"Successful refresh-token exchanges",
			stats.oauth_refreshtoken_success.clone(),
		);
		registry.register(
			"oauth_refreshtoken_failure",
			"Failed refresh-token exchanges",
			stats.oauth_refreshtoken_failure.clone(),
		);
		stats
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn clones_share_counters() {
		let mut registry = Registry::default();
		let stats = FilterStats::register(&mut registry);
		let clone = stats.clone();
		clone.oauth_success.inc();
		clone.oauth_success.inc();
		assert_eq!(stats.oauth_success.get(), 2);
	}
}
