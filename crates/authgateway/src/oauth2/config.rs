//! Filter configuration.
//!
//! `OAuth2Policy` is the serde-facing record; `FilterConfig::new`
//! validates it once and pre-computes everything derivable (parsed
//! endpoint URLs, the merged authorization query parameters, the encoded
//! resource suffix). The result is immutable and shared by reference
//! across all concurrent requests.

use std::sync::Arc;

use anyhow::anyhow;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use url::Url;

use super::cookies::{CookieKind, CookieNames, CookieSettings};
use crate::http::HeaderMap;

/// Scope requested when the policy specifies none.
const DEFAULT_AUTH_SCOPE: &str = "user";

/// Everything outside RFC 3986 unreserved is escaped.
const QUERY_PARAM_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
	.remove(b'-')
	.remove(b'.')
	.remove(b'_')
	.remove(b'~');

pub(crate) fn url_encode_query_param(value: &str) -> String {
	utf8_percent_encode(value, QUERY_PARAM_ENCODE_SET).to_string()
}

/// How client credentials reach the token endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
	BasicAuth,
	#[default]
	UrlEncodedBody,
}

/// Path predicate. Matching ignores the query and fragment portions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathMatcher {
	Exact(String),
	Prefix(String),
}

impl PathMatcher {
	pub fn matches(&self, path: &str) -> bool {
		let path = path.split(['?', '#']).next().unwrap_or_default();
		match self {
			PathMatcher::Exact(exact) => path == exact,
			PathMatcher::Prefix(prefix) => path.starts_with(prefix),
		}
	}
}

/// Header predicate. A name alone matches on presence; `exact` wins over
/// `prefix` when both are given.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeaderMatcher {
	pub name: String,
	pub exact: Option<String>,
	pub prefix: Option<String>,
}

impl HeaderMatcher {
	pub fn matches(&self, headers: &HeaderMap) -> bool {
		let Some(value) = headers.get(&self.name).and_then(|v| v.to_str().ok()) else {
			return false;
		};
		match (&self.exact, &self.prefix) {
			(Some(exact), _) => value == exact,
			(None, Some(prefix)) => value.starts_with(prefix),
			(None, None) => true,
		}
	}
}

/// Retry policy for the outbound token-endpoint client. Applies to 5xx
/// responses and transport-level failures only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
	pub num_retries: u32,
	pub backoff_ms: u64,
}

impl Default for RetryPolicy {
	fn default() -> Self {
		Self {
			num_retries: 1,
			backoff_ms: 250,
		}
	}
}

/// Supplies the most recently loaded secret material. Implementations
/// may rotate behind this interface; callers read a snapshot at each use.
pub trait SecretReader: Send + Sync + std::fmt::Debug {
	fn hmac_secret(&self) -> SecretString;
	fn client_secret(&self) -> SecretString;
}

/// Fixed secrets, for policies that inline their credentials.
#[derive(Debug, Clone)]
pub struct StaticSecretReader {
	hmac_secret: SecretString,
	client_secret: SecretString,
}

impl StaticSecretReader {
	pub fn new(hmac_secret: SecretString, client_secret: SecretString) -> Self {
		Self {
			hmac_secret,
			client_secret,
		}
	}
}

impl SecretReader for StaticSecretReader {
	fn hmac_secret(&self) -> SecretString {
		self.hmac_secret.clone()
	}

	fn client_secret(&self) -> SecretString {
		self.client_secret.clone()
	}
}

/// Per-role cookie attribute overrides.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CookieConfigs {
	pub bearer_token_cookie_config: CookieSettings,
	pub oauth_hmac_cookie_config: CookieSettings,
	pub oauth_expires_cookie_config: CookieSettings,
	pub id_token_cookie_config: CookieSettings,
	pub refresh_token_cookie_config: CookieSettings,
	pub oauth_nonce_cookie_config: CookieSettings,
}

impl CookieConfigs {
	/// The role table: every role reads its own settings, including the
	/// nonce cookie.
	pub fn settings(&self, kind: CookieKind) -> CookieSettings {
		match kind {
			CookieKind::BearerToken => self.bearer_token_cookie_config,
			CookieKind::OauthHmac => self.oauth_hmac_cookie_config,
			CookieKind::OauthExpires => self.oauth_expires_cookie_config,
			CookieKind::IdToken => self.id_token_cookie_config,
			CookieKind::RefreshToken => self.refresh_token_cookie_config,
			CookieKind::OauthNonce => self.oauth_nonce_cookie_config,
		}
	}
}

fn default_refresh_token_expires_in() -> u64 {
	604_800
}

fn default_use_refresh_token() -> bool {
	true
}

/// The serde-facing policy record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuth2Policy {
	/// Token endpoint of the authorization server.
	pub token_endpoint: String,
	/// Authorization endpoint; query parameters already present on the
	/// URL are preserved on the redirect.
	pub authorization_endpoint: String,
	pub client_id: String,
	/// Template for the OAuth `redirect_uri`; `{scheme}` and `{host}`
	/// expand from the request at hand.
	pub redirect_uri: String,
	/// Matches the proxy-local path the authorization server redirects
	/// back to.
	pub redirect_path_matcher: PathMatcher,
	pub signout_path: PathMatcher,
	#[serde(default)]
	pub auth_scopes: Vec<String>,
	/// Extra `resource` entries appended to the authorization redirect.
	#[serde(default)]
	pub resources: Vec<String>,
	#[serde(default)]
	pub pass_through_matchers: Vec<HeaderMatcher>,
	#[serde(default)]
	pub deny_redirect_matchers: Vec<HeaderMatcher>,
	#[serde(default)]
	pub cookie_names: CookieNames,
	#[serde(default)]
	pub cookie_domain: String,
	#[serde(default)]
	pub auth_type: AuthType,
	/// Access-token TTL when the token endpoint omits `expires_in`.
	/// Zero means the IdP-supplied value is required.
	#[serde(default)]
	pub default_expires_in: u64,
	/// Refresh-token cookie TTL when the refresh token carries no
	/// usable `exp` claim.
	#[serde(default = "default_refresh_token_expires_in")]
	pub default_refresh_token_expires_in: u64,
	#[serde(default)]
	pub forward_bearer_token: bool,
	#[serde(default)]
	pub preserve_authorization_header: bool,
	#[serde(default = "default_use_refresh_token")]
	pub use_refresh_token: bool,
	#[serde(default)]
	pub disable_id_token_set_cookie: bool,
	#[serde(default)]
	pub disable_access_token_set_cookie: bool,
	#[serde(default)]
	pub disable_refresh_token_set_cookie: bool,
	#[serde(default)]
	pub cookie_configs: CookieConfigs,
	#[serde(default)]
	pub retry_policy: Option<RetryPolicy>,
}

/// Validated, immutable configuration shared across requests.
#[derive(Debug)]
pub struct FilterConfig {
	pub(crate) token_endpoint: Url,
	pub(crate) authorization_endpoint: Url,
	/// Pre-merged authorization query parameters. Values are stored
	/// already percent-encoded; `state` and `redirect_uri` are
	/// overwritten per request.
	pub(crate) authorization_query_params: Vec<(String, String)>,
	pub(crate) client_id: String,
	pub(crate) redirect_uri: String,
	pub(crate) redirect_matcher: PathMatcher,
	pub(crate) signout_matcher: PathMatcher,
	pub(crate) secret_reader: Arc<dyn SecretReader>,
	pub(crate) encoded_resource_query_params: String,
	pub(crate) pass_through_matchers: Vec<HeaderMatcher>,
	pub(crate) deny_redirect_matchers: Vec<HeaderMatcher>,
	pub(crate) cookie_names: CookieNames,
	pub(crate) cookie_domain: String,
	pub(crate) auth_type: AuthType,
	pub(crate) default_expires_in: u64,
	pub(crate) default_refresh_token_expires_in: u64,
	pub(crate) forward_bearer_token: bool,
	pub(crate) preserve_authorization_header: bool,
	pub(crate) use_refresh_token: bool,
	pub(crate) disable_id_token_set_cookie: bool,
	pub(crate) disable_access_token_set_cookie: bool,
	pub(crate) disable_refresh_token_set_cookie: bool,
	pub(crate) cookie_configs: CookieConfigs,
	pub(crate) retry_policy: Option<RetryPolicy>,
}

impl FilterConfig {
	pub fn new(
		policy: OAuth2Policy,
		secret_reader: Arc<dyn SecretReader>,
	) -> anyhow::Result<Self> {
		let token_endpoint = Url::parse(&policy.token_endpoint)
			.map_err(|e| anyhow!("invalid token endpoint URL `{}`: {e}", policy.token_endpoint))?;
		let authorization_endpoint = Url::parse(&policy.authorization_endpoint).map_err(|e| {
			anyhow!(
				"invalid authorization endpoint URL `{}`: {e}",
				policy.authorization_endpoint
			)
		})?;

		// The template must yield a parsable URL for a nominal request.
		let probe = format_redirect_uri(&policy.redirect_uri, "https", "redirect.example.com");
		Url::parse(&probe)
			.map_err(|e| anyhow!("invalid redirect_uri template `{}`: {e}", policy.redirect_uri))?;

		let authorization_query_params =
			build_authorization_query_params(&authorization_endpoint, &policy);
		let encoded_resource_query_params = encode_resource_list(&policy.resources);

		Ok(Self {
			token_endpoint,
			authorization_endpoint,
			authorization_query_params,
			client_id: policy.client_id,
			redirect_uri: policy.redirect_uri,
			redirect_matcher: policy.redirect_path_matcher,
			signout_matcher: policy.signout_path,
			secret_reader,
			encoded_resource_query_params,
			pass_through_matchers: policy.pass_through_matchers,
			deny_redirect_matchers: policy.deny_redirect_matchers,
			cookie_names: policy.cookie_names,
			cookie_domain: policy.cookie_domain,
			auth_type: policy.auth_type,
			default_expires_in: policy.default_expires_in,
			default_refresh_token_expires_in: policy.default_refresh_token_expires_in,
			forward_bearer_token: policy.forward_bearer_token,
			preserve_authorization_header: policy.preserve_authorization_header,
			use_refresh_token: policy.use_refresh_token,
			disable_id_token_set_cookie: policy.disable_id_token_set_cookie,
			disable_access_token_set_cookie: policy.disable_access_token_set_cookie,
			disable_refresh_token_set_cookie: policy.disable_refresh_token_set_cookie,
			cookie_configs: policy.cookie_configs,
			retry_policy: policy.retry_policy,
		})
	}

	pub fn hmac_secret(&self) -> SecretString {
		self.secret_reader.hmac_secret()
	}

	pub fn client_secret(&self) -> SecretString {
		self.secret_reader.client_secret()
	}
}

pub(crate) fn format_redirect_uri(template: &str, scheme: &str, host: &str) -> String {
	template.replace("{scheme}", scheme).replace("{host}", host)
}

/// Replace the first occurrence of `key`, dropping any duplicates, or
/// append when absent. `value` must already be encoded.
pub(crate) fn overwrite_query_param(params: &mut Vec<(String, String)>, key: &str, value: String) {
	params.retain(|(k, _)| k != key);
	params.push((key.to_string(), value));
}

/// Serialize pre-encoded pairs; no further escaping is applied.
pub(crate) fn serialize_query_params(params: &[(String, String)]) -> String {
	params
		.iter()
		.map(|(k, v)| format!("{k}={v}"))
		.collect::<Vec<_>>()
		.join("&")
}

/// Raw (undecoded) query pairs from the configured authorization URL,
/// preserved verbatim so values are not double-encoded later.
fn parse_raw_query(query: &str) -> Vec<(String, String)> {
	query
		.split('&')
		.filter(|pair| !pair.is_empty())
		.map(|pair| match pair.split_once('=') {
			Some((k, v)) => (k.to_string(), v.to_string()),
			None => (pair.to_string(), String::new()),
		})
		.collect()
}

fn build_authorization_query_params(
	authorization_endpoint: &Url,
	policy: &OAuth2Policy,
) -> Vec<(String, String)> {
	let mut params = parse_raw_query(authorization_endpoint.query().unwrap_or_default());
	overwrite_query_param(&mut params, "client_id", policy.client_id.clone());
	overwrite_query_param(&mut params, "response_type", "code".to_string());
	let scopes = if policy.auth_scopes.is_empty() {
		DEFAULT_AUTH_SCOPE.to_string()
	} else {
		policy.auth_scopes.join(" ")
	};
	overwrite_query_param(&mut params, "scope", url_encode_query_param(&scopes));
	params
}

fn encode_resource_list(resources: &[String]) -> String {
	resources
		.iter()
		.map(|resource| format!("&resource={}", url_encode_query_param(resource)))
		.collect()
}

#[cfg(test)]
mod tests {
	use crate::http::HeaderValue;

	use super::*;

	fn test_policy() -> OAuth2Policy {
		serde_json::from_value(serde_json::json!({
			"token_endpoint": "https://idp.example.com/token",
			"authorization_endpoint": "https://idp.example.com/authorize",
			"client_id": "client-id",
			"redirect_uri": "{scheme}://{host}/_oauth",
			"redirect_path_matcher": { "exact": "/_oauth" },
			"signout_path": { "exact": "/signout" },
		}))
		.expect("policy deserializes")
	}

	fn test_secrets() -> Arc<dyn SecretReader> {
		Arc::new(StaticSecretReader::new(
			SecretString::from("hmac-secret"),
			SecretString::from("client-secret"),
		))
	}

	#[test]
	fn policy_defaults() {
		let policy = test_policy();
		assert_eq!(policy.default_refresh_token_expires_in, 604_800);
		assert_eq!(policy.default_expires_in, 0);
		assert!(policy.use_refresh_token);
		assert_eq!(policy.auth_type, AuthType::UrlEncodedBody);
		assert_eq!(policy.cookie_names.oauth_hmac, "OauthHMAC");
	}

	#[test]
	fn config_rejects_invalid_token_endpoint() {
		let mut policy = test_policy();
		policy.token_endpoint = "not a url".to_string();
		let err = FilterConfig::new(policy, test_secrets()).unwrap_err();
		assert!(err.to_string().contains("invalid token endpoint URL"));
	}

	#[test]
	fn config_rejects_invalid_authorization_endpoint() {
		let mut policy = test_policy();
		policy.authorization_endpoint = "::not-a-url::".to_string();
		let err = FilterConfig::new(policy, test_secrets()).unwrap_err();
		assert!(
			err.to_string()
				.contains("invalid authorization endpoint URL")
		);
	}

	#[test]
	fn config_rejects_unparsable_redirect_template() {
		let mut policy = test_policy();
		policy.redirect_uri = "not-a-template".to_string();
		let err = FilterConfig::new(policy, test_secrets()).unwrap_err();
		assert!(err.to_string().contains("invalid redirect_uri template"));
	}

	#[test]
	fn authorization_params_default_scope_is_user() {
		let config = FilterConfig::new(test_policy(), test_secrets()).unwrap();
		assert!(
			config
				.authorization_query_params
				.contains(&("scope".to_string(), "user".to_string()))
		);
		assert!(
			config
				.authorization_query_params
				.contains(&("response_type".to_string(), "code".to_string()))
		);
	}

	#[test]
	fn authorization_params_percent_encode_joined_scopes() {
		let mut policy = test_policy();
		policy.auth_scopes = vec!["user".to_string(), "admin".to_string()];
		let config = FilterConfig::new(policy, test_secrets()).unwrap();
		assert!(
			config
				.authorization_query_params
				.contains(&("scope".to_string(), "user%20admin".to_string()))
		);
	}

	#[test]
	fn authorization_params_preserve_existing_query() {
		let mut policy = test_policy();
		policy.authorization_endpoint =
			"https://idp.example.com/authorize?audience=api&client_id=stale".to_string();
		let config = FilterConfig::new(policy, test_secrets()).unwrap();
		assert!(
			config
				.authorization_query_params
				.contains(&("audience".to_string(), "api".to_string()))
		);
		// The stale client_id from the URL is overwritten, not duplicated.
		let client_ids: Vec<_> = config
			.authorization_query_params
			.iter()
			.filter(|(k, _)| k == "client_id")
			.collect();
		assert_eq!(client_ids, vec![&("client_id".to_string(), "client-id".to_string())]);
	}

	#[test]
	fn resource_list_is_pre_encoded() {
		let mut policy = test_policy();
		policy.resources = vec![
			"https://api.example.com/".to_string(),
			"urn:resource".to_string(),
		];
		let config = FilterConfig::new(policy, test_secrets()).unwrap();
		assert_eq!(
			config.encoded_resource_query_params,
			"&resource=https%3A%2F%2Fapi.example.com%2F&resource=urn%3Aresource"
		);
	}

	#[test]
	fn path_matcher_ignores_query_and_fragment() {
		let exact = PathMatcher::Exact("/_oauth".to_string());
		assert!(exact.matches("/_oauth"));
		assert!(exact.matches("/_oauth?code=x&state=y"));
		assert!(exact.matches("/_oauth#frag"));
		assert!(!exact.matches("/_oauth2"));

		let prefix = PathMatcher::Prefix("/api".to_string());
		assert!(prefix.matches("/api/v1/resource?x=1"));
		assert!(!prefix.matches("/app"));
	}

	#[test]
	fn header_matcher_modes() {
		let mut headers = HeaderMap::new();
		headers.insert("x-health-check", HeaderValue::from_static("probe-1"));

		let present = HeaderMatcher {
			name: "x-health-check".to_string(),
			..Default::default()
		};
		assert!(present.matches(&headers));

		let exact = HeaderMatcher {
			name: "x-health-check".to_string(),
			exact: Some("probe-1".to_string()),
			..Default::default()
		};
		assert!(exact.matches(&headers));

		let exact_miss = HeaderMatcher {
			name: "x-health-check".to_string(),
			exact: Some("probe-2".to_string()),
			..Default::default()
		};
		assert!(!exact_miss.matches(&headers));

		let prefix = HeaderMatcher {
			name: "x-health-check".to_string(),
			prefix: Some("probe-".to_string()),
			..Default::default()
		};
		assert!(prefix.matches(&headers));

		let absent = HeaderMatcher {
			name: "x-other".to_string(),
			..Default::default()
		};
		assert!(!absent.matches(&headers));
	}

	#[test]
	fn overwrite_query_param_drops_duplicates() {
		let mut params = vec![
			("a".to_string(), "1".to_string()),
			("b".to_string(), "2".to_string()),
			("a".to_string(), "3".to_string()),
		];
		overwrite_query_param(&mut params, "a", "new".to_string());
		assert_eq!(
			serialize_query_params(&params),
			"b=2&a=new"
		);
	}

	#[test]
	fn policy_round_trips_through_serde() {
		let policy = test_policy();
		let json = serde_json::to_string(&policy).unwrap();
		let back: OAuth2Policy = serde_json::from_str(&json).unwrap();
		assert_eq!(back.client_id, policy.client_id);
		assert_eq!(back.redirect_path_matcher, policy.redirect_path_matcher);
	}
}
