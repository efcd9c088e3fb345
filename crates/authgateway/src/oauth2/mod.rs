//! The OAuth2 Authorization Code grant filter.
//!
//! Each request walks a fixed decision ladder where every rung is
//! terminal: pass through, sign out, race redirect, continue with a
//! valid session, silent refresh, redirect to the authorization server,
//! or complete the login callback. Session state lives entirely on the
//! user agent as a set of cookies bound together by an HMAC over
//! `domain \n expires \n access \n id \n refresh`.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use prometheus_client::registry::Registry;
use secrecy::ExposeSecret;
use tracing::{debug, warn};
use url::{Url, form_urlencoded};

use crate::http::{
	Body, HeaderMap, HeaderValue, PolicyResponse, Request, Response, StatusCode, header,
};

pub mod client;
pub mod config;
pub mod cookies;
pub mod csrf;
pub mod hmac;
pub mod jwt;
pub mod metrics;
pub mod session;
pub mod state;

use self::client::{HttpTokenClient, TokenClient, TokenResponse};
use self::config::{FilterConfig, OAuth2Policy, SecretReader};
use self::cookies::CookieKind;
use self::metrics::FilterStats;
use self::session::SessionCookies;

const UNAUTHORIZED_BODY: &str = "OAuth flow failed.";

// Flow tags attached to the corresponding local responses in logs.
const REDIRECT_RACE: &str = "oauth.race_redirect";
const REDIRECT_LOGGED_IN: &str = "oauth.logged_in";
const REDIRECT_FOR_CREDENTIALS: &str = "oauth.missing_credentials";
const SIGN_OUT: &str = "oauth.sign_out";

/// Infrastructure failures only. Authentication failures are answered
/// with the filter's own 401 and are not errors.
#[derive(Debug, thiserror::Error)]
pub enum FilterError {
	#[error("request has no usable Host")]
	MissingHost,
	#[error("failed to build local response: {0}")]
	Response(#[from] http::Error),
	#[error("header value rejected: {0}")]
	InvalidHeaderValue(#[from] http::header::InvalidHeaderValue),
	#[error("failed to encode login state: {0}")]
	StateEncode(#[from] serde_json::Error),
}

/// Outcome of a successful callback validation: the authorization code
/// to exchange and the URL to return the user to. Any failed check maps
/// to `None` and a 401 downstream.
#[derive(Debug, PartialEq, Eq)]
struct CallbackValidation {
	auth_code: String,
	original_request_url: String,
}

/// Token material captured from one grant, with the `disable_*` policy
/// already applied and per-cookie lifetimes derived. Lives for a single
/// request.
#[derive(Debug)]
struct SessionUpdate {
	access_token: String,
	id_token: String,
	refresh_token: String,
	expires_in: String,
	new_expires: String,
	expires_id_token_in: String,
	expires_refresh_token_in: String,
	hmac: String,
}

/// The filter. Configuration is immutable and shared; each request owns
/// its mutable state exclusively, so no locking happens here.
#[derive(Debug)]
pub struct OAuth2Filter {
	config: Arc<FilterConfig>,
	token_client: Arc<dyn TokenClient>,
	stats: FilterStats,
}

impl OAuth2Filter {
	pub fn new(
		policy: OAuth2Policy,
		secret_reader: Arc<dyn SecretReader>,
		registry: &mut Registry,
	) -> anyhow::Result<Self> {
		let config = Arc::new(FilterConfig::new(policy, secret_reader)?);
		let token_client: Arc<dyn TokenClient> = Arc::new(HttpTokenClient::new(
			config.token_endpoint.clone(),
			config.default_expires_in,
			config.retry_policy,
		));
		Ok(Self {
			config,
			token_client,
			stats: FilterStats::register(registry),
		})
	}

	/// Swap the outbound token client, for alternative transports.
	pub fn with_token_client(mut self, token_client: Arc<dyn TokenClient>) -> Self {
		self.token_client = token_client;
		self
	}

	#[tracing::instrument(skip_all, fields(path = %req.uri().path()))]
	pub async fn apply(&self, req: &mut Request) -> Result<PolicyResponse, FilterError> {
		// Pass-through wins before Authorization sanitization so trusted
		// upstream credentials survive untouched.
		if self
			.config
			.pass_through_matchers
			.iter()
			.any(|m| m.matches(req.headers()))
		{
			self.stats.oauth_passthrough.inc();
			debug!("pass-through matcher hit, skipping oauth");
			return Ok(PolicyResponse::default());
		}

		if !self.config.preserve_authorization_header {
			// Inbound bearer credentials cannot be validated here; when
			// forwarding is enabled the header is re-set from the cookie.
			req.headers_mut().remove(header::AUTHORIZATION);
		}

		let host = request_host(req).ok_or(FilterError::MissingHost)?;
		let path_and_query = request_path_and_query(req);

		if self.config.signout_matcher.matches(&path_and_query) {
			return self.sign_out(req, &host);
		}

		let now = SystemTime::now();
		let hmac_secret = self.config.hmac_secret();
		let secret = hmac_secret.expose_secret().as_bytes();
		let session = SessionCookies::from_request(req.headers(), &self.config.cookie_names);
		let on_callback_path = self.config.redirect_matcher.matches(&path_and_query);

		if session.is_valid(secret, &self.config.cookie_domain, now) {
			self.stats.oauth_success.inc();
			if self.config.forward_bearer_token && !session.bearer_token().is_empty() {
				set_bearer_token(req.headers_mut(), session.bearer_token())?;
			}
			if on_callback_path {
				return self.race_redirect(req, &path_and_query, secret);
			}
			debug!("session cookies are valid, continuing");
			return Ok(PolicyResponse::default());
		}

		if !on_callback_path {
			if self.config.use_refresh_token && session.can_update_by_refresh_token() {
				return self.refresh_flow(req, &session, &host, secret, now).await;
			}
			if self.can_redirect_to_idp(req.headers()) {
				return self.redirect_to_idp(req, &host, &path_and_query, secret);
			}
			debug!("redirect to the authorization server is denied for this request");
			return self.unauthorized();
		}

		self
			.callback_flow(req, &path_and_query, &host, secret, now)
			.await
	}

	/// A logged-in user re-hit the callback path, typically a cached IdP
	/// login racing several redirected resource fetches. CSRF discipline
	/// still applies before bouncing the user back, and a state URL that
	/// itself points at the callback is refused to break redirect loops.
	fn race_redirect(
		&self,
		req: &Request,
		path_and_query: &str,
		secret: &[u8],
	) -> Result<PolicyResponse, FilterError> {
		let Some(callback) = self.validate_callback(req.headers(), path_and_query, secret) else {
			return self.unauthorized();
		};
		let Ok(original) = Url::parse(&callback.original_request_url) else {
			return self.unauthorized();
		};
		let original_path = match original.query() {
			Some(query) => format!("{}?{query}", original.path()),
			None => original.path().to_string(),
		};
		if self.config.redirect_matcher.matches(&original_path) {
			debug!(
				url = %callback.original_request_url,
				"state url matches the callback path, refusing redirect loop"
			);
			return self.unauthorized();
		}
		debug!(flow = REDIRECT_RACE, location = %callback.original_request_url, "redirecting");
		let resp = http::Response::builder()
			.status(StatusCode::FOUND)
			.header(header::LOCATION, callback.original_request_url)
			.body(Body::empty())?;
		Ok(PolicyResponse::default().with_response(resp))
	}

	fn sign_out(&self, req: &Request, host: &str) -> Result<PolicyResponse, FilterError> {
		let names = &self.config.cookie_names;
		let mut resp = http::Response::builder()
			.status(StatusCode::FOUND)
			.header(
				header::LOCATION,
				format!("{}://{host}/", request_scheme(req)),
			)
			.body(Body::empty())?;
		for name in [
			&names.oauth_hmac,
			&names.oauth_expires,
			&names.bearer_token,
			&names.id_token,
			&names.refresh_token,
			&names.oauth_nonce,
		] {
			let cookie = cookies::format_delete_cookie(name, &self.config.cookie_domain);
			resp.headers_mut()
				.append(header::SET_COOKIE, HeaderValue::from_str(&cookie)?);
		}
		debug!(flow = SIGN_OUT, "clearing session cookies");
		Ok(PolicyResponse::default().with_response(resp))
	}

	fn can_redirect_to_idp(&self, headers: &HeaderMap) -> bool {
		!self
			.config
			.deny_redirect_matchers
			.iter()
			.any(|m| m.matches(headers))
	}

	fn redirect_to_idp(
		&self,
		req: &Request,
		host: &str,
		path_and_query: &str,
		secret: &[u8],
	) -> Result<PolicyResponse, FilterError> {
		let scheme = request_scheme(req);
		let original_url = format!("{scheme}://{host}{path_and_query}");

		// Reuse an existing nonce cookie after checking its signature;
		// mint and set a fresh one otherwise.
		let names = &self.config.cookie_names;
		let existing_nonce = cookies::parse_cookies(req.headers(), |n| n == names.oauth_nonce)
			.remove(&names.oauth_nonce);
		let (csrf_token, nonce_cookie) = match existing_nonce {
			Some(token) => {
				if !csrf::validate(secret, &token) {
					warn!("csrf token cookie failed validation, refusing redirect");
					return self.unauthorized();
				}
				(token, None)
			},
			None => {
				let token = csrf::generate(secret);
				let cookie = cookies::format_set_cookie(
					&names.oauth_nonce,
					&token,
					&csrf::COOKIE_MAX_AGE_SECS.to_string(),
					self
						.config
						.cookie_configs
						.settings(CookieKind::OauthNonce)
						.same_site,
					&self.config.cookie_domain,
				);
				(token, Some(cookie))
			},
		};

		let state = state::encode(&original_url, &csrf_token)?;
		let redirect_uri =
			config::format_redirect_uri(&self.config.redirect_uri, scheme, host);

		let mut params = self.config.authorization_query_params.clone();
		config::overwrite_query_param(&mut params, "state", state);
		config::overwrite_query_param(
			&mut params,
			"redirect_uri",
			config::url_encode_query_param(&redirect_uri),
		);

		let mut endpoint = self.config.authorization_endpoint.clone();
		endpoint.set_query(None);
		endpoint.set_fragment(None);
		let location = format!(
			"{endpoint}?{}{}",
			config::serialize_query_params(&params),
			self.config.encoded_resource_query_params
		);

		let mut resp = http::Response::builder()
			.status(StatusCode::FOUND)
			.header(header::LOCATION, location)
			.body(Body::empty())?;
		if let Some(cookie) = nonce_cookie {
			resp.headers_mut()
				.append(header::SET_COOKIE, HeaderValue::from_str(&cookie)?);
		}
		self.stats.oauth_unauthorized_rq.inc();
		debug!(flow = REDIRECT_FOR_CREDENTIALS, "redirecting to the authorization server");
		Ok(PolicyResponse::default().with_response(resp))
	}

	async fn refresh_flow(
		&self,
		req: &mut Request,
		session: &SessionCookies,
		host: &str,
		secret: &[u8],
		now: SystemTime,
	) -> Result<PolicyResponse, FilterError> {
		debug!("attempting to update the access token with the refresh token");
		let client_secret = self.config.client_secret();
		let result = self
			.token_client
			.refresh_access_token(
				session.refresh_token(),
				&self.config.client_id,
				&client_secret,
				self.config.auth_type,
			)
			.await;

		let tokens = match result {
			Ok(tokens) => tokens,
			Err(err) => {
				debug!(error = %err, "refresh token exchange failed");
				self.stats.oauth_refreshtoken_failure.inc();
				let path_and_query = request_path_and_query(req);
				if self.can_redirect_to_idp(req.headers()) {
					return self.redirect_to_idp(req, host, &path_and_query, secret);
				}
				return self.unauthorized();
			},
		};

		let update = self.capture_tokens(tokens, host, secret, now);

		// First leg of the dual write: the current request's Cookie
		// header is rewritten in place so the upstream sees the renewed
		// credentials on this very request.
		let names = &self.config.cookie_names;
		let mut cookie_map = cookies::parse_cookies(req.headers(), |_| true);
		cookie_map.insert(names.oauth_hmac.clone(), update.hmac.clone());
		cookie_map.insert(names.oauth_expires.clone(), update.new_expires.clone());
		if !update.access_token.is_empty() {
			cookie_map.insert(names.bearer_token.clone(), update.access_token.clone());
		}
		if !update.id_token.is_empty() {
			cookie_map.insert(names.id_token.clone(), update.id_token.clone());
		}
		if !update.refresh_token.is_empty() {
			cookie_map.insert(names.refresh_token.clone(), update.refresh_token.clone());
		}
		let rewritten = cookies::serialize_cookie_header(&cookie_map);
		req.headers_mut()
			.insert(header::COOKIE, HeaderValue::from_str(&rewritten)?);
		if self.config.forward_bearer_token && !update.access_token.is_empty() {
			set_bearer_token(req.headers_mut(), &update.access_token)?;
		}

		// Second leg: the same cookies go to the browser as Set-Cookie
		// when the upstream response is encoded.
		let mut response_headers = HeaderMap::new();
		self.add_response_cookies(&mut response_headers, &update)?;

		self.stats.oauth_refreshtoken_success.inc();
		self.stats.oauth_success.inc();
		Ok(PolicyResponse {
			direct_response: None,
			response_headers: Some(response_headers),
		})
	}

	async fn callback_flow(
		&self,
		req: &Request,
		path_and_query: &str,
		host: &str,
		secret: &[u8],
		now: SystemTime,
	) -> Result<PolicyResponse, FilterError> {
		let Some(callback) = self.validate_callback(req.headers(), path_and_query, secret) else {
			return self.unauthorized();
		};

		let redirect_uri =
			config::format_redirect_uri(&self.config.redirect_uri, request_scheme(req), host);
		let client_secret = self.config.client_secret();
		let result = self
			.token_client
			.fetch_access_token(
				&callback.auth_code,
				&self.config.client_id,
				&client_secret,
				&redirect_uri,
				self.config.auth_type,
			)
			.await;

		match result {
			Ok(tokens) => {
				let update = self.capture_tokens(tokens, host, secret, now);
				let mut resp = http::Response::builder()
					.status(StatusCode::FOUND)
					.header(header::LOCATION, callback.original_request_url.as_str())
					.body(Body::empty())?;
				self.add_response_cookies(resp.headers_mut(), &update)?;
				self.stats.oauth_success.inc();
				debug!(
					flow = REDIRECT_LOGGED_IN,
					location = %callback.original_request_url,
					"login complete"
				);
				Ok(PolicyResponse::default().with_response(resp))
			},
			Err(err) => {
				warn!(error = %err, "authorization code exchange failed");
				self.unauthorized()
			},
		}
	}

	fn validate_callback(
		&self,
		headers: &HeaderMap,
		path_and_query: &str,
		secret: &[u8],
	) -> Option<CallbackValidation> {
		let query = path_and_query
			.split_once('?')
			.map(|(_, q)| q)
			.unwrap_or_default();
		let mut code = None;
		let mut state_param = None;
		for (key, value) in form_urlencoded::parse(query.as_bytes()) {
			match key.as_ref() {
				"error" => {
					debug!(error = %value, "authorization server returned an error");
					return None;
				},
				"code" if code.is_none() => code = Some(value.into_owned()),
				"state" if state_param.is_none() => state_param = Some(value.into_owned()),
				_ => {},
			}
		}
		let (Some(auth_code), Some(state_param)) = (code, state_param) else {
			warn!("callback is missing the code or state query parameter");
			return None;
		};
		let Some(login) = state::decode(&state_param) else {
			warn!("state query parameter does not decode to a login state");
			return None;
		};
		if !self.validate_csrf_cookie(headers, &login.csrf_token, secret) {
			warn!("csrf token validation failed");
			return None;
		}
		if Url::parse(&login.url).is_err() {
			warn!(url = %login.url, "state url cannot be parsed");
			return None;
		}
		Some(CallbackValidation {
			auth_code,
			original_request_url: login.url,
		})
	}

	/// The state's CSRF token must equal the nonce cookie byte for byte
	/// and carry a valid signature. Equal-but-forged pairs are how an
	/// attacker would inject their own tokens into a victim's session.
	fn validate_csrf_cookie(&self, headers: &HeaderMap, csrf_token: &str, secret: &[u8]) -> bool {
		let names = &self.config.cookie_names;
		let cookies = cookies::parse_cookies(headers, |n| n == names.oauth_nonce);
		match cookies.get(&names.oauth_nonce) {
			Some(cookie) => {
				hmac::constant_time_eq(cookie, csrf_token) && csrf::validate(secret, csrf_token)
			},
			None => false,
		}
	}

	/// Apply the `disable_*` policy, derive per-cookie lifetimes and
	/// compute the envelope HMAC. Lifetime probes run on the raw tokens;
	/// the disable policy clears fields for signing and emission only.
	fn capture_tokens(
		&self,
		tokens: TokenResponse,
		host: &str,
		secret: &[u8],
		now: SystemTime,
	) -> SessionUpdate {
		let expires_id_token_in = expires_time_for_id_token(&tokens.id_token, tokens.expires_in, now);
		let expires_refresh_token_in =
			self.expires_time_for_refresh_token(&tokens.refresh_token, tokens.expires_in, now);

		let access_token = if self.config.disable_access_token_set_cookie {
			String::new()
		} else {
			tokens.access_token
		};
		let id_token = if self.config.disable_id_token_set_cookie {
			String::new()
		} else {
			tokens.id_token
		};
		let refresh_token = if self.config.disable_refresh_token_set_cookie {
			String::new()
		} else {
			tokens.refresh_token
		};

		let new_expires = (epoch_secs(now) + tokens.expires_in).to_string();
		let domain = if self.config.cookie_domain.is_empty() {
			host
		} else {
			&self.config.cookie_domain
		};
		let payload =
			hmac::session_payload(domain, &new_expires, &access_token, &id_token, &refresh_token);
		let hmac = hmac::sign(secret, &payload);

		SessionUpdate {
			access_token,
			id_token,
			refresh_token,
			expires_in: tokens.expires_in.to_string(),
			new_expires,
			expires_id_token_in,
			expires_refresh_token_in,
			hmac,
		}
	}

	fn expires_time_for_refresh_token(
		&self,
		refresh_token: &str,
		expires_in: u64,
		now: SystemTime,
	) -> String {
		if self.config.use_refresh_token {
			if let Some(remaining) = jwt::remaining_lifetime(refresh_token, now) {
				return remaining.to_string();
			}
			debug!("refresh token is opaque or has no exp claim, using the configured lifetime");
			return self.config.default_refresh_token_expires_in.to_string();
		}
		expires_in.to_string()
	}

	fn add_response_cookies(
		&self,
		headers: &mut HeaderMap,
		update: &SessionUpdate,
	) -> Result<(), FilterError> {
		let names = &self.config.cookie_names;
		let domain = &self.config.cookie_domain;
		let mut push = |name: &str, value: &str, max_age: &str, kind: CookieKind| {
			let same_site = self.config.cookie_configs.settings(kind).same_site;
			let cookie = cookies::format_set_cookie(name, value, max_age, same_site, domain);
			HeaderValue::from_str(&cookie)
				.map(|value| headers.append(header::SET_COOKIE, value))
				.map(|_| ())
		};
		push(&names.oauth_hmac, &update.hmac, &update.expires_in, CookieKind::OauthHmac)?;
		push(
			&names.oauth_expires,
			&update.new_expires,
			&update.expires_in,
			CookieKind::OauthExpires,
		)?;
		if !update.access_token.is_empty() {
			push(
				&names.bearer_token,
				&update.access_token,
				&update.expires_in,
				CookieKind::BearerToken,
			)?;
		}
		if !update.id_token.is_empty() {
			push(
				&names.id_token,
				&update.id_token,
				&update.expires_id_token_in,
				CookieKind::IdToken,
			)?;
		}
		if !update.refresh_token.is_empty() {
			push(
				&names.refresh_token,
				&update.refresh_token,
				&update.expires_refresh_token_in,
				CookieKind::RefreshToken,
			)?;
		}
		Ok(())
	}

	/// Every validation failure collapses to the same local 401.
	fn unauthorized(&self) -> Result<PolicyResponse, FilterError> {
		self.stats.oauth_failure.inc();
		let resp = http::Response::builder()
			.status(StatusCode::UNAUTHORIZED)
			.body(Body::from(UNAUTHORIZED_BODY))?;
		Ok(PolicyResponse::default().with_response(resp))
	}
}

fn expires_time_for_id_token(id_token: &str, expires_in: u64, now: SystemTime) -> String {
	if id_token.is_empty() {
		return expires_in.to_string();
	}
	match jwt::remaining_lifetime(id_token, now) {
		Some(remaining) => remaining.to_string(),
		None => {
			debug!("id token has no usable exp claim, aligning its lifetime with the access token");
			expires_in.to_string()
		},
	}
}

/// https is the default; a client that explicitly speaks plain http
/// keeps it on every rebuilt URL.
fn request_scheme(req: &Request) -> &'static str {
	match req.uri().scheme_str() {
		Some("http") => "http",
		_ => "https",
	}
}

fn request_host(req: &Request) -> Option<String> {
	if let Some(host) = req
		.headers()
		.get(header::HOST)
		.and_then(|v| v.to_str().ok())
	{
		return Some(host.to_string());
	}
	req.uri().authority().map(|a| a.as_str().to_string())
}

fn request_path_and_query(req: &Request) -> String {
	req.uri()
		.path_and_query()
		.map(|pq| pq.as_str().to_string())
		.unwrap_or_else(|| "/".to_string())
}

fn set_bearer_token(headers: &mut HeaderMap, token: &str) -> Result<(), FilterError> {
	let value = HeaderValue::from_str(&format!("Bearer {token}"))?;
	headers.insert(header::AUTHORIZATION, value);
	Ok(())
}

fn epoch_secs(now: SystemTime) -> u64 {
	now.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}
