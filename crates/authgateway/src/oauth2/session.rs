//! Session cookie extraction and validation.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::http::{HeaderMap, header};

use super::cookies::{self, CookieNames};
use super::hmac;

/// The session cookie values extracted from one request, together with
/// the request Host used for domain binding. Absent cookies are empty
/// strings, which deliberately feed the HMAC payload as empty slots.
#[derive(Debug, Default)]
pub struct SessionCookies {
	hmac: String,
	expires: String,
	bearer_token: String,
	id_token: String,
	refresh_token: String,
	host: String,
}

impl SessionCookies {
	pub fn from_request(headers: &HeaderMap, names: &CookieNames) -> Self {
		let mut cookies = cookies::parse_cookies(headers, |name| names.is_session_cookie(name));
		let mut take = |name: &str| cookies.remove(name).unwrap_or_default();
		Self {
			hmac: take(&names.oauth_hmac),
			expires: take(&names.oauth_expires),
			bearer_token: take(&names.bearer_token),
			id_token: take(&names.id_token),
			refresh_token: take(&names.refresh_token),
			host: headers
				.get(header::HOST)
				.and_then(|v| v.to_str().ok())
				.unwrap_or_default()
				.to_string(),
		}
	}

	/// The domain bound into the HMAC payload: the configured cookie
	/// domain when non-empty, otherwise the request Host. The signer
	/// applies the same rule.
	fn hmac_domain<'a>(&'a self, cookie_domain: &'a str) -> &'a str {
		if cookie_domain.is_empty() {
			&self.host
		} else {
			cookie_domain
		}
	}

	/// Recompute the envelope HMAC in both encodings and compare against
	/// the `hmac` cookie. Validation always considers all five slots,
	/// regardless of any `disable_*_set_cookie` policy in force.
	pub fn hmac_is_valid(&self, secret: &[u8], cookie_domain: &str) -> bool {
		let payload = hmac::session_payload(
			self.hmac_domain(cookie_domain),
			&self.expires,
			&self.bearer_token,
			&self.id_token,
			&self.refresh_token,
		);
		hmac::constant_time_eq(&hmac::sign(secret, &payload), &self.hmac)
			|| hmac::constant_time_eq(&hmac::sign_legacy(secret, &payload), &self.hmac)
	}

	/// `expires` must be a parsable base-10 deadline strictly in the
	/// future.
	pub fn timestamp_is_valid(&self, now: SystemTime) -> bool {
		let Ok(expires) = self.expires.parse::<u64>() else {
			return false;
		};
		let now = now
			.duration_since(UNIX_EPOCH)
			.unwrap_or_default()
			.as_secs();
		expires > now
	}

	pub fn is_valid(&self, secret: &[u8], cookie_domain: &str, now: SystemTime) -> bool {
		self.hmac_is_valid(secret, cookie_domain) && self.timestamp_is_valid(now)
	}

	/// Refresh is attempted on presence alone; the refresh token plays
	/// no part in HMAC validity for this decision.
	pub fn can_update_by_refresh_token(&self) -> bool {
		!self.refresh_token.is_empty()
	}

	pub fn bearer_token(&self) -> &str {
		&self.bearer_token
	}

	pub fn refresh_token(&self) -> &str {
		&self.refresh_token
	}
}
