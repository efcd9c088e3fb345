//! Session cookie formatting and parsing.
//!
//! The emitted `Set-Cookie` strings are part of the wire contract with
//! sessions minted by earlier releases, so they are assembled from the
//! literal templates rather than through a cookie builder. Inbound
//! `Cookie` headers are parsed with the `cookie` crate.

use std::collections::BTreeMap;

use cookie::Cookie;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::http::{HeaderMap, header};

/// Roles in the cookie roster. Each role resolves its own SameSite
/// setting and TTL source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CookieKind {
	OauthHmac,
	OauthExpires,
	BearerToken,
	IdToken,
	RefreshToken,
	OauthNonce,
}

/// Cookie names carrying the session envelope, all configurable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CookieNames {
	pub oauth_hmac: String,
	pub oauth_expires: String,
	pub bearer_token: String,
	pub id_token: String,
	pub refresh_token: String,
	pub oauth_nonce: String,
}

impl Default for CookieNames {
	fn default() -> Self {
		Self {
			oauth_hmac: "OauthHMAC".to_string(),
			oauth_expires: "OauthExpires".to_string(),
			bearer_token: "BearerToken".to_string(),
			id_token: "IdToken".to_string(),
			refresh_token: "RefreshToken".to_string(),
			oauth_nonce: "OauthNonce".to_string(),
		}
	}
}

impl CookieNames {
	/// The five authority-carrying cookies bound together by the HMAC.
	/// The nonce cookie is deliberately not part of the envelope.
	pub fn is_session_cookie(&self, name: &str) -> bool {
		name == self.oauth_hmac
			|| name == self.oauth_expires
			|| name == self.bearer_token
			|| name == self.id_token
			|| name == self.refresh_token
	}
}

/// SameSite attribute for one cookie role. `Disabled` omits the
/// attribute entirely.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SameSite {
	#[default]
	Disabled,
	Strict,
	Lax,
	None,
}

impl SameSite {
	pub fn attribute(self) -> &'static str {
		match self {
			SameSite::Disabled => "",
			SameSite::Strict => ";SameSite=Strict",
			SameSite::Lax => ";SameSite=Lax",
			SameSite::None => ";SameSite=None",
		}
	}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CookieSettings {
	pub same_site: SameSite,
}

/// `name=value[;domain=d];path=/;Max-Age={ttl};secure;HttpOnly[;SameSite=…]`
pub fn format_set_cookie(
	name: &str,
	value: &str,
	max_age: &str,
	same_site: SameSite,
	cookie_domain: &str,
) -> String {
	let mut tail = format!(
		";path=/;Max-Age={max_age};secure;HttpOnly{}",
		same_site.attribute()
	);
	if !cookie_domain.is_empty() {
		tail = format!(";domain={cookie_domain}{tail}");
	}
	format!("{name}={value}{tail}")
}

/// `name=deleted; path=/; expires=Thu, 01 Jan 1970 00:00:00 GMT[;domain=d]`
pub fn format_delete_cookie(name: &str, cookie_domain: &str) -> String {
	let mut cookie = format!("{name}=deleted; path=/; expires=Thu, 01 Jan 1970 00:00:00 GMT");
	if !cookie_domain.is_empty() {
		cookie.push_str(&format!(";domain={cookie_domain}"));
	}
	cookie
}

/// Parse the request `Cookie` header(s) into a name/value map, keeping
/// only names accepted by the predicate. Malformed fragments are skipped.
pub fn parse_cookies<F>(headers: &HeaderMap, keep: F) -> BTreeMap<String, String>
where
	F: Fn(&str) -> bool,
{
	let mut out = BTreeMap::new();
	for value in headers.get_all(header::COOKIE) {
		let Ok(raw) = value.to_str() else {
			continue;
		};
		for cookie in Cookie::split_parse(raw) {
			match cookie {
				Ok(c) if keep(c.name()) => {
					out.insert(c.name().to_string(), c.value().to_string());
				},
				Ok(_) => {},
				Err(err) => {
					debug!("ignoring malformed cookie: {err}");
				},
			}
		}
	}
	out
}

/// Re-serialize a cookie map as a request `Cookie` header value.
pub fn serialize_cookie_header(cookies: &BTreeMap<String, String>) -> String {
	cookies
		.iter()
		.map(|(name, value)| format!("{name}={value}"))
		.collect::<Vec<_>>()
		.join("; ")
}
