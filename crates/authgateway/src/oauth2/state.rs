//! The OAuth `state` parameter codec.
//!
//! `state` is the base64url encoding of `{"url":"…","csrf_token":"…"}`.
//! It survives the browser round-trip through the authorization server
//! and carries both the URL to return the user to and the CSRF token to
//! compare against the nonce cookie.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginState {
	pub url: String,
	pub csrf_token: String,
}

pub fn encode(
	original_request_url: &str,
	csrf_token: &str,
) -> Result<String, serde_json::Error> {
	let state = LoginState {
		url: original_request_url.to_string(),
		csrf_token: csrf_token.to_string(),
	};
	let json = serde_json::to_string(&state)?;
	Ok(URL_SAFE_NO_PAD.encode(json))
}

/// Best effort: malformed base64, malformed JSON or missing fields all
/// yield `None` and fail the callback upstream.
pub fn decode(state: &str) -> Option<LoginState> {
	let raw = URL_SAFE_NO_PAD.decode(state.as_bytes()).ok()?;
	serde_json::from_slice(&raw).ok()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn round_trips_url_and_token() {
		let encoded = encode("https://app.example.com/page?a=1&b=2", "nonce.mac").unwrap();
		let decoded = decode(&encoded).expect("state decodes");
		assert_eq!(decoded.url, "https://app.example.com/page?a=1&b=2");
		assert_eq!(decoded.csrf_token, "nonce.mac");
	}

	#[test]
	fn json_field_order_is_url_then_csrf_token() {
		let encoded = encode("https://app.example.com/", "t").unwrap();
		let json = URL_SAFE_NO_PAD.decode(encoded).unwrap();
		assert_eq!(
			std::str::from_utf8(&json).unwrap(),
			r#"{"url":"https://app.example.com/","csrf_token":"t"}"#
		);
	}

	#[test]
	fn escapes_json_metacharacters() {
		let encoded = encode(r#"https://app.example.com/?q="quoted""#, "a\\b").unwrap();
		let decoded = decode(&encoded).expect("state decodes");
		assert_eq!(decoded.url, r#"https://app.example.com/?q="quoted""#);
		assert_eq!(decoded.csrf_token, "a\\b");
	}

	#[test]
	fn rejects_invalid_base64() {
		assert!(decode("not%valid%base64").is_none());
	}

	#[test]
	fn rejects_non_json_payload() {
		let encoded = URL_SAFE_NO_PAD.encode("not json");
		assert!(decode(&encoded).is_none());
	}

	#[test]
	fn rejects_missing_fields() {
		let encoded = URL_SAFE_NO_PAD.encode(r#"{"url":"https://app.example.com/"}"#);
		assert!(decode(&encoded).is_none());
		let encoded = URL_SAFE_NO_PAD.encode(r#"{"csrf_token":"t"}"#);
		assert!(decode(&encoded).is_none());
	}
}
