//! Signed double-submit CSRF tokens.
//!
//! A token has the form `nonce "." base64(hmac(secret, nonce))`, per the
//! OWASP signed double-submit cookie scheme. The same token travels as
//! the nonce cookie and inside the OAuth `state` parameter; on callback
//! the two copies must match and the signature must verify.

use rand::Rng;

use super::hmac;

/// Lifetime of the CSRF token cookie. Long enough to complete a login
/// round-trip through the authorization server.
pub const COOKIE_MAX_AGE_SECS: u64 = 600;

/// Generate a fresh token from 64 bits of CSPRNG output.
pub fn generate(secret: &[u8]) -> String {
	let nonce: u64 = rand::rng().random();
	let nonce = format!("{nonce:016x}");
	let mac = hmac::sign(secret, &nonce);
	format!("{nonce}.{mac}")
}

/// Check that `token` was produced by [`generate`] with the same secret.
/// Tokens without a `.` separator are rejected outright.
pub fn validate(secret: &[u8], token: &str) -> bool {
	let Some((nonce, mac)) = token.split_once('.') else {
		return false;
	};
	hmac::constant_time_eq(&hmac::sign(secret, nonce), mac)
}

#[cfg(test)]
mod tests {
	use super::*;

	const SECRET: &[u8] = b"csrf-secret";

	#[test]
	fn generated_tokens_validate() {
		let token = generate(SECRET);
		assert!(validate(SECRET, &token));
	}

	#[test]
	fn nonce_is_sixteen_hex_chars() {
		let token = generate(SECRET);
		let (nonce, _) = token.split_once('.').expect("token has separator");
		assert_eq!(nonce.len(), 16);
		assert!(nonce.chars().all(|c| c.is_ascii_hexdigit()));
	}

	#[test]
	fn tampered_nonce_is_rejected() {
		let token = generate(SECRET);
		let (nonce, mac) = token.split_once('.').unwrap();
		let mut flipped = nonce.to_string();
		flipped.replace_range(0..1, if nonce.starts_with('0') { "1" } else { "0" });
		assert!(!validate(SECRET, &format!("{flipped}.{mac}")));
	}

	#[test]
	fn tampered_mac_is_rejected() {
		let token = generate(SECRET);
		assert!(!validate(SECRET, &format!("{token}x")));
	}

	#[test]
	fn wrong_secret_is_rejected() {
		let token = generate(SECRET);
		assert!(!validate(b"other-secret", &token));
	}

	#[test]
	fn token_without_separator_is_rejected() {
		assert!(!validate(SECRET, "no-separator-here"));
		assert!(!validate(SECRET, ""));
	}
}
