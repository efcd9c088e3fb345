//! The token-endpoint client.
//!
//! Two exchanges exist: authorization code for tokens, and refresh token
//! for tokens. Exactly one of success or failure resolves per call;
//! dropping the returned future cancels the outbound request. The filter
//! only depends on the [`TokenClient`] contract, the reqwest-backed
//! [`HttpTokenClient`] is the production implementation.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::debug;
use url::Url;

use super::config::{AuthType, RetryPolicy};
use crate::http::StatusCode;

#[derive(Debug, thiserror::Error)]
pub enum TokenClientError {
	#[error("token endpoint request failed: {0}")]
	Transport(#[from] reqwest::Error),
	#[error("token endpoint returned {status}: {body}")]
	Endpoint { status: StatusCode, body: String },
	#[error("token endpoint response omitted expires_in and no default is configured")]
	MissingExpiry,
}

/// Token material from a successful exchange. Absent fields are empty
/// strings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenResponse {
	pub access_token: String,
	pub id_token: String,
	pub refresh_token: String,
	pub expires_in: u64,
}

#[async_trait]
pub trait TokenClient: Send + Sync + std::fmt::Debug {
	async fn fetch_access_token(
		&self,
		auth_code: &str,
		client_id: &str,
		client_secret: &SecretString,
		redirect_uri: &str,
		auth_type: AuthType,
	) -> Result<TokenResponse, TokenClientError>;

	async fn refresh_access_token(
		&self,
		refresh_token: &str,
		client_id: &str,
		client_secret: &SecretString,
		auth_type: AuthType,
	) -> Result<TokenResponse, TokenClientError>;
}

#[derive(Deserialize)]
struct RawTokenResponse {
	access_token: String,
	#[serde(default)]
	id_token: String,
	#[serde(default)]
	refresh_token: String,
	#[serde(default)]
	expires_in: Option<u64>,
}

/// RFC 6749 token endpoint client over HTTPS.
#[derive(Debug, Clone)]
pub struct HttpTokenClient {
	http: reqwest::Client,
	token_endpoint: Url,
	/// Fallback access-token TTL; zero requires the IdP to supply one.
	default_expires_in: u64,
	retry_policy: Option<RetryPolicy>,
}

impl HttpTokenClient {
	pub fn new(
		token_endpoint: Url,
		default_expires_in: u64,
		retry_policy: Option<RetryPolicy>,
	) -> Self {
		Self {
			http: reqwest::Client::new(),
			token_endpoint,
			default_expires_in,
			retry_policy,
		}
	}

	async fn exchange(
		&self,
		mut form: Vec<(&'static str, String)>,
		client_id: &str,
		client_secret: &SecretString,
		auth_type: AuthType,
	) -> Result<TokenResponse, TokenClientError> {
		if auth_type == AuthType::UrlEncodedBody {
			form.push(("client_id", client_id.to_string()));
			form.push(("client_secret", client_secret.expose_secret().to_string()));
		}

		let max_attempts = 1 + self.retry_policy.map_or(0, |p| p.num_retries);
		let mut attempt = 0;
		let response = loop {
			attempt += 1;
			let mut request = self.http.post(self.token_endpoint.clone()).form(&form);
			if auth_type == AuthType::BasicAuth {
				request = request.basic_auth(client_id, Some(client_secret.expose_secret()));
			}
			match request.send().await {
				Ok(response) if response.status().is_server_error() && attempt < max_attempts => {
					debug!(
						status = %response.status(),
						attempt,
						"token endpoint returned a server error, retrying"
					);
				},
				Ok(response) => break response,
				Err(err) if (err.is_connect() || err.is_timeout()) && attempt < max_attempts => {
					debug!(error = %err, attempt, "token endpoint request failed, retrying");
				},
				Err(err) => return Err(err.into()),
			}
			if let Some(policy) = self.retry_policy {
				tokio::time::sleep(Duration::from_millis(policy.backoff_ms)).await;
			}
		};

		let status = StatusCode::from_u16(response.status().as_u16())
			.unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
		if !response.status().is_success() {
			let body = response.text().await.unwrap_or_default();
			return Err(TokenClientError::Endpoint { status, body });
		}

		let raw: RawTokenResponse = response.json().await?;
		let expires_in = raw
			.expires_in
			.or((self.default_expires_in > 0).then_some(self.default_expires_in))
			.ok_or(TokenClientError::MissingExpiry)?;
		Ok(TokenResponse {
			access_token: raw.access_token,
			id_token: raw.id_token,
			refresh_token: raw.refresh_token,
			expires_in,
		})
	}
}

#[async_trait]
impl TokenClient for HttpTokenClient {
	async fn fetch_access_token(
		&self,
		auth_code: &str,
		client_id: &str,
		client_secret: &SecretString,
		redirect_uri: &str,
		auth_type: AuthType,
	) -> Result<TokenResponse, TokenClientError> {
		let form = vec![
			("grant_type", "authorization_code".to_string()),
			("code", auth_code.to_string()),
			("redirect_uri", redirect_uri.to_string()),
		];
		self.exchange(form, client_id, client_secret, auth_type).await
	}

	async fn refresh_access_token(
		&self,
		refresh_token: &str,
		client_id: &str,
		client_secret: &SecretString,
		auth_type: AuthType,
	) -> Result<TokenResponse, TokenClientError> {
		let form = vec![
			("grant_type", "refresh_token".to_string()),
			("refresh_token", refresh_token.to_string()),
		];
		self.exchange(form, client_id, client_secret, auth_type).await
	}
}
