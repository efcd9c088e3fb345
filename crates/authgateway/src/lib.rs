//! An OAuth2 Authorization Code grant filter for reverse proxies.
//!
//! The filter intercepts user traffic, enforces authenticated sessions by
//! redirecting unauthenticated browsers through an external Identity
//! Provider, persists the session as a set of HMAC-bound cookies on the
//! user agent, and transparently renews credentials with refresh tokens.
//! Sessions are stateless by construction: nothing is stored server-side.

pub mod http;
pub mod oauth2;
