#![forbid(unsafe_code)]

use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, anyhow};
use banter_domain::IdentityId;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::debug;

use crate::server::secret::SecretString;

/// Claims carried by a `v1.<payload>.<sig>` session token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthClaims {
	/// Identity id the token was minted for.
	pub sub: String,
	/// Display name at mint time.
	pub name: String,
	/// Expiry, seconds since the Unix epoch.
	pub exp: u64,
}

/// Mint a stateless HMAC-SHA256 session token.
pub fn mint_token(claims: &AuthClaims, secret: &str) -> anyhow::Result<String> {
	let payload = serde_json::to_vec(claims).context("serialize token claims")?;
	let payload_b64 = URL_SAFE_NO_PAD.encode(payload);
	let sig = sign(payload_b64.as_bytes(), secret.as_bytes());
	Ok(format!("v1.{payload_b64}.{}", URL_SAFE_NO_PAD.encode(sig)))
}

/// Verify a session token's signature and expiry, returning its claims.
pub fn verify_token(token: &str, secret: &str) -> anyhow::Result<AuthClaims> {
	let parts = token.split('.').collect::<Vec<_>>();
	if parts.len() != 3 || parts[0] != "v1" {
		return Err(anyhow!("invalid token format"));
	}

	let payload_b64 = parts[1];
	let sig_b64 = parts[2];

	let payload = URL_SAFE_NO_PAD.decode(payload_b64).context("decode token payload")?;
	let expected_sig = sign(payload_b64.as_bytes(), secret.as_bytes());
	let provided_sig = URL_SAFE_NO_PAD.decode(sig_b64).context("decode token signature")?;

	if !constant_time_eq(&expected_sig, &provided_sig) {
		return Err(anyhow!("invalid token signature"));
	}

	let claims: AuthClaims = serde_json::from_slice(&payload).context("parse token claims")?;
	let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
	if claims.exp <= now {
		return Err(anyhow!("token expired"));
	}

	Ok(claims)
}

fn sign(payload_b64: &[u8], secret: &[u8]) -> Vec<u8> {
	let mut mac = Hmac::<Sha256>::new_from_slice(secret).expect("hmac key");
	mac.update(payload_b64);
	mac.finalize().into_bytes().to_vec()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
	if a.len() != b.len() {
		return false;
	}

	let mut diff = 0u8;
	for (x, y) in a.iter().zip(b.iter()) {
		diff |= x ^ y;
	}

	diff == 0
}

/// A successfully verified logical participant.
#[derive(Debug, Clone)]
pub struct VerifiedIdentity {
	pub id: IdentityId,
	pub display_name: String,
}

/// External credential-verification seam. Implementations decide what a
/// token means; callers treat `None` exactly like "no token provided" and
/// degrade the session to a guest identity.
#[async_trait::async_trait]
pub trait CredentialVerifier: Send + Sync {
	async fn verify(&self, token: &str) -> Option<VerifiedIdentity>;
}

/// Verifier for the server's own stateless HMAC tokens.
pub struct HmacVerifier {
	secret: SecretString,
}

impl HmacVerifier {
	pub fn new(secret: SecretString) -> Self {
		Self { secret }
	}
}

#[async_trait::async_trait]
impl CredentialVerifier for HmacVerifier {
	async fn verify(&self, token: &str) -> Option<VerifiedIdentity> {
		let claims = match verify_token(token, self.secret.expose()) {
			Ok(claims) => claims,
			Err(e) => {
				debug!(error = %e, "session token rejected; falling back to guest");
				return None;
			}
		};

		let id = IdentityId::new(claims.sub).ok()?;
		Some(VerifiedIdentity {
			id,
			display_name: claims.name,
		})
	}
}
