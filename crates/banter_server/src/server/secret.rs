#![forbid(unsafe_code)]

use core::fmt;

/// Wrapper for secret material (HMAC keys, minted tokens) that keeps the
/// value out of `Debug`/`Display` output and logs.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(value: impl Into<String>) -> Self {
		Self(value.into())
	}

	/// Access the underlying secret. Call sites should be deliberate.
	pub fn expose(&self) -> &str {
		&self.0
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}
