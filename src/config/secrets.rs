//! Secret handling utilities.
//!
//! Re-exports secrecy types and provides a constant-time comparison for
//! checking submitted credentials against configured ones.

pub use secrecy::{ExposeSecret, SecretBox, SecretString};
use subtle::ConstantTimeEq;

/// Compare a submitted password against a configured secret without
/// leaking the match position through timing.
pub fn secret_matches(expected: &SecretString, given: &str) -> bool {
    let expected = expected.expose_secret().as_bytes();
    let given = given.as_bytes();
    expected.len() == given.len() && bool::from(expected.ct_eq(given))
}
