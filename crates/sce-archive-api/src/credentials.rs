//! Password hashing and opaque token generation.

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use rand::RngCore;
use sce_archive_core::ArchiveError;

const MIN_PASSWORD_LEN: usize = 8;
const TOKEN_BYTES: usize = 32;

/// Argon2id hash with the default cost parameters that no password matches.
/// Verified in place of a real hash when a login names an unknown email.
const PLACEHOLDER_HASH: &str =
    "$argon2id$v=19$m=19456,t=2,p=1$MDEyMzQ1Njc4OTo7PD0+Pw$CzBVep/E6Q4zWH2ix+wRNluApcrvFDleg6jN8hc8YYY";

/// Hash a password with Argon2id and return the PHC string.
///
/// # Errors
/// Returns [`ArchiveError::Storage`] when the hasher fails.
pub fn hash_password(password: &str) -> Result<String, ArchiveError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|err| ArchiveError::Storage(format!("failed to hash password: {err}")))
}

/// `Ok(false)` for a wrong password; `Err` only when the stored hash is unreadable.
///
/// # Errors
/// Returns [`ArchiveError::Storage`] when `hash` is not a PHC string.
pub fn verify_password(password: &str, hash: &str) -> Result<bool, ArchiveError> {
    let parsed = PasswordHash::new(hash)
        .map_err(|err| ArchiveError::Storage(format!("stored password hash is malformed: {err}")))?;
    Ok(Argon2::default().verify_password(password.as_bytes(), &parsed).is_ok())
}

/// Spend one full password verification without an account to check against,
/// so an unknown email costs as much as a wrong password.
///
/// # Errors
/// Returns [`ArchiveError::Storage`] only if the placeholder hash cannot be parsed.
pub fn verify_without_account(password: &str) -> Result<(), ArchiveError> {
    verify_password(password, PLACEHOLDER_HASH).map(|_| ())
}

/// # Errors
/// Returns [`ArchiveError::Validation`] when the password is too short.
pub fn validate_password(password: &str) -> Result<(), ArchiveError> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(ArchiveError::validation(format!(
            "password MUST be at least {MIN_PASSWORD_LEN} characters"
        )));
    }
    Ok(())
}

/// Random hex token for sessions and email verification.
#[must_use]
pub fn generate_token() -> String {
    let mut bytes = [0_u8; TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_and_verify() -> Result<(), ArchiveError> {
        let hash = hash_password("correct-horse-battery-staple")?;
        assert!(hash.starts_with("$argon2"));
        assert!(verify_password("correct-horse-battery-staple", &hash)?);
        assert!(!verify_password("wrong-password", &hash)?);
        Ok(())
    }

    #[test]
    fn same_password_hashes_differently() -> Result<(), ArchiveError> {
        let first = hash_password("same-password")?;
        let second = hash_password("same-password")?;
        assert_ne!(first, second);
        assert!(verify_password("same-password", &first)?);
        assert!(verify_password("same-password", &second)?);
        Ok(())
    }

    #[test]
    fn malformed_hash_is_an_error() {
        assert!(verify_password("password", "not-a-valid-hash").is_err());
    }

    #[test]
    fn placeholder_hash_parses_and_matches_nothing() -> Result<(), ArchiveError> {
        let parsed = PasswordHash::new(PLACEHOLDER_HASH)
            .map_err(|err| ArchiveError::Storage(err.to_string()))?;
        assert_eq!(parsed.algorithm.as_str(), "argon2id");
        assert!(!verify_password("correct-horse-battery-staple", PLACEHOLDER_HASH)?);
        assert!(!verify_password("", PLACEHOLDER_HASH)?);
        verify_without_account("any-password")?;
        Ok(())
    }

    #[test]
    fn short_passwords_are_rejected() {
        assert!(validate_password("short").is_err());
        assert!(validate_password("long-enough").is_ok());
    }

    #[test]
    fn tokens_are_hex_and_unique() {
        let first = generate_token();
        let second = generate_token();
        assert_eq!(first.len(), TOKEN_BYTES * 2);
        assert!(first.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(first, second);
    }
}
