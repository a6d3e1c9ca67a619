//! Transaction PIN hashing for payout requests.

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};
use uuid::Uuid;

use hikopo_storage::StorageError;

use crate::error::{LedgerError, LedgerResult};

/// Argon2id hasher. Verification reads its cost parameters from the stored
/// PHC string, so hashes made with different costs stay verifiable.
#[derive(Debug, Clone)]
pub struct PinHasher {
    params: Params,
}

impl Default for PinHasher {
    fn default() -> Self {
        Self {
            params: Params::default(),
        }
    }
}

impl PinHasher {
    /// Cheap parameters for tests and local development.
    pub fn low_cost() -> Self {
        Self {
            params: Params::new(1024, 1, 1, None).unwrap_or_default(),
        }
    }

    fn argon2(&self) -> Argon2<'static> {
        Argon2::new(Algorithm::Argon2id, Version::V0x13, self.params.clone())
    }

    pub fn hash(&self, pin: &str) -> LedgerResult<String> {
        validate_pin_format(pin)?;
        let salt = SaltString::encode_b64(Uuid::new_v4().as_bytes()).map_err(hash_error)?;
        let hash = self
            .argon2()
            .hash_password(pin.as_bytes(), &salt)
            .map_err(hash_error)?;
        Ok(hash.to_string())
    }

    pub fn verify(&self, pin: &str, stored_hash: &str) -> LedgerResult<bool> {
        let parsed = PasswordHash::new(stored_hash).map_err(hash_error)?;
        Ok(self
            .argon2()
            .verify_password(pin.as_bytes(), &parsed)
            .is_ok())
    }
}

/// PINs are 4 to 6 ASCII digits.
pub fn validate_pin_format(pin: &str) -> LedgerResult<()> {
    if (4..=6).contains(&pin.len()) && pin.bytes().all(|b| b.is_ascii_digit()) {
        Ok(())
    } else {
        Err(LedgerError::InvalidPinFormat)
    }
}

fn hash_error(err: argon2::password_hash::Error) -> LedgerError {
    LedgerError::Storage(StorageError::Backend(format!("pin hash: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_hash_and_verify() {
        let hasher = PinHasher::low_cost();
        let hash = hasher.hash("4821").unwrap();

        assert!(hash.starts_with("$argon2id$"));
        assert!(hasher.verify("4821", &hash).unwrap());
        assert!(!hasher.verify("4822", &hash).unwrap());
    }

    #[test]
    fn test_salts_differ() {
        let hasher = PinHasher::low_cost();
        assert_ne!(hasher.hash("123456").unwrap(), hasher.hash("123456").unwrap());
    }

    #[test]
    fn test_rejects_malformed_pin() {
        assert!(validate_pin_format("123").is_err());
        assert!(validate_pin_format("1234567").is_err());
        assert!(validate_pin_format("12a4").is_err());
        assert!(validate_pin_format("０１２３").is_err());
    }

    proptest! {
        #[test]
        fn digit_pins_of_valid_length_are_accepted(pin in "[0-9]{4,6}") {
            prop_assert!(validate_pin_format(&pin).is_ok());
        }
    }
}
