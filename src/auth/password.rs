//! Password hashing with Argon2id.

use argon2::{
    Algorithm, Argon2, Params, Version,
    password_hash::{PasswordHash, PasswordHasher as _, PasswordVerifier, SaltString},
};
use rand::RngCore;
use std::sync::{Arc, OnceLock};

use super::errors::AuthError;

/// Memory cost in KiB for production hashing.
const DEFAULT_MEMORY_KIB: u32 = 19 * 1024;
const DEFAULT_ITERATIONS: u32 = 2;
const DEFAULT_PARALLELISM: u32 = 1;

/// Input for the hash that stands in when an account has none.
const DUMMY_PASSWORD: &str = "authkit-dummy-password";

/// Argon2id hasher with fixed cost parameters.
///
/// Hashes are self-describing PHC strings, so verification works across
/// parameter changes.
#[derive(Clone)]
pub struct PasswordHasher {
    params: Params,
    /// Hash with this hasher's parameters, computed on first use
    dummy_hash: Arc<OnceLock<String>>,
}

impl Default for PasswordHasher {
    fn default() -> Self {
        Self::new(DEFAULT_MEMORY_KIB, DEFAULT_ITERATIONS, DEFAULT_PARALLELISM)
            .unwrap_or_else(|_| Self::with_params(Params::default()))
    }
}

impl PasswordHasher {
    pub fn new(memory_kib: u32, iterations: u32, parallelism: u32) -> Result<Self, AuthError> {
        let params = Params::new(memory_kib, iterations, parallelism, None)
            .map_err(|e| AuthError::internal("Invalid Argon2 parameters", e))?;
        Ok(Self::with_params(params))
    }

    fn with_params(params: Params) -> Self {
        Self {
            params,
            dummy_hash: Arc::new(OnceLock::new()),
        }
    }

    /// Minimum cost parameters. Only for tests.
    pub fn insecure_fast() -> Self {
        Self::new(Params::MIN_M_COST, Params::MIN_T_COST, Params::MIN_P_COST)
            .unwrap_or_default()
    }

    fn argon2(&self) -> Argon2<'static> {
        Argon2::new(Algorithm::Argon2id, Version::V0x13, self.params.clone())
    }

    pub fn hash(&self, plain: &str) -> Result<String, AuthError> {
        let mut salt_bytes = [0u8; 16];
        rand::rng().fill_bytes(&mut salt_bytes);
        let salt = SaltString::encode_b64(&salt_bytes)
            .map_err(|e| AuthError::internal("Failed to encode salt", e))?;

        self.argon2()
            .hash_password(plain.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|e| AuthError::internal("Failed to hash password", e))
    }

    /// Returns false on mismatch. An unparseable stored hash is an error.
    pub fn verify(&self, plain: &str, hash: &str) -> Result<bool, AuthError> {
        let parsed = PasswordHash::new(hash)
            .map_err(|e| AuthError::internal("Stored password hash is invalid", e))?;
        Ok(self
            .argon2()
            .verify_password(plain.as_bytes(), &parsed)
            .is_ok())
    }

    fn dummy_hash(&self) -> Result<&str, AuthError> {
        if let Some(hash) = self.dummy_hash.get() {
            return Ok(hash.as_str());
        }
        let hash = self.hash(DUMMY_PASSWORD)?;
        Ok(self.dummy_hash.get_or_init(|| hash).as_str())
    }

    /// Spend the same work as a real verification for an account that has
    /// no usable hash. Always false.
    pub fn verify_missing(&self, plain: &str) -> Result<bool, AuthError> {
        let hash = self.dummy_hash()?;
        self.verify(plain, hash)?;
        Ok(false)
    }

    /// Hash on the blocking pool so the async runtime is not stalled.
    pub async fn hash_blocking(&self, plain: &str) -> Result<String, AuthError> {
        let hasher = self.clone();
        let plain = plain.to_string();
        tokio::task::spawn_blocking(move || hasher.hash(&plain))
            .await
            .map_err(|e| AuthError::internal("Password hashing task failed", e))?
    }

    pub async fn verify_blocking(&self, plain: &str, hash: &str) -> Result<bool, AuthError> {
        let hasher = self.clone();
        let plain = plain.to_string();
        let hash = hash.to_string();
        tokio::task::spawn_blocking(move || hasher.verify(&plain, &hash))
            .await
            .map_err(|e| AuthError::internal("Password verification task failed", e))?
    }

    pub async fn verify_missing_blocking(&self, plain: &str) -> Result<bool, AuthError> {
        let hasher = self.clone();
        let plain = plain.to_string();
        tokio::task::spawn_blocking(move || hasher.verify_missing(&plain))
            .await
            .map_err(|e| AuthError::internal("Password verification task failed", e))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_and_verify() {
        let hasher = PasswordHasher::insecure_fast();
        let hash = hasher.hash("correct horse").unwrap();

        assert!(hash.starts_with("$argon2id$"));
        assert!(hasher.verify("correct horse", &hash).unwrap());
        assert!(!hasher.verify("wrong horse", &hash).unwrap());
    }

    #[test]
    fn test_salts_differ() {
        let hasher = PasswordHasher::insecure_fast();
        assert_ne!(hasher.hash("same").unwrap(), hasher.hash("same").unwrap());
    }

    #[test]
    fn test_verify_across_parameters() {
        let fast = PasswordHasher::insecure_fast();
        let other = PasswordHasher::new(Params::MIN_M_COST * 2, 2, 1).unwrap();
        let hash = fast.hash("pw").unwrap();
        assert!(other.verify("pw", &hash).unwrap());
    }

    #[test]
    fn test_invalid_hash_is_error() {
        let hasher = PasswordHasher::insecure_fast();
        assert!(hasher.verify("pw", "not-a-hash").is_err());
    }

    #[test]
    fn test_missing_hash_costs_a_real_verification() {
        let hasher = PasswordHasher::new(Params::MIN_M_COST * 4, 3, 1).unwrap();

        assert!(!hasher.verify_missing(DUMMY_PASSWORD).unwrap());
        assert!(!hasher.verify_missing("anything").unwrap());

        // The stand-in hash uses the same cost as real account hashes
        let dummy = PasswordHash::new(hasher.dummy_hash().unwrap()).unwrap();
        let real_hash = hasher.hash("pw").unwrap();
        let real = PasswordHash::new(&real_hash).unwrap();
        assert_eq!(dummy.algorithm, real.algorithm);
        assert_eq!(dummy.params, real.params);

        // Computed once and shared between clones
        let clone = hasher.clone();
        assert_eq!(clone.dummy_hash().unwrap(), hasher.dummy_hash().unwrap());
    }

    #[tokio::test]
    async fn test_blocking_variants() {
        let hasher = PasswordHasher::insecure_fast();
        let hash = hasher.hash_blocking("pw").await.unwrap();
        assert!(hasher.verify_blocking("pw", &hash).await.unwrap());
        assert!(!hasher.verify_missing_blocking("pw").await.unwrap());
    }
}
