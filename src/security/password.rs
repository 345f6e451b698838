use anyhow::{anyhow, Result};
use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Algorithm, Argon2, Params, Version,
};
use serde::{Deserialize, Serialize};

use crate::core::error::{ApiError, FieldError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PasswordPolicy {
    pub min_length: usize,
    pub max_length: usize,
    pub require_uppercase: bool,
    pub require_lowercase: bool,
    pub require_digit: bool,
    pub require_special: bool,
}

impl Default for PasswordPolicy {
    fn default() -> Self {
        Self {
            min_length: 12,
            max_length: 128,
            require_uppercase: true,
            require_lowercase: true,
            require_digit: true,
            require_special: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Argon2Config {
    pub memory_cost_kib: u32,
    pub time_cost: u32,
    pub parallelism: u32,
}

impl Default for Argon2Config {
    fn default() -> Self {
        Self {
            memory_cost_kib: 65536,
            time_cost: 3,
            parallelism: 4,
        }
    }
}

impl Argon2Config {
    /// Smallest parameters argon2 accepts. Only for tests.
    pub fn minimal() -> Self {
        Self {
            memory_cost_kib: 8,
            time_cost: 1,
            parallelism: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PasswordIssue {
    TooShort { min: usize, actual: usize },
    TooLong { max: usize, actual: usize },
    MissingUppercase,
    MissingLowercase,
    MissingDigit,
    MissingSpecial,
}

impl PasswordIssue {
    pub fn message(&self) -> String {
        match self {
            Self::TooShort { min, actual } => {
                format!("Password must be at least {min} characters (currently {actual})")
            }
            Self::TooLong { max, actual } => {
                format!("Password must be at most {max} characters (currently {actual})")
            }
            Self::MissingUppercase => "Password must contain at least one uppercase letter".into(),
            Self::MissingLowercase => "Password must contain at least one lowercase letter".into(),
            Self::MissingDigit => "Password must contain at least one digit".into(),
            Self::MissingSpecial => "Password must contain at least one symbol".into(),
        }
    }
}

pub struct PasswordService {
    argon2: Argon2<'static>,
    policy: PasswordPolicy,
}

impl std::fmt::Debug for PasswordService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PasswordService")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl PasswordService {
    pub fn new(argon2_config: Argon2Config, policy: PasswordPolicy) -> Result<Self> {
        let params = Params::new(
            argon2_config.memory_cost_kib,
            argon2_config.time_cost,
            argon2_config.parallelism,
            None,
        )
        .map_err(|e| anyhow!("Invalid Argon2 parameters: {e}"))?;

        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

        Ok(Self { argon2, policy })
    }

    pub fn hash(&self, password: &str) -> Result<String> {
        let salt = SaltString::generate(&mut OsRng);
        let hash = self
            .argon2
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| anyhow!("Failed to hash password: {e}"))?;

        Ok(hash.to_string())
    }

    pub fn verify(&self, password: &str, hash: &str) -> Result<bool> {
        let parsed_hash =
            PasswordHash::new(hash).map_err(|e| anyhow!("Invalid password hash format: {e}"))?;

        match self.argon2.verify_password(password.as_bytes(), &parsed_hash) {
            Ok(()) => Ok(true),
            Err(argon2::password_hash::Error::Password) => Ok(false),
            Err(e) => Err(anyhow!("Password verification failed: {e}")),
        }
    }

    pub fn check(&self, password: &str) -> Vec<PasswordIssue> {
        let mut issues = Vec::new();

        let length = password.chars().count();
        if length < self.policy.min_length {
            issues.push(PasswordIssue::TooShort {
                min: self.policy.min_length,
                actual: length,
            });
        }
        if length > self.policy.max_length {
            issues.push(PasswordIssue::TooLong {
                max: self.policy.max_length,
                actual: length,
            });
        }

        if self.policy.require_uppercase && !password.chars().any(|c| c.is_uppercase()) {
            issues.push(PasswordIssue::MissingUppercase);
        }
        if self.policy.require_lowercase && !password.chars().any(|c| c.is_lowercase()) {
            issues.push(PasswordIssue::MissingLowercase);
        }
        if self.policy.require_digit && !password.chars().any(|c| c.is_ascii_digit()) {
            issues.push(PasswordIssue::MissingDigit);
        }
        if self.policy.require_special
            && !password.chars().any(|c| !c.is_alphanumeric() && !c.is_whitespace())
        {
            issues.push(PasswordIssue::MissingSpecial);
        }

        issues
    }

    /// Checks `password` against the policy and reports issues under `field`.
    pub fn validate(&self, password: &str, field: &str) -> Result<(), ApiError> {
        let issues = self.check(password);
        if issues.is_empty() {
            return Ok(());
        }
        Err(ApiError::validation(
            issues
                .iter()
                .map(|issue| FieldError::new(field, issue.message()))
                .collect(),
        ))
    }

    /// Hashes `password`, mapping hasher failures into an internal error.
    pub fn hash_for_storage(&self, password: &str) -> Result<String, ApiError> {
        self.hash(password)
            .map_err(|e| ApiError::Internal(format!("password hashing failed: {e}")))
    }

    /// Verifies `password`, treating a malformed stored hash as a mismatch.
    pub fn matches(&self, password: &str, hash: &str) -> bool {
        match self.verify(password, hash) {
            Ok(ok) => ok,
            Err(e) => {
                tracing::error!("stored password hash is unusable: {e}");
                false
            }
        }
    }

    pub fn policy(&self) -> &PasswordPolicy {
        &self.policy
    }
}
