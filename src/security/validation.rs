use regex::Regex;
use std::sync::LazyLock;

use crate::core::error::{ApiError, FieldError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    Required(String),
    TooShort { field: String, min: usize, actual: usize },
    TooLong { field: String, max: usize, actual: usize },
    InvalidFormat { field: String, expected: String },
    InvalidRange { field: String, min: String, max: String },
    InvalidValue { field: String, message: String },
    InvalidEmail(String),
    InvalidUrl(String),
}

impl ValidationError {
    pub fn field(&self) -> &str {
        match self {
            Self::Required(field)
            | Self::TooShort { field, .. }
            | Self::TooLong { field, .. }
            | Self::InvalidFormat { field, .. }
            | Self::InvalidRange { field, .. }
            | Self::InvalidValue { field, .. }
            | Self::InvalidEmail(field)
            | Self::InvalidUrl(field) => field,
        }
    }

    pub fn message(&self) -> String {
        match self {
            Self::Required(_) => "is required".to_string(),
            Self::TooShort { min, actual, .. } => {
                format!("must be at least {min} characters (got {actual})")
            }
            Self::TooLong { max, actual, .. } => {
                format!("must be at most {max} characters (got {actual})")
            }
            Self::InvalidFormat { expected, .. } => format!("has invalid format, expected {expected}"),
            Self::InvalidRange { min, max, .. } => format!("must be between {min} and {max}"),
            Self::InvalidValue { message, .. } => message.clone(),
            Self::InvalidEmail(_) => "must be a valid email address".to_string(),
            Self::InvalidUrl(_) => "must be a valid https:// URL".to_string(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field(), self.message())
    }
}

impl std::error::Error for ValidationError {}

impl From<ValidationError> for FieldError {
    fn from(err: ValidationError) -> Self {
        FieldError::new(err.field(), err.message())
    }
}

impl From<ValidationError> for ApiError {
    fn from(err: ValidationError) -> Self {
        ApiError::validation(vec![err.into()])
    }
}

static EMAIL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^[a-zA-Z0-9.!#$%&'*+/=?^_`{|}~-]+@[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?(?:\.[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?)*$"
    ).expect("Invalid email regex")
});

static HTTPS_URL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^https://[a-zA-Z0-9][-a-zA-Z0-9]*(\.[a-zA-Z0-9][-a-zA-Z0-9]*)*(:[0-9]{1,5})?(/[-a-zA-Z0-9()@:%_\+.~#?&/=]*)?$"
    ).expect("Invalid URL regex")
});

static SLUG_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]+(?:-[a-z0-9]+)*$").expect("Invalid slug regex")
});

static IDENTIFIER_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*$").expect("Invalid identifier regex")
});

pub fn validate_required(value: &str, field_name: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        Err(ValidationError::Required(field_name.to_string()))
    } else {
        Ok(())
    }
}

/// Lengths are counted in characters, not bytes.
pub fn validate_length(
    value: &str,
    field_name: &str,
    min: Option<usize>,
    max: Option<usize>,
) -> Result<(), ValidationError> {
    let len = value.chars().count();

    if let Some(min_len) = min {
        if len < min_len {
            return Err(ValidationError::TooShort {
                field: field_name.to_string(),
                min: min_len,
                actual: len,
            });
        }
    }

    if let Some(max_len) = max {
        if len > max_len {
            return Err(ValidationError::TooLong {
                field: field_name.to_string(),
                max: max_len,
                actual: len,
            });
        }
    }

    Ok(())
}

pub fn validate_email(email: &str, field_name: &str) -> Result<(), ValidationError> {
    if email.len() > 254 || !EMAIL_REGEX.is_match(email) {
        return Err(ValidationError::InvalidEmail(field_name.to_string()));
    }
    Ok(())
}

/// Outbound URLs must be HTTPS; plain HTTP is rejected here, before anything is stored.
pub fn validate_https_url(url: &str, field_name: &str) -> Result<(), ValidationError> {
    if url.len() > 2048 || !HTTPS_URL_REGEX.is_match(url) {
        return Err(ValidationError::InvalidUrl(field_name.to_string()));
    }
    Ok(())
}

pub fn validate_slug(value: &str, field_name: &str) -> Result<(), ValidationError> {
    if SLUG_REGEX.is_match(value) {
        Ok(())
    } else {
        Err(ValidationError::InvalidFormat {
            field: field_name.to_string(),
            expected: "lowercase alphanumeric with hyphens".to_string(),
        })
    }
}

pub fn validate_identifier(value: &str, field_name: &str) -> Result<(), ValidationError> {
    validate_length(value, field_name, Some(1), Some(50))?;
    if IDENTIFIER_REGEX.is_match(value) {
        Ok(())
    } else {
        Err(ValidationError::InvalidFormat {
            field: field_name.to_string(),
            expected: "letters, digits, '.', '_' or '-'".to_string(),
        })
    }
}

pub fn validate_range<T: PartialOrd + std::fmt::Display>(
    value: T,
    field_name: &str,
    min: T,
    max: T,
) -> Result<(), ValidationError> {
    if value < min || value > max {
        return Err(ValidationError::InvalidRange {
            field: field_name.to_string(),
            min: min.to_string(),
            max: max.to_string(),
        });
    }
    Ok(())
}

/// Collects every field error of a request before anything is written.
#[derive(Debug, Default)]
pub struct Validator {
    errors: Vec<ValidationError>,
}

impl Validator {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(mut self, result: Result<(), ValidationError>) -> Self {
        if let Err(e) = result {
            self.errors.push(e);
        }
        self
    }

    pub fn required(self, value: &str, field_name: &str) -> Self {
        self.push(validate_required(value, field_name))
    }

    pub fn length(self, value: &str, field_name: &str, min: Option<usize>, max: Option<usize>) -> Self {
        self.push(validate_length(value, field_name, min, max))
    }

    pub fn optional_length(self, value: Option<&str>, field_name: &str, max: usize) -> Self {
        match value {
            Some(v) => self.push(validate_length(v, field_name, None, Some(max))),
            None => self,
        }
    }

    pub fn email(self, value: &str, field_name: &str) -> Self {
        self.push(validate_email(value, field_name))
    }

    pub fn https_url(self, value: &str, field_name: &str) -> Self {
        self.push(validate_https_url(value, field_name))
    }

    pub fn slug(self, value: &str, field_name: &str) -> Self {
        self.push(validate_slug(value, field_name))
    }

    pub fn identifier(self, value: &str, field_name: &str) -> Self {
        self.push(validate_identifier(value, field_name))
    }

    pub fn range<T: PartialOrd + std::fmt::Display>(self, value: T, field_name: &str, min: T, max: T) -> Self {
        self.push(validate_range(value, field_name, min, max))
    }

    pub fn optional_range<T: PartialOrd + std::fmt::Display>(
        self,
        value: Option<T>,
        field_name: &str,
        min: T,
        max: T,
    ) -> Self {
        match value {
            Some(v) => self.push(validate_range(v, field_name, min, max)),
            None => self,
        }
    }

    pub fn check(self, ok: bool, field_name: &str, message: &str) -> Self {
        if ok {
            self
        } else {
            self.push(Err(ValidationError::InvalidValue {
                field: field_name.to_string(),
                message: message.to_string(),
            }))
        }
    }

    pub fn error(self, error: ValidationError) -> Self {
        self.push(Err(error))
    }

    pub fn validate(self) -> Result<(), ApiError> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(ApiError::validation(
                self.errors.into_iter().map(FieldError::from).collect(),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_required() {
        assert!(validate_required("x", "name").is_ok());
        assert_eq!(
            validate_required("   ", "name"),
            Err(ValidationError::Required("name".into()))
        );
    }

    #[test]
    fn test_validate_length_counts_chars() {
        assert!(validate_length("héllo", "t", Some(5), Some(5)).is_ok());
        assert!(validate_length("abc", "t", Some(4), None).is_err());
        assert!(validate_length("abcdef", "t", None, Some(5)).is_err());
    }

    #[test]
    fn test_validate_email() {
        assert!(validate_email("ana@example.com", "email").is_ok());
        assert!(validate_email("not-an-email", "email").is_err());
    }

    #[test]
    fn test_https_only() {
        assert!(validate_https_url("https://hooks.slack.com/services/T0/B0/x", "url").is_ok());
        assert!(validate_https_url("https://example.com:8443/hook", "url").is_ok());
        assert!(validate_https_url("http://hooks.slack.com/services/T0", "url").is_err());
        assert!(validate_https_url("ftp://example.com", "url").is_err());
    }

    #[test]
    fn test_validate_identifier() {
        assert!(validate_identifier("CTRL-AC-001", "identifier").is_ok());
        assert!(validate_identifier("", "identifier").is_err());
        assert!(validate_identifier("has space", "identifier").is_err());
        assert!(validate_identifier(&"A".repeat(51), "identifier").is_err());
        assert!(validate_identifier(&"A".repeat(50), "identifier").is_ok());
    }

    #[test]
    fn test_validate_slug() {
        assert!(validate_slug("acme-corp", "slug").is_ok());
        assert!(validate_slug("Acme Corp", "slug").is_err());
    }

    #[test]
    fn test_validate_range() {
        assert!(validate_range(5, "retry_count", 0, 5).is_ok());
        assert!(validate_range(6, "retry_count", 0, 5).is_err());
    }

    #[test]
    fn test_validator_collects_all_errors() {
        let result = Validator::new()
            .required("", "title")
            .range(0, "timeout_seconds", 1, 3600)
            .check(true, "ok", "never reported")
            .validate();

        match result {
            Err(ApiError::Validation { details, .. }) => {
                assert_eq!(details.len(), 2);
                assert_eq!(details[0].field, "title");
                assert_eq!(details[1].field, "timeout_seconds");
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_validator_passes() {
        assert!(Validator::new()
            .length("title", "title", Some(1), Some(500))
            .optional_length(None, "notes", 10)
            .validate()
            .is_ok());
    }
}
