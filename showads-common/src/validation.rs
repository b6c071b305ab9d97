//! # Validation
//!
//! Pure field validators. Each takes the raw field value (or `None` when the row has no such
//! field) and returns the typed value or the `ValidationError` describing the rejection.
//! Counting, logging and error row capture are left to the caller.
use uuid::Uuid;

use crate::error::ValidationError;

pub const MIN_BANNER_ID: i64 = 0;
pub const MAX_BANNER_ID: i64 = 99;

/// Length of the canonical hyphenated UUID representation.
const CANONICAL_UUID_LEN: usize = 36;

/// Accepts a non-empty name made only of letters (any script) and whitespace.
/// Returns the trimmed name.
pub fn validate_name(raw: Option<&str>) -> Result<String, ValidationError> {
    let name = raw.map(str::trim).unwrap_or("");

    if name.is_empty() {
        return Err(ValidationError::InvalidName("name must not be empty".to_owned()));
    }

    if !name.chars().all(|c| c.is_alphabetic() || c.is_whitespace()) {
        return Err(ValidationError::InvalidName(
            "name must contain only letters and spaces".to_owned(),
        ));
    }

    Ok(name.to_owned())
}

/// Accepts an integer age within `min_age..=max_age`.
pub fn validate_age(raw: Option<&str>, min_age: i64, max_age: i64) -> Result<i64, ValidationError> {
    let age = raw
        .map(str::trim)
        .unwrap_or("")
        .parse::<i64>()
        .map_err(|_| ValidationError::InvalidAge("age must be an integer".to_owned()))?;

    if age < min_age || age > max_age {
        return Err(ValidationError::InvalidAge(format!(
            "age must be between {min_age} and {max_age}"
        )));
    }

    Ok(age)
}

/// Accepts an integer banner id within `0..=99`.
pub fn validate_banner_id(raw: Option<&str>) -> Result<u8, ValidationError> {
    let banner_id = raw
        .map(str::trim)
        .unwrap_or("")
        .parse::<i64>()
        .map_err(|_| ValidationError::InvalidBannerId("banner_id must be an integer".to_owned()))?;

    if !(MIN_BANNER_ID..=MAX_BANNER_ID).contains(&banner_id) {
        return Err(ValidationError::InvalidBannerId(format!(
            "banner_id must be between {MIN_BANNER_ID} and {MAX_BANNER_ID}"
        )));
    }

    u8::try_from(banner_id).map_err(|_| {
        ValidationError::InvalidBannerId(format!(
            "banner_id must be between {MIN_BANNER_ID} and {MAX_BANNER_ID}"
        ))
    })
}

/// Accepts a cookie in canonical hyphenated UUID form, returned exactly as given.
pub fn validate_cookie(raw: Option<&str>) -> Result<String, ValidationError> {
    let cookie = raw.unwrap_or("");

    if cookie.len() != CANONICAL_UUID_LEN || Uuid::try_parse(cookie).is_err() {
        return Err(ValidationError::InvalidCookie("cookie must be a valid UUID".to_owned()));
    }

    Ok(cookie.to_owned())
}
