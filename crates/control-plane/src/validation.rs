use std::collections::HashMap;

use crate::config::LimitsConfig;
use crate::error::{ApiResult, AppError};

pub fn validate_required_str(field: &str, value: &str, max_len: usize) -> ApiResult<()> {
    validate_opt_str(field, Some(value), max_len)
}

pub fn validate_opt_str(field: &str, value: Option<&str>, max_len: usize) -> ApiResult<()> {
    if let Some(val) = value {
        if val.trim().is_empty() {
            return Err(AppError::bad_request(format!("{field} cannot be empty")));
        }
        if val.len() > max_len {
            return Err(AppError::bad_request(format!("{field} too long")));
        }
    }
    Ok(())
}

/// Trim an optional identifier, treating blank as absent.
pub fn normalize_opt_id(
    field: &str,
    value: Option<String>,
    max_len: usize,
) -> ApiResult<Option<String>> {
    let value = value
        .map(|val| val.trim().to_string())
        .filter(|val| !val.is_empty());
    validate_opt_str(field, value.as_deref(), max_len)?;
    if let Some(val) = value.as_deref()
        && val.chars().any(|c| c.is_whitespace() || c == '/')
    {
        return Err(AppError::bad_request(format!(
            "{field} cannot contain whitespace or '/'"
        )));
    }
    Ok(value)
}

pub fn normalize_metadata(
    metadata: Option<HashMap<String, String>>,
    limits: &LimitsConfig,
) -> ApiResult<HashMap<String, String>> {
    let Some(metadata) = metadata else {
        return Ok(HashMap::new());
    };

    let mut normalized = HashMap::with_capacity(metadata.len());
    for (key, value) in metadata {
        let key = key.trim();
        if key.is_empty() {
            return Err(AppError::bad_request("metadata key cannot be empty"));
        }
        if key.len() > limits.max_field_len {
            return Err(AppError::bad_request("metadata key too long"));
        }
        let value = value.trim();
        if value.len() > limits.max_field_len {
            return Err(AppError::bad_request("metadata value too long"));
        }
        if normalized
            .insert(key.to_string(), value.to_string())
            .is_some()
        {
            return Err(AppError::bad_request(format!(
                "duplicate metadata key {key}"
            )));
        }
    }
    Ok(normalized)
}

pub fn validate_job_type(job_type: &str, limits: &LimitsConfig) -> ApiResult<()> {
    validate_required_str("type", job_type, limits.max_field_len)?;
    if job_type.chars().any(char::is_whitespace) {
        return Err(AppError::bad_request("type cannot contain whitespace"));
    }
    Ok(())
}

pub fn validate_port_range(start: u16, end: u16) -> ApiResult<()> {
    if start == 0 {
        return Err(AppError::bad_request("start_port must be at least 1"));
    }
    if start > end {
        return Err(AppError::bad_request(format!(
            "start_port {start} is after end_port {end}"
        )));
    }
    Ok(())
}
