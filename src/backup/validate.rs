//! Validation functions for configuration values.
//!
//! Used through `#[validate(custom(...))]` on the configuration structs and
//! directly for the command line arguments of the property mode.

use crate::backup::zfs::runner::RemoteAuth;
use validator::ValidationError;

use std::path::Path;

fn invalid(code: &'static str, message: String) -> ValidationError {
    ValidationError::new(code).with_message(message.into())
}

/// A plain dataset path such as `tank/data`.
pub fn validate_dataset_name<S: AsRef<str>>(name: S) -> Result<(), ValidationError> {
    let name = name.as_ref();
    if name.contains('*') {
        return Err(invalid(
            "InvalidDatasetName",
            format!("{name:?} must not contain '*'"),
        ));
    }
    validate_source_pattern(name)
}

/// A dataset path, where `*` is allowed to select by substring.
pub fn validate_source_pattern<S: AsRef<str>>(pattern: S) -> Result<(), ValidationError> {
    let pattern = pattern.as_ref();
    if pattern.trim().is_empty() {
        return Err(invalid("InvalidDatasetName", "dataset name is empty".into()));
    }
    if pattern.starts_with('/') || pattern.ends_with('/') || pattern.contains("//") {
        return Err(invalid(
            "InvalidDatasetName",
            format!("{pattern:?} is not a valid dataset path"),
        ));
    }
    if let Some(c) = pattern.chars().find(|c| matches!(c, '@' | '#' | '%' | '\0')) {
        return Err(invalid(
            "InvalidDatasetName",
            format!("{pattern:?} must not contain {c:?}"),
        ));
    }

    Ok(())
}

/// `host` or `host:port`.
pub fn validate_host<S: AsRef<str>>(host: S) -> Result<(), ValidationError> {
    let host = host.as_ref();
    if RemoteAuth::split_host(host).is_none() {
        return Err(invalid(
            "InvalidHost",
            format!("{host:?} is not a valid host, expected host or host:port"),
        ));
    }

    Ok(())
}

pub fn validate_file_exist<P: AsRef<Path>>(file: P) -> Result<(), ValidationError> {
    let file = file.as_ref();
    if file.exists() {
        if !file.is_file() {
            return Err(invalid("InvalidFile", format!("{file:?} is not a file")));
        }
    } else {
        return Err(invalid("InvalidFile", format!("{file:?} not found")));
    }

    Ok(())
}
