//! Grant codes: `"<service>:<name>"` with exactly one separator.

use mememo_common::{Error, Result};

pub const SEPARATOR: char = ':';

/// Build a grant code from its service and name.
pub fn join_grant(service: &str, name: &str) -> Result<String> {
    for (part, what) in [(service, "service"), (name, "name")] {
        if part.is_empty() {
            return Err(Error::validation(format!("grant {what} must not be empty")));
        }
        if part.contains(SEPARATOR) {
            return Err(Error::validation(format!(
                "grant {what} must not contain '{SEPARATOR}': {part}"
            )));
        }
    }
    Ok(format!("{service}{SEPARATOR}{name}"))
}

/// Split a grant code into `(service, name)`.
pub fn split_grant(code: &str) -> Result<(&str, &str)> {
    match code.split_once(SEPARATOR) {
        Some((service, name))
            if !service.is_empty() && !name.is_empty() && !name.contains(SEPARATOR) =>
        {
            Ok((service, name))
        },
        _ => Err(Error::validation(format!(
            "invalid grant code '{code}', expected <service>:<name>"
        ))),
    }
}

/// Normalize a user-supplied grant code, rejecting malformed ones.
pub fn parse_grant(code: &str) -> Result<String> {
    let (service, name) = split_grant(code.trim())?;
    join_grant(service, name)
}
