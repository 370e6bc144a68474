use std::sync::LazyLock;

use regex::{Captures, Regex};

static PLACEHOLDER: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}").ok());

/// Replace `${VAR}` and `${VAR:-default}` placeholders in raw config text.
///
/// Unset variables without a default are left as-is so the parse error (or
/// the literal value) points at the offending placeholder.
pub fn substitute_env(input: &str) -> String {
    substitute_env_with(input, |name| std::env::var(name).ok())
}

/// Same as [`substitute_env`] with an injectable lookup.
pub fn substitute_env_with(input: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let Some(re) = PLACEHOLDER.as_ref() else {
        return input.to_string();
    };
    re.replace_all(input, |caps: &Captures<'_>| {
        let name = &caps[1];
        match (lookup(name), caps.get(2)) {
            (Some(value), _) => value,
            (None, Some(default)) => default.as_str().to_string(),
            (None, None) => caps[0].to_string(),
        }
    })
    .into_owned()
}
