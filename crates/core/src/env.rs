//! `${ENV_VAR}` placeholder expansion for TOML configuration files.

use crate::error::CoreError;

/// Expand `${VAR_NAME}` placeholders from the environment.
///
/// Placeholders inside comments (after an unquoted `#` on a line) are left
/// untouched so example config lines keep working. An unset variable is an
/// error, not an empty string.
pub fn expand_env_vars(input: &str) -> Result<String, CoreError> {
    let mut out = String::with_capacity(input.len());

    for line in input.split_inclusive('\n') {
        let comment_start = find_unquoted_hash(line);
        let (code, comment) = match comment_start {
            Some(idx) => line.split_at(idx),
            None => (line, ""),
        };

        let mut rest = code;
        while let Some(start) = rest.find("${") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let Some(end) = after.find('}') else {
                return Err(CoreError::Other(format!(
                    "Unclosed environment variable placeholder: {}",
                    rest.trim()
                )));
            };
            let name = &after[..end];
            if name.is_empty() {
                return Err(CoreError::Other(
                    "Empty environment variable name in config".to_string(),
                ));
            }
            let value = std::env::var(name).map_err(|_| {
                CoreError::Other(format!("Environment variable '{name}' is not set"))
            })?;
            out.push_str(&value);
            rest = &after[end + 1..];
        }
        out.push_str(rest);
        out.push_str(comment);
    }

    Ok(out)
}

/// Index of the first `#` not inside a quoted string, if any.
fn find_unquoted_hash(line: &str) -> Option<usize> {
    let mut in_double = false;
    let mut in_single = false;
    for (idx, ch) in line.char_indices() {
        match ch {
            '"' if !in_single => in_double = !in_double,
            '\'' if !in_double => in_single = !in_single,
            '#' if !in_double && !in_single => return Some(idx),
            _ => {}
        }
    }
    None
}
