//! Limits applied to property paths before they are parsed or walked.

use crate::PathError;

/// Maximum allowed path string length.
pub const MAX_PATH_CHARS: usize = 1024;

/// Maximum allowed number of steps in a path.
pub const MAX_PATH_DEPTH: usize = 256;

/// Validate a raw path string before parsing.
///
/// # Errors
///
/// Returns [`PathError::Malformed`] for an empty string and
/// [`PathError::TooLong`] when the input exceeds [`MAX_PATH_CHARS`].
///
/// # Example
///
/// ```
/// use sdui_path::validate_path_str;
///
/// validate_path_str("props.title").unwrap();
/// validate_path_str("").unwrap_err();
/// validate_path_str(&"a".repeat(2000)).unwrap_err();
/// ```
pub fn validate_path_str(input: &str) -> Result<(), PathError> {
    if input.is_empty() {
        return Err(PathError::malformed(input, "empty path"));
    }
    let len = input.chars().count();
    if len > MAX_PATH_CHARS {
        return Err(PathError::TooLong {
            len,
            max: MAX_PATH_CHARS,
        });
    }
    Ok(())
}

/// Validate the step count of a parsed path.
pub fn validate_depth(depth: usize) -> Result<(), PathError> {
    if depth > MAX_PATH_DEPTH {
        return Err(PathError::TooDeep {
            depth,
            max: MAX_PATH_DEPTH,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_empty() {
        assert!(matches!(
            validate_path_str(""),
            Err(PathError::Malformed { .. })
        ));
    }

    #[test]
    fn test_validate_long() {
        let long = "a".repeat(MAX_PATH_CHARS + 1);
        assert!(matches!(
            validate_path_str(&long),
            Err(PathError::TooLong { .. })
        ));
        assert!(validate_path_str(&"a".repeat(MAX_PATH_CHARS)).is_ok());
    }

    #[test]
    fn test_validate_counts_chars_not_bytes() {
        // Two bytes per char in UTF-8.
        let wide = "é".repeat(MAX_PATH_CHARS);
        assert!(wide.len() > MAX_PATH_CHARS);
        assert!(validate_path_str(&wide).is_ok());
        assert!(matches!(
            validate_path_str(&format!("{wide}é")),
            Err(PathError::TooLong { len, .. }) if len == MAX_PATH_CHARS + 1
        ));
    }

    #[test]
    fn test_validate_depth() {
        assert!(validate_depth(MAX_PATH_DEPTH).is_ok());
        assert!(validate_depth(MAX_PATH_DEPTH + 1).is_err());
    }
}
