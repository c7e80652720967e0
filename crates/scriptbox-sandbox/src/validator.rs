//! Pre-compile source validator.
//!
//! The V8 context is the real security boundary. These checks reject the
//! obvious escape attempts before any engine resources are spent and give the
//! script author a pointed message instead of a confusing runtime failure.

use crate::compiler::{offset_to_location, CompileError};

/// Default maximum source size in bytes (256 KB).
pub const DEFAULT_MAX_SOURCE_SIZE: usize = 256 * 1024;

/// Patterns that are banned from guest source.
///
/// Patterns that begin with an identifier character only match at an
/// identifier boundary, so `myFunction(` and `retrieval(` are fine.
const BANNED_PATTERNS: &[&str] = &[
    "eval(",
    "Function(",
    "import(",
    "require(",
    "Deno.",
    "__proto__",
    "constructor.constructor",
    "constructor[",
    "globalThis[",
    "process.env",
    "process.exit",
    "process.argv",
    "process.binding",
    "process.kill",
];

/// Validate guest source before compilation.
pub fn validate_source(source: &str, max_size: usize) -> Result<(), CompileError> {
    if source.len() > max_size {
        return Err(CompileError::new(format!(
            "source exceeds maximum size of {max_size} bytes (got {})",
            source.len()
        )));
    }

    if source.trim().is_empty() {
        return Err(CompileError::new("source is empty"));
    }

    for pattern in BANNED_PATTERNS {
        if let Some(offset) = find_token(source, pattern) {
            return Err(CompileError {
                message: format!(
                    "banned pattern `{pattern}`: scripts have no module, process, or code-generation access"
                ),
                location: Some(offset_to_location(source, offset)),
            });
        }
    }

    Ok(())
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$'
}

/// Byte offset of the first occurrence of `pattern` that starts on an identifier boundary.
fn find_token(source: &str, pattern: &str) -> Option<usize> {
    let needs_boundary = pattern.chars().next().is_some_and(is_ident_char);
    source.match_indices(pattern).map(|(i, _)| i).find(|&i| {
        !needs_boundary
            || source[..i]
                .chars()
                .next_back()
                .map_or(true, |prev| !is_ident_char(prev))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(source: &str) -> Result<(), CompileError> {
        validate_source(source, DEFAULT_MAX_SOURCE_SIZE)
    }

    #[test]
    fn accepts_plain_handler() {
        let src = "export default async ({ params }) => ({ sum: params.a + params.b });";
        assert!(check(src).is_ok());
    }

    #[test]
    fn rejects_empty_source() {
        assert!(check("").is_err());
        assert!(check("  \n\t ").is_err());
    }

    #[test]
    fn rejects_oversized_source() {
        let src = "x".repeat(100);
        let err = validate_source(&src, 50).unwrap_err();
        assert!(err.message.contains("maximum size"), "{}", err.message);
        assert!(validate_source(&src, 200).is_ok());
    }

    #[test]
    fn rejects_eval_with_location() {
        let src = "export default () => {\n  return eval('1+1');\n};";
        let err = check(src).unwrap_err();
        assert!(err.message.contains("eval("));
        let loc = err.location.unwrap();
        assert_eq!((loc.line, loc.column), (2, 10));
    }

    #[test]
    fn rejects_dynamic_import_and_require() {
        assert!(check("export default async () => await import('fs');").is_err());
        assert!(check("const fs = require('fs'); export default () => 1;").is_err());
    }

    #[test]
    fn rejects_process_env() {
        assert!(check("export default () => process.env.HOME;").is_err());
    }

    #[test]
    fn identifier_boundary_avoids_false_positives() {
        assert!(check("const myFunction = (x) => x; export default () => myFunction(1);").is_ok());
        assert!(check("const retrieval = (x) => x; export default () => retrieval(2);").is_ok());
        assert!(check("export default ({ params }) => params.data.process.status;").is_ok());
    }

    #[test]
    fn constructor_chain_is_rejected() {
        assert!(check("export default () => ''.constructor.constructor('return 1')();").is_err());
        assert!(check("export default (x) => x.constructor.name;").is_ok());
    }
}
