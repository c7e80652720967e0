//! Compiler stage: TypeScript or modern JavaScript in, plain ES module out.
//!
//! Uses the oxc toolchain (parse, semantic, transform, codegen). The transform
//! is pure: no filesystem, network, or engine access. Structural rules that
//! can be decided statically (no imports, a default export must exist) are
//! enforced here so bad scripts never reach a context.

use std::path::Path;

use oxc_allocator::Allocator;
use oxc_ast::ast::{ModuleExportName, Program, Statement};
use oxc_codegen::Codegen;
use oxc_parser::Parser;
use oxc_semantic::SemanticBuilder;
use oxc_span::SourceType;
use oxc_transformer::{TransformOptions, Transformer};
use thiserror::Error;

use crate::error::SourceLocation;

/// Source could not be turned into an executable module.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct CompileError {
    /// Human-readable description.
    pub message: String,
    /// Where in the submitted source, if known.
    pub location: Option<SourceLocation>,
}

impl CompileError {
    pub(crate) fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            location: None,
        }
    }

    fn at(source: &str, offset: u32, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            location: Some(offset_to_location(source, offset as usize)),
        }
    }
}

/// Executable module text produced by [`compile`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledModule {
    /// ES module source with type syntax removed.
    pub code: String,
}

/// Strip type syntax and check module structure.
pub fn compile(source: &str) -> Result<CompiledModule, CompileError> {
    let allocator = Allocator::default();
    let parsed = Parser::new(&allocator, source, SourceType::ts()).parse();

    if let Some(err) = parsed.errors.first() {
        let offset = err
            .labels
            .as_ref()
            .and_then(|labels| labels.first())
            .map(|label| label.offset());
        return Err(CompileError {
            message: format!("syntax error: {}", err.message),
            location: offset.map(|o| offset_to_location(source, o)),
        });
    }
    if parsed.panicked {
        return Err(CompileError::new("syntax error: parser gave up"));
    }

    let mut program = parsed.program;
    check_module_shape(source, &program)?;

    let scoping = SemanticBuilder::new()
        .build(&program)
        .semantic
        .into_scoping();
    let transformed = Transformer::new(
        &allocator,
        Path::new("guest.ts"),
        &TransformOptions::default(),
    )
    .build_with_scoping(scoping, &mut program);

    if let Some(err) = transformed.errors.first() {
        return Err(CompileError::new(format!("transform error: {}", err.message)));
    }

    let code = Codegen::new().build(&program).code;
    tracing::debug!(
        source_len = source.len(),
        output_len = code.len(),
        "compiled guest module"
    );
    Ok(CompiledModule { code })
}

/// Reject value imports and re-exports; require a default export.
fn check_module_shape(source: &str, program: &Program<'_>) -> Result<(), CompileError> {
    let mut has_default = false;

    for stmt in &program.body {
        match stmt {
            Statement::ImportDeclaration(decl) if !decl.import_kind.is_type() => {
                return Err(CompileError::at(
                    source,
                    decl.span.start,
                    format!(
                        "module imports are not available in the sandbox: '{}'",
                        decl.source.value
                    ),
                ));
            }
            Statement::ExportAllDeclaration(decl) if !decl.export_kind.is_type() => {
                return Err(CompileError::at(
                    source,
                    decl.span.start,
                    format!(
                        "module imports are not available in the sandbox: '{}'",
                        decl.source.value
                    ),
                ));
            }
            Statement::ExportNamedDeclaration(decl) => {
                if let Some(from) = &decl.source {
                    if !decl.export_kind.is_type() {
                        return Err(CompileError::at(
                            source,
                            decl.span.start,
                            format!(
                                "module imports are not available in the sandbox: '{}'",
                                from.value
                            ),
                        ));
                    }
                }
                has_default |= decl.specifiers.iter().any(|s| is_default(&s.exported));
            }
            Statement::ExportDefaultDeclaration(_) => has_default = true,
            _ => {}
        }
    }

    if has_default {
        Ok(())
    } else {
        Err(CompileError::new(
            "script must `export default` a handler function",
        ))
    }
}

fn is_default(name: &ModuleExportName<'_>) -> bool {
    name.name().as_str() == "default"
}

/// Convert a byte offset into a 1-based line/column (columns count characters).
pub(crate) fn offset_to_location(source: &str, offset: usize) -> SourceLocation {
    let mut end = offset.min(source.len());
    while !source.is_char_boundary(end) {
        end -= 1;
    }
    let before = &source[..end];
    let line = before.matches('\n').count() + 1;
    let line_start = before.rfind('\n').map_or(0, |i| i + 1);
    let column = before[line_start..].chars().count() + 1;
    SourceLocation {
        line: u32::try_from(line).unwrap_or(u32::MAX),
        column: u32::try_from(column).unwrap_or(u32::MAX),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_type_annotations() {
        let src = r#"
            interface Params { a: number; b: number }
            export default async ({ params }: { params: Params }): Promise<number> => {
                const total: number = params.a + params.b;
                return total as number;
            };
        "#;
        let out = compile(src).unwrap();
        assert!(!out.code.contains("interface"), "{}", out.code);
        assert!(!out.code.contains(": number"), "{}", out.code);
        assert!(out.code.contains("export default"), "{}", out.code);
    }

    #[test]
    fn plain_javascript_passes_through() {
        let out = compile("export default function handler() { return [1, 2, 3]; }").unwrap();
        assert!(out.code.contains("function handler"));
    }

    #[test]
    fn syntax_error_has_location() {
        let src = "export default () => {\n  return 1 +;\n};";
        let err = compile(src).unwrap_err();
        assert!(err.message.starts_with("syntax error"), "{}", err.message);
        let loc = err.location.expect("parser errors carry a label");
        assert_eq!(loc.line, 2);
    }

    #[test]
    fn rejects_static_import() {
        let err = compile("import fs from 'node:fs';\nexport default () => fs;").unwrap_err();
        assert!(err.message.contains("'node:fs'"), "{}", err.message);
        assert_eq!(err.location.unwrap().line, 1);
    }

    #[test]
    fn rejects_reexport() {
        let err = compile("export * from './other';\nexport default () => 1;").unwrap_err();
        assert!(err.message.contains("./other"));
    }

    #[test]
    fn type_only_import_is_erased() {
        let out = compile("import type { Foo } from './types';\nexport default (x: Foo) => x;")
            .unwrap();
        assert!(!out.code.contains("import"), "{}", out.code);
    }

    #[test]
    fn requires_default_export() {
        let err = compile("export const handler = () => 1;").unwrap_err();
        assert!(err.message.contains("export default"));
    }

    #[test]
    fn default_export_by_specifier() {
        assert!(compile("const run = () => 1;\nexport { run as default };").is_ok());
    }

    #[test]
    fn offset_to_location_counts_characters() {
        let src = "ab\nçd\nxyz";
        assert_eq!(
            offset_to_location(src, 0),
            SourceLocation { line: 1, column: 1 }
        );
        // 'd' sits after a two-byte character on line 2
        let d = src.find('d').unwrap();
        assert_eq!(
            offset_to_location(src, d),
            SourceLocation { line: 2, column: 2 }
        );
        assert_eq!(offset_to_location(src, 999).line, 3);
    }
}
