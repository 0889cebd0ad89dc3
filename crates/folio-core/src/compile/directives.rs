//! `#r` directive extraction.
//!
//! Directives occupy their own line:
//!
//! ```text
//! #r "mathx"
//! #r "mathx@^1.2"
//! #r "./vendor/geo"
//! ```
//!
//! Directive lines are blanked out of the buffer before lexing so that line
//! numbers of the remaining statements are preserved.

use super::types::{DependencyReference, Diagnostic, SourceSpan};
use crate::resolve::VersionReq;

/// Result of scanning a buffer for directives.
#[derive(Debug)]
pub struct Directives {
    /// The buffer with every directive line emptied.
    pub masked: String,
    pub references: Vec<DependencyReference>,
    pub diagnostics: Vec<Diagnostic>,
}

pub fn extract(source: &str) -> Directives {
    let mut masked = String::with_capacity(source.len());
    let mut references = Vec::new();
    let mut diagnostics = Vec::new();

    for (index, line) in source.split('\n').enumerate() {
        if index > 0 {
            masked.push('\n');
        }

        let trimmed = line.trim_start();
        if !trimmed.starts_with('#') {
            masked.push_str(line);
            continue;
        }

        let line_no = index as u32 + 1;
        let col = (line.len() - trimmed.len()) as u32 + 1;
        let end_col = col + trimmed.trim_end().chars().count().saturating_sub(1) as u32;
        let span = SourceSpan::new(line_no, col, line_no, end_col);

        match parse_directive(trimmed, span) {
            Ok(reference) => references.push(reference),
            Err(message) => diagnostics.push(Diagnostic::error(message, Some(span))),
        }
    }

    Directives {
        masked,
        references,
        diagnostics,
    }
}

/// The well-formed `#r` references of a buffer, in order.
pub fn dependency_references(source: &str) -> Vec<DependencyReference> {
    extract(source).references
}

fn parse_directive(text: &str, span: SourceSpan) -> Result<DependencyReference, String> {
    let Some(rest) = text.strip_prefix("#r") else {
        return Err(format!("unknown directive `{}`", text.trim_end()));
    };
    let rest = rest.trim_start();
    let Some(rest) = rest.strip_prefix('"') else {
        return Err("`#r` expects a quoted reference, e.g. #r \"name@1.0\"".to_string());
    };
    let Some(close) = rest.find('"') else {
        return Err("unterminated reference in `#r` directive".to_string());
    };
    let (target, tail) = (rest[..close].trim(), rest[close + 1..].trim());
    if !tail.is_empty() && !tail.starts_with("//") {
        return Err(format!("unexpected `{}` after `#r` reference", tail));
    }
    parse_reference(target, span)
}

/// Parse the quoted part of a `#r` directive.
pub fn parse_reference(target: &str, span: SourceSpan) -> Result<DependencyReference, String> {
    if target.is_empty() {
        return Err("empty `#r` reference".to_string());
    }

    if is_path(target) {
        // `./pkgs/geo/1.0.0` binds `geo`: skip components that cannot be names.
        let alias = target
            .rsplit(['/', '\\'])
            .filter(|component| !matches!(*component, "" | "." | ".."))
            .map(|component| {
                component
                    .chars()
                    .map(|c| if c == '-' || c == '.' { '_' } else { c })
                    .collect::<String>()
            })
            .find(|candidate| is_identifier(candidate))
            .ok_or_else(|| format!("cannot derive a package name from path `{}`", target))?;
        return Ok(DependencyReference {
            name: alias.clone(),
            constraint: None,
            path: Some(target.to_string()),
            alias,
            span,
        });
    }

    let (name, constraint) = match target.split_once('@') {
        Some((name, constraint)) => (name.trim(), Some(constraint.trim())),
        None => (target, None),
    };
    if !is_identifier(name) {
        return Err(format!("`{}` is not a valid package name", name));
    }
    if let Some(constraint) = constraint {
        VersionReq::parse(constraint)
            .map_err(|e| format!("invalid version constraint `{}`: {}", constraint, e))?;
    }

    Ok(DependencyReference {
        name: name.to_string(),
        constraint: constraint.map(String::from),
        path: None,
        alias: name.to_string(),
        span,
    })
}

fn is_path(target: &str) -> bool {
    target.starts_with('.') || target.contains('/') || target.contains('\\')
}

pub(crate) fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_masks_directive_lines() {
        let source = "#r \"mathx\"\nvar x = 1\n  #r \"geo@^1.2\" // shapes\nx";
        let directives = extract(source);

        assert_eq!(directives.masked, "\nvar x = 1\n\nx");
        assert!(directives.diagnostics.is_empty());
        assert_eq!(directives.references.len(), 2);

        let geo = &directives.references[1];
        assert_eq!(geo.name, "geo");
        assert_eq!(geo.constraint.as_deref(), Some("^1.2"));
        assert_eq!(geo.span.start_line, 3);
        assert_eq!(geo.span.start_col, 3);
    }

    #[test]
    fn test_versioned_path_binds_package_name() {
        let reference = parse_reference("../pkgs/geo/1.0.0", SourceSpan::point(1, 1)).unwrap();
        assert_eq!(reference.alias, "geo");
        assert!(parse_reference("./1.0/", SourceSpan::point(1, 1)).is_err());
    }

    #[test]
    fn test_path_reference() {
        let directives = extract("#r \"./vendor/geo-utils/\"");
        let reference = &directives.references[0];
        assert_eq!(reference.alias, "geo_utils");
        assert_eq!(reference.path.as_deref(), Some("./vendor/geo-utils/"));
        assert!(reference.constraint.is_none());
    }

    #[test]
    fn test_malformed_directives() {
        for source in [
            "#r mathx",
            "#r \"mathx",
            "#r \"\"",
            "#r \"math-x\"",
            "#r \"mathx@not a version\"",
            "#load \"x\"",
            "#r \"mathx\" extra",
        ] {
            let directives = extract(source);
            assert_eq!(directives.diagnostics.len(), 1, "{}", source);
            assert!(directives.diagnostics[0].is_blocking());
            assert!(directives.references.is_empty());
        }
    }
}
