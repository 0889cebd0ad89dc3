//! Editing assistance: completions, hover and signature help.
//!
//! Works line by line on the directive-masked buffer, so a half-typed cell
//! with errors elsewhere still gets answers.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::ast::Builtin;
use super::directives;
use super::lexer::{self, Token, TokenKind};
use super::module::Constant;
use super::types::{DependencyReference, SourceSpan, SymbolDescriptor, SymbolKind};

const KEYWORDS: [&str; 7] = ["var", "if", "else", "while", "true", "false", "nil"];

/// Cursor position, 1-indexed. The cursor sits before character `column`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub line: u32,
    pub column: u32,
}

impl Position {
    pub fn new(line: u32, column: u32) -> Self {
        Self { line, column }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionKind {
    Variable,
    Package,
    Member,
    Builtin,
    Keyword,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionItem {
    pub label: String,
    pub kind: CompletionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hover {
    pub contents: String,
    pub span: SourceSpan,
}

/// The builtin call surrounding the cursor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureHelp {
    pub label: String,
    pub documentation: String,
    pub parameters: Vec<String>,
    pub active_parameter: usize,
}

/// A resolved package as editing assistance sees it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackageSummary {
    /// `name@version`.
    pub display: String,
    pub exports: BTreeMap<String, Constant>,
}

/// What a cell can see: the declared state of earlier cells, and every
/// resolved package by alias.
#[derive(Debug, Clone, Copy)]
pub struct AssistScope<'a> {
    pub symbols: &'a [SymbolDescriptor],
    pub packages: &'a BTreeMap<String, PackageSummary>,
}

struct View {
    /// Masked lines; directive lines are empty.
    lines: Vec<String>,
    directive_lines: Vec<bool>,
    references: Vec<DependencyReference>,
    /// `var` declarations anywhere in the buffer.
    variables: Vec<String>,
}

impl View {
    fn new(buffer: &str) -> Self {
        let extracted = directives::extract(buffer);
        let lines: Vec<String> = extracted.masked.split('\n').map(str::to_string).collect();
        let variables = lines
            .iter()
            .flat_map(|line| {
                line_tokens(line)
                    .windows(2)
                    .filter_map(|pair| match (&pair[0].kind, &pair[1].kind) {
                        (TokenKind::Var, TokenKind::Ident(name)) => Some(name.clone()),
                        _ => None,
                    })
                    .collect::<Vec<_>>()
            })
            .collect();

        Self {
            directive_lines: buffer
                .split('\n')
                .map(|line| line.trim_start().starts_with('#'))
                .collect(),
            lines,
            references: extracted.references,
            variables,
        }
    }

    fn line(&self, line: u32) -> Option<&str> {
        let index = line.checked_sub(1)? as usize;
        if *self.directive_lines.get(index)? {
            return None;
        }
        self.lines.get(index).map(String::as_str)
    }

    /// Text of the cursor's line before the cursor.
    fn before(&self, position: Position) -> Option<&str> {
        let line = self.line(position.line)?;
        let chars = position.column.checked_sub(1)? as usize;
        let end = match line.char_indices().nth(chars) {
            Some((end, _)) => end,
            None if line.chars().count() == chars => line.len(),
            None => return None,
        };
        Some(&line[..end])
    }

    fn symbol_kind(&self, name: &str, scope: &AssistScope<'_>) -> Option<SymbolKind> {
        if self.references.iter().any(|r| r.alias == name) {
            return Some(SymbolKind::Package);
        }
        if self.variables.iter().any(|v| v == name) {
            return Some(SymbolKind::Variable);
        }
        scope
            .symbols
            .iter()
            .rev()
            .find(|symbol| symbol.name == name)
            .map(|symbol| symbol.kind)
    }
}

/// Candidates for the identifier being typed at `position`.
pub fn completions(
    buffer: &str,
    position: Position,
    scope: &AssistScope<'_>,
) -> Vec<CompletionItem> {
    let view = View::new(buffer);
    let Some(before) = view.before(position) else {
        return Vec::new();
    };
    if !in_code(before) {
        return Vec::new();
    }
    let (context, partial) = split_partial(before);
    if partial.starts_with(|c: char| c.is_ascii_digit()) {
        return Vec::new();
    }

    let mut items: BTreeMap<String, CompletionItem> = BTreeMap::new();
    let mut add = |label: &str, kind: CompletionKind, detail: Option<String>| {
        if label.starts_with(partial) {
            items.entry(label.to_string()).or_insert(CompletionItem {
                label: label.to_string(),
                kind,
                detail,
            });
        }
    };

    match line_tokens(context).as_slice() {
        [
            ..,
            Token {
                kind: TokenKind::Ident(target),
                ..
            },
            Token {
                kind: TokenKind::Dot,
                ..
            },
        ] => {
            if view.symbol_kind(target, scope) == Some(SymbolKind::Package)
                && let Some(package) = scope.packages.get(target)
            {
                for (member, value) in &package.exports {
                    add(member, CompletionKind::Member, Some(describe_constant(value)));
                }
            }
        }
        // Naming a new variable, or a member of something that is not a package.
        [
            ..,
            Token {
                kind: TokenKind::Var | TokenKind::Dot,
                ..
            },
        ] => {}
        _ => {
            for name in &view.variables {
                add(name, CompletionKind::Variable, None);
            }
            for reference in &view.references {
                add(
                    &reference.alias,
                    CompletionKind::Package,
                    Some(package_detail(&reference.alias, scope)),
                );
            }
            for symbol in scope.symbols.iter().rev() {
                match symbol.kind {
                    SymbolKind::Variable => add(&symbol.name, CompletionKind::Variable, None),
                    SymbolKind::Package => add(
                        &symbol.name,
                        CompletionKind::Package,
                        Some(package_detail(&symbol.name, scope)),
                    ),
                }
            }
            for builtin in Builtin::ALL {
                add(builtin.name(), CompletionKind::Builtin, Some(builtin.signature()));
            }
            for keyword in KEYWORDS {
                add(keyword, CompletionKind::Keyword, None);
            }
        }
    }

    items.into_values().collect()
}

/// Description of the symbol under `position`.
pub fn hover(buffer: &str, position: Position, scope: &AssistScope<'_>) -> Option<Hover> {
    let view = View::new(buffer);
    let index = position.line.checked_sub(1)? as usize;

    if *view.directive_lines.get(index)? {
        let reference = view
            .references
            .iter()
            .find(|reference| reference.span.start_line == position.line)?;
        let contents = match scope.packages.get(&reference.alias) {
            Some(package) => format!("(package) {} as `{}`", package.display, reference.alias),
            None => format!("(package) {} (not resolved yet)", reference),
        };
        return Some(Hover {
            contents,
            span: reference.span,
        });
    }

    let tokens = line_tokens(view.line(position.line)?);
    let at = tokens.iter().position(|token| {
        token.span.start_col <= position.column && position.column <= token.span.end_col
    })?;
    let TokenKind::Ident(name) = &tokens[at].kind else {
        return None;
    };
    let span = on_line(tokens[at].span, position.line);

    if at >= 2
        && tokens[at - 1].kind == TokenKind::Dot
        && let TokenKind::Ident(target) = &tokens[at - 2].kind
    {
        let value = scope.packages.get(target)?.exports.get(name)?;
        return Some(Hover {
            contents: format!("(constant) {}.{}: {}", target, name, describe_constant(value)),
            span: on_line(tokens[at - 2].span, position.line).to(span),
        });
    }

    let called = tokens
        .get(at + 1)
        .is_some_and(|token| token.kind == TokenKind::LParen);
    let contents = match (called, view.symbol_kind(name, scope)) {
        (false, Some(SymbolKind::Variable)) => format!("(variable) {}", name),
        (false, Some(SymbolKind::Package)) => format!("(package) {}", package_detail(name, scope)),
        _ => {
            let builtin = Builtin::lookup(name)?;
            format!("{}\n{}", builtin.signature(), builtin.summary())
        }
    };
    Some(Hover { contents, span })
}

/// Signature of the innermost builtin call the cursor is inside.
pub fn signature_help(buffer: &str, position: Position) -> Option<SignatureHelp> {
    let view = View::new(buffer);
    let before = view.before(position)?;
    if !in_code(before) {
        return None;
    }

    // Calls may span lines: walk back from the cursor through earlier lines.
    let earlier = (1..position.line)
        .rev()
        .map(|line| view.line(line).map(line_tokens).unwrap_or_default());
    let mut tokens = std::iter::once(line_tokens(before))
        .chain(earlier)
        .flat_map(|tokens| tokens.into_iter().rev());

    let mut depth = 0usize;
    let mut commas = 0usize;
    while let Some(token) = tokens.next() {
        match token.kind {
            TokenKind::RParen => depth += 1,
            TokenKind::LParen if depth > 0 => depth -= 1,
            TokenKind::LParen => {
                let Some(Token {
                    kind: TokenKind::Ident(name),
                    ..
                }) = tokens.next()
                else {
                    return None;
                };
                let builtin = Builtin::lookup(&name)?;
                let parameters = builtin.parameters();
                return Some(SignatureHelp {
                    label: builtin.signature(),
                    documentation: builtin.summary().to_string(),
                    parameters: parameters.iter().map(|p| p.to_string()).collect(),
                    active_parameter: commas.min(parameters.len().saturating_sub(1)),
                });
            }
            TokenKind::Comma if depth == 0 => commas += 1,
            TokenKind::LBrace | TokenKind::RBrace | TokenKind::Semicolon if depth == 0 => {
                return None;
            }
            _ => {}
        }
    }
    None
}

/// Tokens of one line; empty when the line does not lex.
fn line_tokens(line: &str) -> Vec<Token> {
    lexer::tokenize(line)
        .map(|tokens| {
            tokens
                .into_iter()
                .filter(|token| !matches!(token.kind, TokenKind::Newline | TokenKind::Eof))
                .collect()
        })
        .unwrap_or_default()
}

/// Whether the end of `line` is code rather than a string or comment.
fn in_code(line: &str) -> bool {
    let mut in_string = false;
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' if in_string => {
                chars.next();
            }
            '"' => in_string = !in_string,
            '/' if !in_string && chars.peek() == Some(&'/') => return false,
            _ => {}
        }
    }
    !in_string
}

/// Split off the identifier characters ending `text`.
fn split_partial(text: &str) -> (&str, &str) {
    let start = text
        .char_indices()
        .rev()
        .take_while(|(_, c)| c.is_ascii_alphanumeric() || *c == '_')
        .last()
        .map_or(text.len(), |(i, _)| i);
    text.split_at(start)
}

fn on_line(span: SourceSpan, line: u32) -> SourceSpan {
    SourceSpan::new(line, span.start_col, line, span.end_col)
}

fn package_detail(alias: &str, scope: &AssistScope<'_>) -> String {
    scope
        .packages
        .get(alias)
        .map_or_else(|| alias.to_string(), |package| package.display.clone())
}

fn describe_constant(value: &Constant) -> String {
    match value {
        Constant::Int(n) => format!("int = {}", n),
        Constant::Str(s) => format!("string = {:?}", s),
        Constant::Bool(b) => format!("bool = {}", b),
        Constant::Nil => "nil".to_string(),
    }
}
