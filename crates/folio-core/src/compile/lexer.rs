//! Tokenizer for folio script.

use super::types::{Diagnostic, SourceSpan};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenKind {
    Int(i64),
    Str(String),
    Ident(String),

    Var,
    If,
    Else,
    While,
    True,
    False,
    Nil,

    LParen,
    RParen,
    LBrace,
    RBrace,
    Comma,
    Semicolon,
    Dot,

    Assign,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Bang,
    AndAnd,
    OrOr,

    Newline,
    Eof,
}

impl TokenKind {
    pub fn describe(&self) -> String {
        match self {
            TokenKind::Int(n) => format!("integer `{}`", n),
            TokenKind::Str(_) => "string literal".to_string(),
            TokenKind::Ident(name) => format!("`{}`", name),
            TokenKind::Newline => "end of line".to_string(),
            TokenKind::Eof => "end of input".to_string(),
            other => format!("`{}`", other.symbol()),
        }
    }

    fn symbol(&self) -> &'static str {
        match self {
            TokenKind::Var => "var",
            TokenKind::If => "if",
            TokenKind::Else => "else",
            TokenKind::While => "while",
            TokenKind::True => "true",
            TokenKind::False => "false",
            TokenKind::Nil => "nil",
            TokenKind::LParen => "(",
            TokenKind::RParen => ")",
            TokenKind::LBrace => "{",
            TokenKind::RBrace => "}",
            TokenKind::Comma => ",",
            TokenKind::Semicolon => ";",
            TokenKind::Dot => ".",
            TokenKind::Assign => "=",
            TokenKind::Eq => "==",
            TokenKind::NotEq => "!=",
            TokenKind::Lt => "<",
            TokenKind::LtEq => "<=",
            TokenKind::Gt => ">",
            TokenKind::GtEq => ">=",
            TokenKind::Plus => "+",
            TokenKind::Minus => "-",
            TokenKind::Star => "*",
            TokenKind::Slash => "/",
            TokenKind::Percent => "%",
            TokenKind::Bang => "!",
            TokenKind::AndAnd => "&&",
            TokenKind::OrOr => "||",
            _ => "?",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub span: SourceSpan,
}

/// Tokenize a buffer. Stops at the first lexical error.
pub fn tokenize(source: &str) -> Result<Vec<Token>, Diagnostic> {
    Lexer::new(source).run()
}

struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
    line: u32,
    col: u32,
    tokens: Vec<Token>,
}

impl<'a> Lexer<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            chars: source.chars().peekable(),
            line: 1,
            col: 1,
            tokens: Vec::new(),
        }
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.chars.next()?;
        if c == '\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(c)
    }

    fn eat(&mut self, expected: char) -> bool {
        if self.chars.peek() == Some(&expected) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn push(&mut self, kind: TokenKind, line: u32, col: u32) {
        let end_col = self.col.saturating_sub(1).max(col);
        self.tokens.push(Token {
            kind,
            span: SourceSpan::new(line, col, line, end_col),
        });
    }

    fn run(mut self) -> Result<Vec<Token>, Diagnostic> {
        while let Some(&c) = self.chars.peek() {
            let (line, col) = (self.line, self.col);
            match c {
                '\n' => {
                    self.bump();
                    self.tokens.push(Token {
                        kind: TokenKind::Newline,
                        span: SourceSpan::point(line, col),
                    });
                }
                c if c.is_whitespace() => {
                    self.bump();
                }
                '/' => {
                    self.bump();
                    if self.eat('/') {
                        while let Some(&c) = self.chars.peek()
                            && c != '\n'
                        {
                            self.bump();
                        }
                    } else {
                        self.push(TokenKind::Slash, line, col);
                    }
                }
                '"' => self.string(line, col)?,
                '0'..='9' => self.number(line, col)?,
                c if c.is_ascii_alphabetic() || c == '_' => self.ident(line, col),
                _ => {
                    self.bump();
                    let kind = match c {
                        '(' => TokenKind::LParen,
                        ')' => TokenKind::RParen,
                        '{' => TokenKind::LBrace,
                        '}' => TokenKind::RBrace,
                        ',' => TokenKind::Comma,
                        ';' => TokenKind::Semicolon,
                        '.' => TokenKind::Dot,
                        '+' => TokenKind::Plus,
                        '-' => TokenKind::Minus,
                        '*' => TokenKind::Star,
                        '%' => TokenKind::Percent,
                        '=' if self.eat('=') => TokenKind::Eq,
                        '=' => TokenKind::Assign,
                        '!' if self.eat('=') => TokenKind::NotEq,
                        '!' => TokenKind::Bang,
                        '<' if self.eat('=') => TokenKind::LtEq,
                        '<' => TokenKind::Lt,
                        '>' if self.eat('=') => TokenKind::GtEq,
                        '>' => TokenKind::Gt,
                        '&' if self.eat('&') => TokenKind::AndAnd,
                        '|' if self.eat('|') => TokenKind::OrOr,
                        '#' => {
                            return Err(Diagnostic::error(
                                "directives must start their own line",
                                Some(SourceSpan::point(line, col)),
                            ));
                        }
                        other => {
                            return Err(Diagnostic::error(
                                format!("unexpected character `{}`", other),
                                Some(SourceSpan::point(line, col)),
                            ));
                        }
                    };
                    self.push(kind, line, col);
                }
            }
        }

        self.tokens.push(Token {
            kind: TokenKind::Eof,
            span: SourceSpan::point(self.line, self.col),
        });
        Ok(self.tokens)
    }

    fn string(&mut self, line: u32, col: u32) -> Result<(), Diagnostic> {
        self.bump();
        let mut text = String::new();
        loop {
            match self.chars.peek().copied() {
                None | Some('\n') => {
                    return Err(Diagnostic::error(
                        "unterminated string literal",
                        Some(SourceSpan::new(line, col, self.line, self.col)),
                    ));
                }
                Some('"') => {
                    self.bump();
                    break;
                }
                Some('\\') => {
                    self.bump();
                    let escaped = match self.bump() {
                        Some('n') => '\n',
                        Some('t') => '\t',
                        Some('"') => '"',
                        Some('\\') => '\\',
                        Some(other) => {
                            return Err(Diagnostic::error(
                                format!("unknown escape `\\{}`", other),
                                Some(SourceSpan::point(self.line, self.col.saturating_sub(1))),
                            ));
                        }
                        None => continue,
                    };
                    text.push(escaped);
                }
                Some(c) => {
                    self.bump();
                    text.push(c);
                }
            }
        }
        self.push(TokenKind::Str(text), line, col);
        Ok(())
    }

    fn number(&mut self, line: u32, col: u32) -> Result<(), Diagnostic> {
        let mut digits = String::new();
        while let Some(&c) = self.chars.peek()
            && (c.is_ascii_digit() || c == '_')
        {
            self.bump();
            if c != '_' {
                digits.push(c);
            }
        }
        let value = digits.parse::<i64>().map_err(|_| {
            Diagnostic::error(
                format!("integer literal `{}` is out of range", digits),
                Some(SourceSpan::new(line, col, self.line, self.col.saturating_sub(1))),
            )
        })?;
        self.push(TokenKind::Int(value), line, col);
        Ok(())
    }

    fn ident(&mut self, line: u32, col: u32) {
        let mut name = String::new();
        while let Some(&c) = self.chars.peek()
            && (c.is_ascii_alphanumeric() || c == '_')
        {
            self.bump();
            name.push(c);
        }
        let kind = match name.as_str() {
            "var" => TokenKind::Var,
            "if" => TokenKind::If,
            "else" => TokenKind::Else,
            "while" => TokenKind::While,
            "true" => TokenKind::True,
            "false" => TokenKind::False,
            "nil" => TokenKind::Nil,
            _ => TokenKind::Ident(name),
        };
        self.push(kind, line, col);
    }
}

/// Whether a buffer looks finished enough to submit.
///
/// False while brackets or braces are open, or when the last line ends
/// inside a string literal.
pub fn is_complete(source: &str) -> bool {
    let mut depth: i64 = 0;
    let mut in_string = false;
    let mut chars = source.chars().peekable();

    while let Some(c) = chars.next() {
        if in_string {
            match c {
                '\\' => {
                    chars.next();
                }
                '"' => in_string = false,
                // A string cannot span lines; the lexer reports it.
                '\n' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '/' if chars.peek() == Some(&'/') => {
                while let Some(&c) = chars.peek()
                    && c != '\n'
                {
                    chars.next();
                }
            }
            '(' | '{' => depth += 1,
            ')' | '}' => depth -= 1,
            _ => {}
        }
    }

    !in_string && depth <= 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        tokenize(source).unwrap().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_simple_statement() {
        assert_eq!(
            kinds("var x = 1 + 2"),
            vec![
                TokenKind::Var,
                TokenKind::Ident("x".into()),
                TokenKind::Assign,
                TokenKind::Int(1),
                TokenKind::Plus,
                TokenKind::Int(2),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_operators_and_comments() {
        assert_eq!(
            kinds("a <= b // trailing\n!c && d != e"),
            vec![
                TokenKind::Ident("a".into()),
                TokenKind::LtEq,
                TokenKind::Ident("b".into()),
                TokenKind::Newline,
                TokenKind::Bang,
                TokenKind::Ident("c".into()),
                TokenKind::AndAnd,
                TokenKind::Ident("d".into()),
                TokenKind::NotEq,
                TokenKind::Ident("e".into()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_string_escapes() {
        assert_eq!(
            kinds(r#""a\n\"b\"""#),
            vec![TokenKind::Str("a\n\"b\"".into()), TokenKind::Eof]
        );
    }

    #[test]
    fn test_spans_are_one_indexed() {
        let tokens = tokenize("x\n  foo").unwrap();
        assert_eq!(tokens[2].span, SourceSpan::new(2, 3, 2, 5));
    }

    #[test]
    fn test_lexical_errors() {
        let err = tokenize("var s = \"open").unwrap_err();
        assert!(err.message.contains("unterminated"));

        let err = tokenize("1 @ 2").unwrap_err();
        assert_eq!(err.span, Some(SourceSpan::point(1, 3)));

        let err = tokenize("99999999999999999999").unwrap_err();
        assert!(err.message.contains("out of range"));
    }

    #[test]
    fn test_is_complete() {
        assert!(is_complete("var x = 1"));
        assert!(is_complete(""));
        assert!(!is_complete("if x {"));
        assert!(!is_complete("print(1,"));
        assert!(!is_complete("var s = \"abc"));
        assert!(is_complete("var s = \"{\" // {"));
        assert!(is_complete("while x {\n  x = x - 1\n}"));
    }
}
