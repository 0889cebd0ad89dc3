//! Recursive-descent parser for folio script.

use super::ast::{BinaryOp, Expr, ExprKind, Stmt, UnaryOp};
use super::lexer::{Token, TokenKind};
use super::types::{Diagnostic, SourceSpan};

type ParseResult<T> = Result<T, Diagnostic>;

/// Deepest syntax nesting accepted, counting brackets, unary operators,
/// blocks and operator chains.
pub const MAX_NESTING_DEPTH: usize = 64;

/// Parse a token stream into top-level statements.
pub fn parse(tokens: Vec<Token>) -> ParseResult<Vec<Stmt>> {
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };
    parser.program()
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> &TokenKind {
        &self.current().kind
    }

    fn current(&self) -> &Token {
        // The stream always ends with Eof, and `advance` never moves past it.
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn advance(&mut self) -> Token {
        let token = self.current().clone();
        if token.kind != TokenKind::Eof {
            self.pos += 1;
        }
        token
    }

    fn check(&self, kind: &TokenKind) -> bool {
        self.peek() == kind
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: &TokenKind, context: &str) -> ParseResult<Token> {
        if self.check(kind) {
            Ok(self.advance())
        } else {
            Err(self.unexpected(context))
        }
    }

    fn unexpected(&self, context: &str) -> Diagnostic {
        let token = self.current();
        Diagnostic::error(
            format!("expected {}, found {}", context, token.kind.describe()),
            Some(token.span),
        )
    }

    /// Enter one nesting level. The caller restores `depth` on success; a
    /// failed parse is abandoned, so error paths need not unwind it.
    fn descend(&mut self) -> ParseResult<()> {
        self.depth += 1;
        if self.depth > MAX_NESTING_DEPTH {
            return Err(Diagnostic::error(
                format!(
                    "nesting exceeds the maximum depth of {}",
                    MAX_NESTING_DEPTH
                ),
                Some(self.current().span),
            ));
        }
        Ok(())
    }

    fn skip_separators(&mut self) {
        while matches!(self.peek(), TokenKind::Newline | TokenKind::Semicolon) {
            self.advance();
        }
    }

    fn skip_newlines(&mut self) {
        while self.check(&TokenKind::Newline) {
            self.advance();
        }
    }

    fn program(&mut self) -> ParseResult<Vec<Stmt>> {
        let mut statements = Vec::new();
        self.skip_separators();
        while !self.check(&TokenKind::Eof) {
            statements.push(self.statement()?);
            self.end_of_statement()?;
            self.skip_separators();
        }
        Ok(statements)
    }

    fn end_of_statement(&mut self) -> ParseResult<()> {
        match self.peek() {
            TokenKind::Newline | TokenKind::Semicolon | TokenKind::Eof | TokenKind::RBrace => {
                Ok(())
            }
            _ => Err(self.unexpected("end of statement")),
        }
    }

    fn block(&mut self) -> ParseResult<(Vec<Stmt>, SourceSpan)> {
        self.expect(&TokenKind::LBrace, "`{`")?;
        self.descend()?;
        let mut statements = Vec::new();
        self.skip_separators();
        while !self.check(&TokenKind::RBrace) {
            if self.check(&TokenKind::Eof) {
                return Err(self.unexpected("`}`"));
            }
            statements.push(self.statement()?);
            self.end_of_statement()?;
            self.skip_separators();
        }
        let close = self.advance();
        self.depth -= 1;
        Ok((statements, close.span))
    }

    fn statement(&mut self) -> ParseResult<Stmt> {
        match self.peek().clone() {
            TokenKind::Var => {
                let start = self.advance().span;
                let name = self.identifier("variable name")?;
                self.expect(&TokenKind::Assign, "`=`")?;
                let value = self.expression()?;
                let span = start.to(value.span);
                Ok(Stmt::Var { name, value, span })
            }
            TokenKind::If => self.if_statement(),
            TokenKind::While => {
                let start = self.advance().span;
                let condition = self.expression()?;
                let (body, end) = self.block()?;
                Ok(Stmt::While {
                    condition,
                    body,
                    span: start.to(end),
                })
            }
            TokenKind::Ident(name) if self.lookahead_is(&TokenKind::Assign) => {
                let start = self.advance().span;
                self.advance();
                let value = self.expression()?;
                let span = start.to(value.span);
                Ok(Stmt::Assign { name, value, span })
            }
            _ => Ok(Stmt::Expr(self.expression()?)),
        }
    }

    fn if_statement(&mut self) -> ParseResult<Stmt> {
        let start = self.expect(&TokenKind::If, "`if`")?.span;
        let condition = self.expression()?;
        let (then_body, mut end) = self.block()?;

        // `else` may follow on the next line.
        let saved = self.pos;
        self.skip_newlines();
        let else_body = if self.eat(&TokenKind::Else) {
            if self.check(&TokenKind::If) {
                self.descend()?;
                let nested = self.if_statement()?;
                self.depth -= 1;
                end = nested.span();
                vec![nested]
            } else {
                let (body, close) = self.block()?;
                end = close;
                body
            }
        } else {
            self.pos = saved;
            Vec::new()
        };

        Ok(Stmt::If {
            condition,
            then_body,
            else_body,
            span: start.to(end),
        })
    }

    fn lookahead_is(&self, kind: &TokenKind) -> bool {
        self.tokens
            .get(self.pos + 1)
            .is_some_and(|token| &token.kind == kind)
    }

    fn identifier(&mut self, context: &str) -> ParseResult<String> {
        match self.peek().clone() {
            TokenKind::Ident(name) => {
                self.advance();
                Ok(name)
            }
            _ => Err(self.unexpected(context)),
        }
    }

    fn expression(&mut self) -> ParseResult<Expr> {
        self.descend()?;
        let expr = self.or()?;
        self.depth -= 1;
        Ok(expr)
    }

    // Each operator in a chain nests the tree one level deeper on the left.

    fn or(&mut self) -> ParseResult<Expr> {
        let base = self.depth;
        let mut left = self.and()?;
        while self.eat(&TokenKind::OrOr) {
            self.descend()?;
            let right = self.and()?;
            let span = left.span.to(right.span);
            left = Expr {
                kind: ExprKind::Or(Box::new(left), Box::new(right)),
                span,
            };
        }
        self.depth = base;
        Ok(left)
    }

    fn and(&mut self) -> ParseResult<Expr> {
        let base = self.depth;
        let mut left = self.equality()?;
        while self.eat(&TokenKind::AndAnd) {
            self.descend()?;
            let right = self.equality()?;
            let span = left.span.to(right.span);
            left = Expr {
                kind: ExprKind::And(Box::new(left), Box::new(right)),
                span,
            };
        }
        self.depth = base;
        Ok(left)
    }

    fn binary_level(
        &mut self,
        next: fn(&mut Self) -> ParseResult<Expr>,
        operator: fn(&TokenKind) -> Option<BinaryOp>,
    ) -> ParseResult<Expr> {
        let base = self.depth;
        let mut left = next(self)?;
        while let Some(op) = operator(self.peek()) {
            self.advance();
            self.descend()?;
            let right = next(self)?;
            let span = left.span.to(right.span);
            left = Expr {
                kind: ExprKind::Binary(op, Box::new(left), Box::new(right)),
                span,
            };
        }
        self.depth = base;
        Ok(left)
    }

    fn equality(&mut self) -> ParseResult<Expr> {
        self.binary_level(Self::comparison, |kind| match kind {
            TokenKind::Eq => Some(BinaryOp::Eq),
            TokenKind::NotEq => Some(BinaryOp::NotEq),
            _ => None,
        })
    }

    fn comparison(&mut self) -> ParseResult<Expr> {
        self.binary_level(Self::additive, |kind| match kind {
            TokenKind::Lt => Some(BinaryOp::Lt),
            TokenKind::LtEq => Some(BinaryOp::LtEq),
            TokenKind::Gt => Some(BinaryOp::Gt),
            TokenKind::GtEq => Some(BinaryOp::GtEq),
            _ => None,
        })
    }

    fn additive(&mut self) -> ParseResult<Expr> {
        self.binary_level(Self::multiplicative, |kind| match kind {
            TokenKind::Plus => Some(BinaryOp::Add),
            TokenKind::Minus => Some(BinaryOp::Sub),
            _ => None,
        })
    }

    fn multiplicative(&mut self) -> ParseResult<Expr> {
        self.binary_level(Self::unary, |kind| match kind {
            TokenKind::Star => Some(BinaryOp::Mul),
            TokenKind::Slash => Some(BinaryOp::Div),
            TokenKind::Percent => Some(BinaryOp::Rem),
            _ => None,
        })
    }

    fn unary(&mut self) -> ParseResult<Expr> {
        let op = match self.peek() {
            TokenKind::Minus => UnaryOp::Neg,
            TokenKind::Bang => UnaryOp::Not,
            _ => return self.primary(),
        };
        let start = self.advance().span;
        self.descend()?;
        let operand = self.unary()?;
        self.depth -= 1;
        let span = start.to(operand.span);
        Ok(Expr {
            kind: ExprKind::Unary(op, Box::new(operand)),
            span,
        })
    }

    fn primary(&mut self) -> ParseResult<Expr> {
        let token = self.current().clone();
        let kind = match token.kind {
            TokenKind::Int(n) => ExprKind::Int(n),
            TokenKind::Str(s) => ExprKind::Str(s),
            TokenKind::True => ExprKind::Bool(true),
            TokenKind::False => ExprKind::Bool(false),
            TokenKind::Nil => ExprKind::Nil,
            TokenKind::LParen => {
                self.advance();
                self.skip_newlines();
                let inner = self.expression()?;
                self.skip_newlines();
                let close = self.expect(&TokenKind::RParen, "`)`")?;
                return Ok(Expr {
                    kind: inner.kind,
                    span: token.span.to(close.span),
                });
            }
            TokenKind::Ident(name) => {
                self.advance();
                if self.check(&TokenKind::LParen) {
                    return self.call(name, token.span);
                }
                if self.eat(&TokenKind::Dot) {
                    let member_span = self.current().span;
                    let member = self.identifier("member name")?;
                    return Ok(Expr {
                        kind: ExprKind::Member {
                            target: name,
                            member,
                        },
                        span: token.span.to(member_span),
                    });
                }
                return Ok(Expr {
                    kind: ExprKind::Name(name),
                    span: token.span,
                });
            }
            _ => return Err(self.unexpected("expression")),
        };
        self.advance();
        Ok(Expr {
            kind,
            span: token.span,
        })
    }

    fn call(&mut self, name: String, name_span: SourceSpan) -> ParseResult<Expr> {
        self.expect(&TokenKind::LParen, "`(`")?;
        let mut args = Vec::new();
        self.skip_newlines();
        if !self.check(&TokenKind::RParen) {
            loop {
                args.push(self.expression()?);
                self.skip_newlines();
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
                self.skip_newlines();
            }
        }
        let close = self.expect(&TokenKind::RParen, "`)` or `,`")?;
        Ok(Expr {
            kind: ExprKind::Call {
                name,
                name_span,
                args,
            },
            span: name_span.to(close.span),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::lexer::tokenize;

    fn parse_source(source: &str) -> ParseResult<Vec<Stmt>> {
        parse(tokenize(source)?)
    }

    #[test]
    fn test_precedence() {
        let program = parse_source("1 + 2 * 3 == 7 && !false").unwrap();
        let Stmt::Expr(expr) = &program[0] else {
            panic!("expected expression statement");
        };
        let ExprKind::And(left, right) = &expr.kind else {
            panic!("expected && at the top");
        };
        assert!(matches!(left.kind, ExprKind::Binary(BinaryOp::Eq, _, _)));
        assert!(matches!(right.kind, ExprKind::Unary(UnaryOp::Not, _)));
    }

    #[test]
    fn test_statements() {
        let program = parse_source(
            "var x = 1; x = x + 1\nif x > 1 {\n  print(x)\n}\nelse {\n  print(0)\n}\nwhile x < 5 { x = x + 1 }",
        )
        .unwrap();
        assert_eq!(program.len(), 4);
        assert!(matches!(program[0], Stmt::Var { .. }));
        assert!(matches!(program[1], Stmt::Assign { .. }));
        let Stmt::If { else_body, .. } = &program[2] else {
            panic!("expected if");
        };
        assert_eq!(else_body.len(), 1);
        assert!(matches!(program[3], Stmt::While { .. }));
    }

    #[test]
    fn test_else_if_chain() {
        let program = parse_source("if a { 1 } else if b { 2 } else { 3 }").unwrap();
        let Stmt::If { else_body, .. } = &program[0] else {
            panic!("expected if");
        };
        assert!(matches!(else_body[0], Stmt::If { .. }));
    }

    #[test]
    fn test_member_and_multiline_call() {
        let program = parse_source("print(\n  mathx.pi,\n  2\n)").unwrap();
        let Stmt::Expr(Expr {
            kind: ExprKind::Call { args, .. },
            ..
        }) = &program[0]
        else {
            panic!("expected call");
        };
        assert!(matches!(&args[0].kind, ExprKind::Member { target, member }
            if target == "mathx" && member == "pi"));
    }

    #[test]
    fn test_parse_errors_carry_spans() {
        let err = parse_source("var = 3").unwrap_err();
        assert!(err.message.contains("expected variable name"));
        assert_eq!(err.span.map(|s| s.start_col), Some(5));

        let err = parse_source("if x {\n  1\n").unwrap_err();
        assert!(err.message.contains("`}`"));

        let err = parse_source("1 2").unwrap_err();
        assert!(err.message.contains("end of statement"));
    }

    #[test]
    fn test_nesting_depth_is_capped() {
        let nested = |depth: usize| format!("{}1{}", "(".repeat(depth), ")".repeat(depth));
        assert!(parse_source(&nested(MAX_NESTING_DEPTH - 1)).is_ok());

        let err = parse_source(&nested(200_000)).unwrap_err();
        assert!(err.message.contains("maximum depth"));

        let err = parse_source(&format!("{}1", "-".repeat(200_000))).unwrap_err();
        assert!(err.message.contains("maximum depth"));

        let chain = vec!["1"; 200_000].join(" + ");
        let err = parse_source(&chain).unwrap_err();
        assert!(err.message.contains("maximum depth"));

        let blocks = format!("{}{}", "if true { ".repeat(10_000), "}".repeat(10_000));
        let err = parse_source(&blocks).unwrap_err();
        assert!(err.message.contains("maximum depth"));
    }

    #[test]
    fn test_empty_program() {
        assert!(parse_source("\n\n  // nothing\n").unwrap().is_empty());
    }
}
