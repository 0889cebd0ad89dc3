//! Name checking and bytecode emission.

use rustc_hash::{FxHashMap, FxHashSet};

use super::ast::{Builtin, Expr, ExprKind, Stmt};
use super::module::{Constant, Instruction, MODULE_FORMAT, Module};
use super::types::{Diagnostic, SourceSpan, SymbolDescriptor, SymbolKind};

/// Result of lowering a parsed cell.
#[derive(Debug)]
pub struct Lowered {
    /// `None` when any blocking diagnostic was reported.
    pub module: Option<Module>,
    pub declared: Vec<SymbolDescriptor>,
    pub diagnostics: Vec<Diagnostic>,
}

/// Check `program` against `scope` and emit its module.
///
/// `packages` are the aliases bound by this cell's directives.
pub fn lower(program: &[Stmt], scope: &[SymbolDescriptor], packages: &[String]) -> Lowered {
    let mut emitter = Emitter::new(scope);

    for alias in packages {
        if emitter.prior.get(alias) == Some(&SymbolKind::Variable) {
            emitter.warn(
                format!("package `{}` shadows a variable declared by an earlier cell", alias),
                None,
            );
        }
        emitter.symbols.insert(alias.clone(), SymbolKind::Package);
    }

    emitter.top_level(program);

    let has_errors = emitter.diagnostics.iter().any(Diagnostic::is_blocking);
    let declared = packages
        .iter()
        .map(SymbolDescriptor::package)
        .chain(emitter.declared.iter().map(SymbolDescriptor::variable))
        .collect();

    let diagnostics = std::mem::take(&mut emitter.diagnostics);

    Lowered {
        module: (!has_errors).then(|| emitter.finish()),
        declared,
        diagnostics,
    }
}

struct Emitter {
    prior: FxHashMap<String, SymbolKind>,
    symbols: FxHashMap<String, SymbolKind>,
    declared: Vec<String>,
    declared_set: FxHashSet<String>,

    names: Vec<String>,
    name_index: FxHashMap<String, u32>,
    constants: Vec<Constant>,
    constant_index: FxHashMap<Constant, u32>,
    code: Vec<Instruction>,
    lines: Vec<u32>,
    externs: Vec<String>,
    has_result: bool,

    diagnostics: Vec<Diagnostic>,
}

impl Emitter {
    fn new(scope: &[SymbolDescriptor]) -> Self {
        // Later declarations shadow earlier ones.
        let prior: FxHashMap<String, SymbolKind> = scope
            .iter()
            .map(|symbol| (symbol.name.clone(), symbol.kind))
            .collect();

        Self {
            symbols: prior.clone(),
            prior,
            declared: Vec::new(),
            declared_set: FxHashSet::default(),
            names: Vec::new(),
            name_index: FxHashMap::default(),
            constants: Vec::new(),
            constant_index: FxHashMap::default(),
            code: Vec::new(),
            lines: Vec::new(),
            externs: Vec::new(),
            has_result: false,
            diagnostics: Vec::new(),
        }
    }

    fn finish(mut self) -> Module {
        let line = self.lines.last().copied().unwrap_or(1);
        self.emit(Instruction::Return, line);
        Module {
            format: MODULE_FORMAT,
            names: self.names,
            constants: self.constants,
            code: self.code,
            lines: self.lines,
            externs: self.externs,
            has_result: self.has_result,
        }
    }

    fn error(&mut self, message: impl Into<String>, span: SourceSpan) {
        self.diagnostics.push(Diagnostic::error(message, Some(span)));
    }

    fn warn(&mut self, message: impl Into<String>, span: Option<SourceSpan>) {
        self.diagnostics.push(Diagnostic::warning(message, span));
    }

    fn emit(&mut self, instruction: Instruction, line: u32) -> usize {
        self.code.push(instruction);
        self.lines.push(line);
        self.code.len() - 1
    }

    fn here(&self) -> u32 {
        self.code.len() as u32
    }

    fn patch(&mut self, at: usize, target: u32) {
        self.code[at] = match self.code[at] {
            Instruction::Jump(_) => Instruction::Jump(target),
            Instruction::JumpIfFalse(_) => Instruction::JumpIfFalse(target),
            Instruction::JumpIfFalseOrPop(_) => Instruction::JumpIfFalseOrPop(target),
            Instruction::JumpIfTrueOrPop(_) => Instruction::JumpIfTrueOrPop(target),
            other => other,
        };
    }

    fn name(&mut self, name: &str) -> u32 {
        if let Some(&index) = self.name_index.get(name) {
            return index;
        }
        let index = self.names.len() as u32;
        self.names.push(name.to_string());
        self.name_index.insert(name.to_string(), index);
        index
    }

    fn constant(&mut self, value: Constant) -> u32 {
        if let Some(&index) = self.constant_index.get(&value) {
            return index;
        }
        let index = self.constants.len() as u32;
        self.constants.push(value.clone());
        self.constant_index.insert(value, index);
        index
    }

    fn top_level(&mut self, program: &[Stmt]) {
        let result_index = match program.last() {
            Some(Stmt::Expr(expr)) if !expr.called_builtin().is_some_and(|b| b.is_void()) => {
                Some(program.len() - 1)
            }
            _ => None,
        };

        self.block_with(program, |this, index, stmt| {
            if Some(index) == result_index
                && let Stmt::Expr(expr) = stmt
            {
                this.expression(expr);
                this.has_result = true;
                true
            } else {
                false
            }
        });
    }

    fn block(&mut self, statements: &[Stmt]) {
        self.block_with(statements, |_, _, _| false);
    }

    /// Compile a statement list; `special` may take over a statement.
    fn block_with(
        &mut self,
        statements: &[Stmt],
        mut special: impl FnMut(&mut Self, usize, &Stmt) -> bool,
    ) {
        let mut after_exit = false;
        for (index, stmt) in statements.iter().enumerate() {
            if after_exit {
                self.warn("unreachable statement after `exit`", Some(stmt.span()));
                after_exit = false;
            }
            if !special(self, index, stmt) {
                self.statement(stmt);
            }
            if let Stmt::Expr(expr) = stmt
                && expr.called_builtin() == Some(Builtin::Exit)
            {
                after_exit = true;
            }
        }
    }

    fn statement(&mut self, stmt: &Stmt) {
        let line = stmt.span().start_line;
        match stmt {
            Stmt::Var { name, value, span } => {
                self.expression(value);
                if self.prior.contains_key(name) && !self.declared_set.contains(name) {
                    self.warn(
                        format!("`{}` shadows a symbol declared by an earlier cell", name),
                        Some(*span),
                    );
                }
                if self.declared_set.insert(name.clone()) {
                    self.declared.push(name.clone());
                }
                self.symbols.insert(name.clone(), SymbolKind::Variable);
                let index = self.name(name);
                self.emit(Instruction::DeclareGlobal(index), line);
            }
            Stmt::Assign { name, value, span } => {
                match self.symbols.get(name).copied() {
                    Some(SymbolKind::Variable) => {}
                    Some(SymbolKind::Package) => {
                        self.error(format!("cannot assign to package `{}`", name), *span);
                    }
                    None => {
                        self.error(
                            format!(
                                "cannot assign to undeclared `{}`; declare it with `var {} = ...`",
                                name, name
                            ),
                            *span,
                        );
                    }
                }
                self.expression(value);
                let index = self.name(name);
                self.emit(Instruction::StoreGlobal(index), line);
            }
            Stmt::If {
                condition,
                then_body,
                else_body,
                ..
            } => {
                self.expression(condition);
                let to_else = self.emit(Instruction::JumpIfFalse(0), line);
                self.block(then_body);
                let to_end = self.emit(Instruction::Jump(0), line);
                let else_start = self.here();
                self.patch(to_else, else_start);
                self.block(else_body);
                let end = self.here();
                self.patch(to_end, end);
            }
            Stmt::While {
                condition, body, ..
            } => {
                let start = self.here();
                self.expression(condition);
                let to_end = self.emit(Instruction::JumpIfFalse(0), line);
                self.block(body);
                self.emit(Instruction::Jump(start), line);
                let end = self.here();
                self.patch(to_end, end);
            }
            Stmt::Expr(expr) => {
                self.expression(expr);
                self.emit(Instruction::Pop, line);
            }
        }
    }

    fn expression(&mut self, expr: &Expr) {
        let line = expr.span.start_line;
        match &expr.kind {
            ExprKind::Int(n) => self.push_constant(Constant::Int(*n), line),
            ExprKind::Str(s) => self.push_constant(Constant::Str(s.clone()), line),
            ExprKind::Bool(b) => self.push_constant(Constant::Bool(*b), line),
            ExprKind::Nil => self.push_constant(Constant::Nil, line),
            ExprKind::Name(name) => {
                match self.symbols.get(name).copied() {
                    Some(SymbolKind::Variable) => {}
                    Some(SymbolKind::Package) => self.error(
                        format!(
                            "package `{}` cannot be used as a value; access a member like `{}.name`",
                            name, name
                        ),
                        expr.span,
                    ),
                    None => self.error(format!("cannot find `{}` in scope", name), expr.span),
                }
                let index = self.name(name);
                self.emit(Instruction::LoadGlobal(index), line);
            }
            ExprKind::Member { target, member } => {
                if self.symbols.get(target) != Some(&SymbolKind::Package) {
                    self.error(
                        format!("`{}` is not a referenced package; add `#r \"{}\"`", target, target),
                        expr.span,
                    );
                } else if !self.externs.contains(target) {
                    self.externs.push(target.clone());
                }
                let package = self.name(target);
                let member = self.name(member);
                self.emit(Instruction::LoadMember { package, member }, line);
            }
            ExprKind::Unary(op, operand) => {
                self.expression(operand);
                self.emit(Instruction::Unary(*op), line);
            }
            ExprKind::Binary(op, left, right) => {
                self.expression(left);
                self.expression(right);
                self.emit(Instruction::Binary(*op), line);
            }
            ExprKind::And(left, right) => {
                self.expression(left);
                let jump = self.emit(Instruction::JumpIfFalseOrPop(0), line);
                self.expression(right);
                let end = self.here();
                self.patch(jump, end);
            }
            ExprKind::Or(left, right) => {
                self.expression(left);
                let jump = self.emit(Instruction::JumpIfTrueOrPop(0), line);
                self.expression(right);
                let end = self.here();
                self.patch(jump, end);
            }
            ExprKind::Call {
                name,
                name_span,
                args,
            } => {
                let Some(builtin) = Builtin::lookup(name) else {
                    self.error(format!("unknown function `{}`", name), *name_span);
                    for arg in args {
                        self.expression(arg);
                    }
                    return;
                };
                let (min, max) = builtin.arity();
                if args.len() < min || args.len() > max {
                    let expected = if min == max {
                        format!("{}", min)
                    } else {
                        format!("{} to {}", min, max)
                    };
                    self.error(
                        format!(
                            "`{}` takes {} argument(s) but {} were given",
                            builtin.name(),
                            expected,
                            args.len()
                        ),
                        expr.span,
                    );
                }
                for arg in args {
                    self.expression(arg);
                }
                let argc = args.len().min(u8::MAX as usize) as u8;
                self.emit(Instruction::Call { builtin, argc }, line);
            }
        }
    }

    fn push_constant(&mut self, value: Constant, line: u32) {
        let index = self.constant(value);
        self.emit(Instruction::Const(index), line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::lexer::tokenize;
    use crate::compile::parser::parse;

    fn lower_source(source: &str, scope: &[SymbolDescriptor]) -> Lowered {
        let program = parse(tokenize(source).unwrap()).unwrap();
        lower(&program, scope, &[])
    }

    fn errors(lowered: &Lowered) -> Vec<&str> {
        lowered
            .diagnostics
            .iter()
            .filter(|d| d.is_blocking())
            .map(|d| d.message.as_str())
            .collect()
    }

    #[test]
    fn test_declared_state_in_order() {
        let lowered = lower_source("var b = 1\nvar a = 2\nvar b = 3", &[]);
        assert_eq!(
            lowered.declared,
            vec![SymbolDescriptor::variable("b"), SymbolDescriptor::variable("a")]
        );
        assert!(lowered.module.is_some());
    }

    #[test]
    fn test_undeclared_names_are_blocking() {
        let lowered = lower_source("var y = x + 1\nz = 2", &[]);
        let errs = errors(&lowered);
        assert_eq!(errs.len(), 2);
        assert!(errs[0].contains("cannot find `x`"));
        assert!(errs[1].contains("undeclared `z`"));
        assert!(lowered.module.is_none());
    }

    #[test]
    fn test_prior_scope_is_visible() {
        let scope = [SymbolDescriptor::variable("x")];
        let lowered = lower_source("var y = x + 1\ny", &scope);
        assert!(errors(&lowered).is_empty());
        let module = lowered.module.unwrap();
        assert!(module.has_result);
        assert_eq!(module.code.last(), Some(&Instruction::Return));
    }

    #[test]
    fn test_shadowing_is_advisory() {
        let scope = [SymbolDescriptor::variable("x")];
        let lowered = lower_source("var x = 2", &scope);
        assert!(lowered.module.is_some());
        assert_eq!(lowered.diagnostics.len(), 1);
        assert!(!lowered.diagnostics[0].is_blocking());
    }

    #[test]
    fn test_builtin_checks() {
        let lowered = lower_source("frobnicate(1)\nlen(1, 2)", &[]);
        let errs = errors(&lowered);
        assert!(errs[0].contains("unknown function `frobnicate`"));
        assert!(errs[1].contains("takes 1 argument(s) but 2 were given"));
    }

    #[test]
    fn test_void_call_has_no_result() {
        let module = lower_source("print(1)", &[]).module.unwrap();
        assert!(!module.has_result);
        let module = lower_source("len(\"abc\")", &[]).module.unwrap();
        assert!(module.has_result);
    }

    #[test]
    fn test_package_symbols() {
        let program = parse(tokenize("var r = mathx.pi * 2\nmathx").unwrap()).unwrap();
        let lowered = lower(&program, &[], &["mathx".to_string()]);
        let errs = errors(&lowered);
        assert_eq!(errs.len(), 1);
        assert!(errs[0].contains("cannot be used as a value"));
        assert_eq!(lowered.declared[0], SymbolDescriptor::package("mathx"));

        let lowered = lower_source("var r = other.pi", &[]);
        assert!(errors(&lowered)[0].contains("not a referenced package"));
    }

    #[test]
    fn test_unreachable_after_exit() {
        let lowered = lower_source("exit(3)\nprint(1)", &[]);
        assert!(lowered.module.is_some());
        assert!(lowered.diagnostics[0].message.contains("unreachable"));
    }

    #[test]
    fn test_empty_program_returns_immediately() {
        let module = lower_source("", &[]).module.unwrap();
        assert_eq!(module.code, vec![Instruction::Return]);
        assert!(!module.has_result);
    }
}
