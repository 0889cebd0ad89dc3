//! Stack machine that runs compiled modules against persistent top-level
//! state.
//!
//! Globals survive across runs until [`Runtime::reset`]. A faulted or
//! aborted run keeps whatever it assigned before stopping.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;

use super::loader::{IsolatedModuleLoader, LookupError};
use super::types::{Fault, FaultKind, GlobalVariable, OutputStream};
use super::value::Value;
use crate::compile::{BinaryOp, Builtin, Instruction, Module, UnaryOp};

/// Instructions executed between abort checks.
const ABORT_CHECK_INTERVAL: u32 = 256;

/// Slice `sleep` waits in before re-checking for abort.
const SLEEP_SLICE: Duration = Duration::from_millis(10);

/// Where a running module sends its effects.
pub trait Host {
    fn output(&mut self, stream: OutputStream, text: String);
    fn is_aborted(&self) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Finished; carries the result value for modules that have one.
    Completed(Option<Value>),
    Faulted(Fault),
    Aborted,
    /// The module called `exit`; the context is expected to terminate.
    Exit(i32),
}

/// Early exit from the instruction loop.
enum Stop {
    Fault(FaultKind, String),
    Aborted,
    Exit(i32),
}

type Step<T> = Result<T, Stop>;

fn fault<T>(kind: FaultKind, message: impl Into<String>) -> Step<T> {
    Err(Stop::Fault(kind, message.into()))
}

#[derive(Default)]
pub struct Runtime {
    globals: Vec<(String, Value)>,
    index: FxHashMap<String, usize>,
}

impl Runtime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn run(
        &mut self,
        module: &Module,
        loader: &IsolatedModuleLoader,
        host: &mut dyn Host,
    ) -> RunOutcome {
        let mut pc = 0usize;
        let mut stack: Vec<Value> = Vec::with_capacity(16);
        let mut budget = ABORT_CHECK_INTERVAL;

        let stop = loop {
            budget -= 1;
            if budget == 0 {
                budget = ABORT_CHECK_INTERVAL;
                if host.is_aborted() {
                    break Stop::Aborted;
                }
            }

            let Some(instruction) = module.code.get(pc).copied() else {
                break Stop::Fault(FaultKind::TypeError, "jump out of bounds".to_string());
            };
            let at = pc;
            pc += 1;

            let step = match instruction {
                Instruction::Return => {
                    let result = if module.has_result { stack.pop() } else { None };
                    return RunOutcome::Completed(result);
                }
                Instruction::Const(i) => constant(module, i).map(|value| stack.push(value)),
                Instruction::LoadGlobal(i) => {
                    let name = name(module, i);
                    match self.get(name) {
                        Some(value) => {
                            stack.push(value.clone());
                            Ok(())
                        }
                        None => fault(FaultKind::NameError, format!("`{}` is not defined", name)),
                    }
                }
                Instruction::StoreGlobal(i) | Instruction::DeclareGlobal(i) => {
                    let value = pop(&mut stack);
                    self.set(name(module, i), value);
                    Ok(())
                }
                Instruction::LoadMember { package, member } => loader
                    .member(name(module, package), name(module, member))
                    .map(|value| stack.push(value))
                    .or_else(|e| match e {
                        LookupError::UnknownMember { package, member } => fault(
                            FaultKind::AttributeError,
                            format!("package {} has no export `{}`", package, member),
                        ),
                        other => fault(FaultKind::NameError, format!("{:?}", other)),
                    }),
                Instruction::Unary(op) => {
                    let operand = pop(&mut stack);
                    unary(op, operand).map(|value| stack.push(value))
                }
                Instruction::Binary(op) => {
                    let right = pop(&mut stack);
                    let left = pop(&mut stack);
                    binary(op, left, right).map(|value| stack.push(value))
                }
                Instruction::Jump(target) => {
                    pc = target as usize;
                    Ok(())
                }
                Instruction::JumpIfFalse(target) => {
                    if !pop(&mut stack).is_truthy() {
                        pc = target as usize;
                    }
                    Ok(())
                }
                Instruction::JumpIfFalseOrPop(target) => {
                    if stack.last().is_some_and(|v| !v.is_truthy()) {
                        pc = target as usize;
                    } else {
                        stack.pop();
                    }
                    Ok(())
                }
                Instruction::JumpIfTrueOrPop(target) => {
                    if stack.last().is_some_and(Value::is_truthy) {
                        pc = target as usize;
                    } else {
                        stack.pop();
                    }
                    Ok(())
                }
                Instruction::Pop => {
                    stack.pop();
                    Ok(())
                }
                Instruction::Call { builtin, argc } => {
                    let split = stack.len().saturating_sub(argc as usize);
                    let args = stack.split_off(split);
                    call(builtin, args, loader, host).map(|value| stack.push(value))
                }
            };

            if let Err(stop) = step {
                match stop {
                    Stop::Fault(kind, message) => {
                        return RunOutcome::Faulted(Fault {
                            kind,
                            message,
                            line: module.line(at),
                        });
                    }
                    other => break other,
                }
            }
        };

        match stop {
            Stop::Aborted => RunOutcome::Aborted,
            Stop::Exit(code) => RunOutcome::Exit(code),
            Stop::Fault(kind, message) => RunOutcome::Faulted(Fault {
                kind,
                message,
                line: None,
            }),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.index.get(name).map(|&i| &self.globals[i].1)
    }

    fn set(&mut self, name: &str, value: Value) {
        match self.index.get(name) {
            Some(&i) => self.globals[i].1 = value,
            None => {
                self.index.insert(name.to_string(), self.globals.len());
                self.globals.push((name.to_string(), value));
            }
        }
    }

    /// Live globals in declaration order.
    pub fn globals(&self) -> Vec<GlobalVariable> {
        self.globals
            .iter()
            .map(|(name, value)| GlobalVariable {
                name: name.clone(),
                value: value.representation(),
            })
            .collect()
    }

    pub fn reset(&mut self) {
        self.globals.clear();
        self.index.clear();
    }
}

fn name(module: &Module, index: u32) -> &str {
    module
        .names
        .get(index as usize)
        .map(String::as_str)
        .unwrap_or("<invalid>")
}

fn constant(module: &Module, index: u32) -> Step<Value> {
    match module.constants.get(index as usize) {
        Some(constant) => Ok(Value::from(constant)),
        None => fault(FaultKind::TypeError, "constant index out of bounds"),
    }
}

fn pop(stack: &mut Vec<Value>) -> Value {
    stack.pop().unwrap_or(Value::Nil)
}

fn unary(op: UnaryOp, operand: Value) -> Step<Value> {
    match (op, operand) {
        (UnaryOp::Not, value) => Ok(Value::Bool(!value.is_truthy())),
        (UnaryOp::Neg, Value::Int(n)) => match n.checked_neg() {
            Some(n) => Ok(Value::Int(n)),
            None => fault(FaultKind::OverflowError, "integer overflow in negation"),
        },
        (UnaryOp::Neg, value) => fault(
            FaultKind::TypeError,
            format!("cannot negate a {}", value.type_name()),
        ),
    }
}

fn binary(op: BinaryOp, left: Value, right: Value) -> Step<Value> {
    use BinaryOp::*;

    match op {
        Eq => return Ok(Value::Bool(left == right)),
        NotEq => return Ok(Value::Bool(left != right)),
        _ => {}
    }

    match (&left, &right) {
        (Value::Int(a), Value::Int(b)) => {
            let (a, b) = (*a, *b);
            let checked = match op {
                Add => a.checked_add(b),
                Sub => a.checked_sub(b),
                Mul => a.checked_mul(b),
                Div | Rem if b == 0 => {
                    return fault(FaultKind::DivideByZero, "division by zero");
                }
                Div => a.checked_div(b),
                Rem => a.checked_rem(b),
                Lt => return Ok(Value::Bool(a < b)),
                LtEq => return Ok(Value::Bool(a <= b)),
                Gt => return Ok(Value::Bool(a > b)),
                GtEq => return Ok(Value::Bool(a >= b)),
                Eq | NotEq => unreachable!("handled above"),
            };
            match checked {
                Some(n) => Ok(Value::Int(n)),
                None => fault(FaultKind::OverflowError, "integer overflow"),
            }
        }
        (Value::Str(a), Value::Str(b)) => match op {
            Add => {
                let mut joined = String::with_capacity(a.len() + b.len());
                joined.push_str(a);
                joined.push_str(b);
                Ok(Value::Str(Arc::from(joined)))
            }
            Lt => Ok(Value::Bool(a < b)),
            LtEq => Ok(Value::Bool(a <= b)),
            Gt => Ok(Value::Bool(a > b)),
            GtEq => Ok(Value::Bool(a >= b)),
            _ => fault(
                FaultKind::TypeError,
                format!("unsupported operator {} for strings", symbol(op)),
            ),
        },
        _ => fault(
            FaultKind::TypeError,
            format!(
                "unsupported operand types for {}: {} and {}",
                symbol(op),
                left.type_name(),
                right.type_name()
            ),
        ),
    }
}

fn symbol(op: BinaryOp) -> &'static str {
    match op {
        BinaryOp::Mul => "*",
        BinaryOp::Div => "/",
        BinaryOp::Rem => "%",
        BinaryOp::Add => "+",
        BinaryOp::Sub => "-",
        BinaryOp::Lt => "<",
        BinaryOp::LtEq => "<=",
        BinaryOp::Gt => ">",
        BinaryOp::GtEq => ">=",
        BinaryOp::Eq => "==",
        BinaryOp::NotEq => "!=",
    }
}

fn call(
    builtin: Builtin,
    args: Vec<Value>,
    loader: &IsolatedModuleLoader,
    host: &mut dyn Host,
) -> Step<Value> {
    match builtin {
        Builtin::Print | Builtin::Eprint => {
            let mut line = args
                .iter()
                .map(Value::to_string)
                .collect::<Vec<_>>()
                .join(" ");
            line.push('\n');
            let stream = if builtin == Builtin::Print {
                OutputStream::Stdout
            } else {
                OutputStream::Stderr
            };
            host.output(stream, line);
            Ok(Value::Nil)
        }
        Builtin::Len => match args.first() {
            Some(Value::Str(s)) => Ok(Value::Int(s.chars().count() as i64)),
            Some(other) => fault(
                FaultKind::TypeError,
                format!("len() expects a string, got {}", other.type_name()),
            ),
            None => fault(FaultKind::TypeError, "len() expects one argument"),
        },
        Builtin::Str => {
            let text = args.first().map(Value::to_string).unwrap_or_default();
            Ok(Value::Str(Arc::from(text)))
        }
        Builtin::Fail => {
            let message = args.first().map(Value::to_string).unwrap_or_default();
            fault(FaultKind::Failure, message)
        }
        Builtin::Sleep => match args.first() {
            Some(Value::Int(ms)) if *ms >= 0 => {
                sleep(Duration::from_millis(*ms as u64), host)?;
                Ok(Value::Nil)
            }
            Some(other) => fault(
                FaultKind::TypeError,
                format!("sleep() expects non-negative milliseconds, got {}", other.representation()),
            ),
            None => fault(FaultKind::TypeError, "sleep() expects one argument"),
        },
        Builtin::Exit => match args.first() {
            None => Err(Stop::Exit(0)),
            Some(Value::Int(code)) => Err(Stop::Exit(i32::try_from(*code).unwrap_or(1))),
            Some(other) => fault(
                FaultKind::TypeError,
                format!("exit() expects an int, got {}", other.type_name()),
            ),
        },
        Builtin::Native => match (args.first(), args.get(1)) {
            (Some(Value::Str(library)), Some(Value::Str(symbol))) => {
                match loader.native_symbol(library, symbol) {
                    Ok(found) => Ok(Value::Bool(found)),
                    Err(_) => fault(
                        FaultKind::NativeLoadError,
                        format!("native library `{}` is not loaded", library),
                    ),
                }
            }
            _ => fault(FaultKind::TypeError, "native() expects two strings"),
        },
    }
}

fn sleep(duration: Duration, host: &mut dyn Host) -> Step<()> {
    let deadline = Instant::now() + duration;
    loop {
        if host.is_aborted() {
            return Err(Stop::Aborted);
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(());
        }
        std::thread::sleep(SLEEP_SLICE.min(deadline - now));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::{CompiledUnit, SymbolDescriptor, compile_unit};
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct Recorder {
        output: Vec<(OutputStream, String)>,
        aborted: Arc<AtomicBool>,
    }

    impl Host for Recorder {
        fn output(&mut self, stream: OutputStream, text: String) {
            self.output.push((stream, text));
        }

        fn is_aborted(&self) -> bool {
            self.aborted.load(Ordering::Relaxed)
        }
    }

    struct Session {
        runtime: Runtime,
        loader: IsolatedModuleLoader,
        scope: Vec<SymbolDescriptor>,
    }

    impl Session {
        fn new() -> Self {
            Self {
                runtime: Runtime::new(),
                loader: IsolatedModuleLoader::new(),
                scope: Vec::new(),
            }
        }

        fn eval(&mut self, source: &str, host: &mut Recorder) -> RunOutcome {
            let unit: CompiledUnit = compile_unit(source, &self.scope).unwrap();
            self.scope.extend(unit.declared_top_level_state.iter().cloned());
            let handle = self.loader.load(&unit.binary_module, vec![]).unwrap();
            let module = self.loader.module(handle).unwrap();
            self.runtime.run(&module, &self.loader, host)
        }
    }

    #[test]
    fn test_state_persists_between_runs() {
        let mut session = Session::new();
        let mut host = Recorder::default();

        assert_eq!(session.eval("var x = 40", &mut host), RunOutcome::Completed(None));
        assert_eq!(
            session.eval("x = x + 1\nx + 1", &mut host),
            RunOutcome::Completed(Some(Value::Int(42)))
        );
        assert_eq!(session.runtime.globals()[0].value.text, "41");
    }

    #[test]
    fn test_print_and_loops() {
        let mut session = Session::new();
        let mut host = Recorder::default();
        let outcome = session.eval(
            "var i = 0\nwhile i < 3 {\n  print(\"i =\", i)\n  i = i + 1\n}\neprint(\"done\")",
            &mut host,
        );

        assert_eq!(outcome, RunOutcome::Completed(None));
        assert_eq!(host.output.len(), 4);
        assert_eq!(host.output[2], (OutputStream::Stdout, "i = 2\n".to_string()));
        assert_eq!(host.output[3], (OutputStream::Stderr, "done\n".to_string()));
    }

    #[test]
    fn test_fault_reports_line_and_keeps_prior_assignments() {
        let mut session = Session::new();
        let mut host = Recorder::default();
        let outcome = session.eval("var a = 1\nvar b = a / 0", &mut host);

        let RunOutcome::Faulted(fault) = outcome else {
            panic!("expected fault, got {:?}", outcome);
        };
        assert_eq!(fault.kind, FaultKind::DivideByZero);
        assert_eq!(fault.line, Some(2));
        assert_eq!(session.runtime.get("a"), Some(&Value::Int(1)));
        assert_eq!(session.runtime.get("b"), None);
    }

    #[test]
    fn test_fail_and_type_errors() {
        let mut session = Session::new();
        let mut host = Recorder::default();

        let RunOutcome::Faulted(fault) = session.eval("fail(\"boom\")", &mut host) else {
            panic!("expected fault");
        };
        assert_eq!((fault.kind, fault.message.as_str()), (FaultKind::Failure, "boom"));

        let RunOutcome::Faulted(fault) = session.eval("1 + \"x\"", &mut host) else {
            panic!("expected fault");
        };
        assert_eq!(fault.kind, FaultKind::TypeError);
    }

    #[test]
    fn test_short_circuit_and_strings() {
        let mut session = Session::new();
        let mut host = Recorder::default();
        assert_eq!(
            session.eval("false && fail(\"never\")", &mut host),
            RunOutcome::Completed(Some(Value::Bool(false)))
        );
        assert_eq!(
            session.eval("len(\"ab\" + str(12))", &mut host),
            RunOutcome::Completed(Some(Value::Int(4)))
        );
    }

    #[test]
    fn test_abort_interrupts_loop() {
        let mut session = Session::new();
        let mut host = Recorder::default();
        host.aborted.store(true, Ordering::Relaxed);

        assert_eq!(session.eval("while true { }", &mut host), RunOutcome::Aborted);
        assert_eq!(session.eval("sleep(60000)", &mut host), RunOutcome::Aborted);
    }

    #[test]
    fn test_exit_and_overflow() {
        let mut session = Session::new();
        let mut host = Recorder::default();
        assert_eq!(session.eval("exit(3)", &mut host), RunOutcome::Exit(3));

        let RunOutcome::Faulted(fault) = session.eval("9223372036854775807 + 1", &mut host) else {
            panic!("expected fault");
        };
        assert_eq!(fault.kind, FaultKind::OverflowError);
    }

    #[test]
    fn test_reset_clears_globals() {
        let mut session = Session::new();
        let mut host = Recorder::default();
        session.eval("var x = 1", &mut host);
        session.runtime.reset();
        assert!(session.runtime.globals().is_empty());
    }
}
