//! Binary module format.
//!
//! A module is a small stack-machine program encoded with rkyv. The encoding
//! depends only on the cell buffer and the scope it was compiled in.

use rkyv::rancor;
use rkyv::util::AlignedVec;
use rkyv::{Archive, Deserialize, Serialize};

use super::ast::{BinaryOp, Builtin, UnaryOp};

/// Current module format version.
pub const MODULE_FORMAT: u32 = 1;

/// A literal value, in modules and in package exports.
#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    Hash,
    Archive,
    Serialize,
    Deserialize,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(untagged)]
pub enum Constant {
    Int(i64),
    Str(String),
    Bool(bool),
    Nil,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, Serialize, Deserialize)]
pub enum Instruction {
    /// Push `constants[i]`.
    Const(u32),
    /// Push the global named `names[i]`.
    LoadGlobal(u32),
    /// Pop into an existing global.
    StoreGlobal(u32),
    /// Pop into a (possibly new) global.
    DeclareGlobal(u32),
    /// Push an export of a referenced package.
    LoadMember { package: u32, member: u32 },
    Unary(UnaryOp),
    Binary(BinaryOp),
    Jump(u32),
    /// Pop; jump when falsy.
    JumpIfFalse(u32),
    /// Jump keeping the value when falsy, otherwise pop.
    JumpIfFalseOrPop(u32),
    /// Jump keeping the value when truthy, otherwise pop.
    JumpIfTrueOrPop(u32),
    Call { builtin: Builtin, argc: u8 },
    Pop,
    /// Stop; the top of stack is the result when the module has one.
    Return,
}

#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
pub struct Module {
    pub format: u32,
    pub names: Vec<String>,
    pub constants: Vec<Constant>,
    pub code: Vec<Instruction>,
    /// Source line of each instruction.
    pub lines: Vec<u32>,
    /// Package aliases the module reads members from.
    pub externs: Vec<String>,
    pub has_result: bool,
}

impl Module {
    pub fn encode(&self) -> Result<Vec<u8>, String> {
        rkyv::to_bytes::<rancor::Error>(self)
            .map(|bytes| bytes.to_vec())
            .map_err(|e| format!("failed to encode module: {}", e))
    }

    /// Decode and validate a module produced by [`Module::encode`].
    pub fn decode(bytes: &[u8]) -> Result<Self, String> {
        let mut aligned = AlignedVec::<16>::with_capacity(bytes.len());
        aligned.extend_from_slice(bytes);

        let module = rkyv::from_bytes::<Module, rancor::Error>(&aligned)
            .map_err(|e| format!("malformed module: {}", e))?;

        if module.format != MODULE_FORMAT {
            return Err(format!(
                "unsupported module format {} (expected {})",
                module.format, MODULE_FORMAT
            ));
        }
        if module.lines.len() != module.code.len() {
            return Err("malformed module: line table does not match code".to_string());
        }
        Ok(module)
    }

    /// Source line of instruction `pc`.
    pub fn line(&self, pc: usize) -> Option<u32> {
        self.lines.get(pc).copied()
    }
}
