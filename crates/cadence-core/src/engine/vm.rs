//! Bytecode engine boundary
//!
//! The engine that actually executes a program's synthesis graph lives
//! outside this crate. The scheduler drives it through [`VmBackend`]: one
//! `run` per instance per quantum, then reads the instance's output
//! buffers and history snapshot back.
//!
//! Control ops are 32-bit words. Opcodes and integer operands are stored
//! as-is; scalar operands are f32 bit patterns.

use crate::error::VmError;
use crate::samples::SampleRegistry;
use crate::types::VmId;

/// Per-quantum parameters handed to every `run`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunContext {
    pub block_len: usize,
    pub sample_count: u32,
    pub sample_rate: u32,
    pub nyquist: f32,
    pub pi_over_nyquist: f32,
    /// Override tempo if set, else the engine tempo
    pub tempo: f32,
}

/// What an instance produced for the last quantum
#[derive(Debug, Clone, Copy, Default)]
pub struct VmOutput<'a> {
    /// Left output, `None` if the instance produced no audio
    pub left: Option<&'a [f32]>,
    pub right: Option<&'a [f32]>,
    /// History entries (`HISTORY_STRIDE` words each)
    pub history: &'a [u32],
}

/// A bytecode engine hosting many instances addressed by [`VmId`]
pub trait VmBackend: Send {
    /// Execute one quantum of `ops` on instance `vm`
    ///
    /// Sample material is read through `samples`. A disposed instance that
    /// was not reset since yields [`VmError::UnknownInstance`].
    fn run(
        &mut self,
        vm: VmId,
        ops: &[u32],
        ctx: &RunContext,
        samples: &mut SampleRegistry,
    ) -> Result<(), VmError>;

    /// Output of the most recent `run` of `vm`
    fn output(&self, vm: VmId) -> VmOutput<'_>;

    /// Return an instance to its initial state
    fn reset(&mut self, vm: VmId);

    /// Release an instance's resources
    fn dispose(&mut self, vm: VmId);

    /// Clone the full internal state of `from` into `to`
    ///
    /// Fails with [`VmError::UnknownInstance`] like `run`.
    fn copy_state(&mut self, from: VmId, to: VmId) -> Result<(), VmError>;

    /// Reclaim memory no longer referenced by any instance
    fn collect(&mut self);

    /// Changes whenever the engine's memory region is replaced
    fn memory_generation(&self) -> u64;

    /// Bytes of engine memory in use
    fn memory_usage(&self) -> usize;

    /// Grow engine memory; returns the previous size in pages
    fn memory_grow(&mut self, delta_pages: u32) -> u32;

    /// 0 clears the override
    fn set_tempo_override(&mut self, bpm: f32);
}

// ─────────────────────────────────────────────────────────────
// Opcodes
// ─────────────────────────────────────────────────────────────

/// Engine opcodes the scheduler needs to understand
///
/// Numbering is fixed by the bytecode format. Opcodes above
/// [`Opcode::MathTernary`] are generator calls without inline operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Opcode {
    Out = 0,
    Solo = 1,
    Post = 2,
    PushScalar = 3,
    PushAudio = 4,
    PushUndefined = 5,
    SetBpm = 6,
    Time = 7,
    TableLookup = 8,
    Alloc = 9,
    Write = 10,
    Read = 11,
    Tram = 12,
    Mini = 13,
    Timeline = 14,
    Oversample = 15,
    MakeArray = 16,
    ArrayGet = 17,
    ArraySet = 18,
    ArrayLen = 19,
    ArrayPush = 20,
    Walk = 21,
    Glide = 22,
    Step = 23,
    Random = 24,
    GetSystem = 25,
    GetGlobal = 26,
    GetLocal = 27,
    SetGlobal = 28,
    SetLocal = 29,
    GetClosure = 30,
    SetClosure = 31,
    GetCellRefLocal = 32,
    GetCellRefGlobal = 33,
    GetCellRefClosure = 34,
    DefineFunction = 35,
    CallFunction = 36,
    Return = 37,
    Throw = 38,
    PushTryBlock = 39,
    PopTryBlock = 40,
    Jump = 41,
    JumpIfFalse = 42,
    JumpIfTrue = 43,
    PushClosure = 44,
    PopScope = 45,
    Dup = 46,
    Pop = 47,
    Neg = 48,
    Not = 49,
    BitNot = 50,
    Add = 51,
    Sub = 52,
    Mul = 53,
    Div = 54,
    Mod = 55,
    Pow = 56,
    Greater = 57,
    Less = 58,
    GreaterEqual = 59,
    LessEqual = 60,
    Equal = 61,
    NotEqual = 62,
    And = 63,
    Or = 64,
    BitAnd = 65,
    BitOr = 66,
    BitXor = 67,
    ShiftLeft = 68,
    ShiftRight = 69,
    IsUndefined = 70,
    IsScalar = 71,
    IsAudio = 72,
    IsArray = 73,
    IsFunction = 74,
    MathUnary = 75,
    MathBinary = 76,
    MathTernary = 77,
}

impl Opcode {
    /// Decode a word; generator calls and unknown words yield None
    pub fn from_u32(word: u32) -> Option<Self> {
        use Opcode::*;
        const TABLE: [Opcode; 78] = [
            Out, Solo, Post, PushScalar, PushAudio, PushUndefined, SetBpm, Time, TableLookup,
            Alloc, Write, Read, Tram, Mini, Timeline, Oversample, MakeArray, ArrayGet, ArraySet,
            ArrayLen, ArrayPush, Walk, Glide, Step, Random, GetSystem, GetGlobal, GetLocal,
            SetGlobal, SetLocal, GetClosure, SetClosure, GetCellRefLocal, GetCellRefGlobal,
            GetCellRefClosure, DefineFunction, CallFunction, Return, Throw, PushTryBlock,
            PopTryBlock, Jump, JumpIfFalse, JumpIfTrue, PushClosure, PopScope, Dup, Pop, Neg, Not,
            BitNot, Add, Sub, Mul, Div, Mod, Pow, Greater, Less, GreaterEqual, LessEqual, Equal,
            NotEqual, And, Or, BitAnd, BitOr, BitXor, ShiftLeft, ShiftRight, IsUndefined,
            IsScalar, IsAudio, IsArray, IsFunction, MathUnary, MathBinary, MathTernary,
        ];
        TABLE.get(word as usize).copied()
    }

    /// How this opcode's inline operands are laid out
    pub fn operands(self) -> Operands {
        use Opcode::*;
        match self {
            PushScalar | PushAudio | SetBpm | GetSystem | GetGlobal | SetGlobal | GetLocal
            | SetLocal | GetClosure | SetClosure | GetCellRefLocal | GetCellRefGlobal
            | GetCellRefClosure | PushClosure | CallFunction | ArrayPush | MakeArray | ArrayGet
            | Out | Solo | MathUnary | MathBinary | MathTernary | Alloc | Step | Random => {
                Operands::Param
            }
            Jump | JumpIfFalse | JumpIfTrue => Operands::PcParam,
            PushTryBlock => Operands::ThreeParams,
            TableLookup | Tram | Mini | Timeline => Operands::Table,
            DefineFunction => Operands::DefineFunction,
            _ => Operands::None,
        }
    }
}

/// Inline operand layout following an opcode word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operands {
    None,
    /// One operand word
    Param,
    /// One operand word holding a jump target
    PcParam,
    ThreeParams,
    /// Length word (f32) followed by that many words
    Table,
    /// Five header words, the bytecode length (f32) as the sixth, then the body
    DefineFunction,
}

/// Operand words following the opcode at `pc`
///
/// `pc` points at the first operand word.
fn operand_len(op: Option<Opcode>, ops: &[u32], pc: usize) -> usize {
    let f32_at = |i: usize| ops.get(i).map_or(0.0, |&w| f32::from_bits(w));
    match op.map_or(Operands::None, Opcode::operands) {
        Operands::None => 0,
        Operands::Param | Operands::PcParam => 1,
        Operands::ThreeParams => 3,
        Operands::Table => 1 + f32_at(pc).round().max(0.0) as usize,
        Operands::DefineFunction => 6 + f32_at(pc + 5).round().max(0.0) as usize,
    }
}

/// Find the tempo set by an op stream
///
/// Walks the stream opcode by opcode, skipping operands, and returns the
/// operand of the last `SetBpm`; 0 if there is none.
pub fn scan_tempo(ops: &[u32]) -> f32 {
    let mut pc = 0;
    let mut bpm = 0.0;
    while pc < ops.len() {
        let op = Opcode::from_u32(ops[pc]);
        pc += 1;
        if op == Some(Opcode::SetBpm) {
            bpm = ops.get(pc).map_or(0.0, |&w| f32::from_bits(w));
            pc += 1;
            continue;
        }
        pc = pc.saturating_add(operand_len(op, ops, pc));
    }
    bpm
}
