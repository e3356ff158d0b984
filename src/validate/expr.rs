// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Stack-typed validation of WebAssembly expressions.
//!
//! Implements the standard "validation algorithm" from the WebAssembly
//! specification appendix: an operand-type stack and a control-frame stack,
//! walked once over the flat, natively-aligned bytecode that `decode::expr`
//! produces, with an `unreachable` polymorphism rule so that dead code after
//! an unconditional branch type-checks against anything.

use crate::Allocator;
use crate::core_compat::alloc::Global;
use crate::core_compat::vec::Vec as RawVec;
use crate::types::{
    BlockType, BulkOpcode, CallIndirectOperands, Expression, FuncIdx, FunctionType, GlobalIdx,
    GlobalTypeMutability, LabelIdx, Local, LocalIdx, MemArg, Opcode, SectionId, ValType,
};

use super::{Error, Validator};

/// What an expression is being validated as: a function body (whose block
/// type comes from the surrounding function signature and whose locals are
/// addressable), or a constant initializer (restricted to a handful of
/// opcodes, producing exactly one value of a known type).
pub(crate) enum ExpressionValidationContext<'module, A: Allocator> {
    Function(&'module FunctionType<A>, &'module [Local]),
    Constant(ValType),
}

// An operand-stack entry. `Unknown` stands for the "polymorphic" value
// pushed after an unreachable instruction: it unifies with any expected type.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Operand {
    Val(ValType),
    Unknown,
}

impl From<ValType> for Operand {
    fn from(ty: ValType) -> Self {
        Operand::Val(ty)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum FrameKind {
    Block,
    Loop,
    If,
    Else,
    Func,
}

struct Frame {
    kind: FrameKind,
    start_types: RawVec<ValType, Global>,
    end_types: RawVec<ValType, Global>,
    height: usize,
    unreachable: bool,
}

impl Frame {
    fn label_types(&self) -> &[ValType] {
        if self.kind == FrameKind::Loop {
            &self.start_types
        } else {
            &self.end_types
        }
    }
}

struct State {
    vals: RawVec<Operand, Global>,
    ctrls: RawVec<Frame, Global>,
}

impl State {
    fn new() -> Self {
        Self {
            vals: RawVec::new_in(Global),
            ctrls: RawVec::new_in(Global),
        }
    }

    fn push_val(&mut self, ty: Operand) {
        self.vals.push(ty);
    }

    fn push_vals(&mut self, types: &[ValType]) {
        for &ty in types {
            self.push_val(ty.into());
        }
    }

    fn pop_val(&mut self) -> Result<Operand, Error> {
        let frame = self.ctrls.last().expect("control stack never empty");
        if self.vals.len() == frame.height {
            if frame.unreachable {
                return Ok(Operand::Unknown);
            }
            return Err(Error::StackUnderflow);
        }
        Ok(self.vals.pop().expect("checked non-empty above"))
    }

    fn pop_expect(&mut self, expected: ValType) -> Result<Operand, Error> {
        let actual = self.pop_val()?;
        match actual {
            Operand::Unknown => Ok(Operand::Val(expected)),
            Operand::Val(ty) if ty == expected => Ok(actual),
            Operand::Val(ty) => Err(Error::TypeMismatch {
                expected: Some(expected),
                actual: Some(ty),
            }),
        }
    }

    fn pop_vals(&mut self, expected: &[ValType]) -> Result<(), Error> {
        for &ty in expected.iter().rev() {
            self.pop_expect(ty)?;
        }
        Ok(())
    }

    fn push_ctrl(&mut self, kind: FrameKind, start_types: &[ValType], end_types: &[ValType]) {
        let mut starts = RawVec::new_in(Global);
        starts.extend_from_slice(start_types);
        let mut ends = RawVec::new_in(Global);
        ends.extend_from_slice(end_types);
        let height = self.vals.len();
        self.push_vals(start_types);
        self.ctrls.push(Frame {
            kind,
            start_types: starts,
            end_types: ends,
            height,
            unreachable: false,
        });
    }

    fn pop_ctrl(&mut self) -> Result<Frame, Error> {
        let frame = self.ctrls.last().ok_or(Error::StackUnderflow)?;
        let end_types: RawVec<ValType, Global> = {
            let mut v = RawVec::new_in(Global);
            v.extend_from_slice(&frame.end_types);
            v
        };
        self.pop_vals(&end_types)?;
        let frame = self.ctrls.last().expect("checked above");
        if self.vals.len() != frame.height {
            return Err(Error::StackUnderflow);
        }
        Ok(self.ctrls.pop().expect("checked above"))
    }

    fn set_unreachable(&mut self) {
        let frame = self.ctrls.last_mut().expect("control stack never empty");
        self.vals.truncate(frame.height);
        frame.unreachable = true;
    }

    fn label_types_at(&self, depth: u32) -> Result<RawVec<ValType, Global>, Error> {
        let idx = self
            .ctrls
            .len()
            .checked_sub(1 + depth as usize)
            .ok_or(LabelIdx::new(depth))
            .map_err(Error::UnknownLabel)?;
        let mut v = RawVec::new_in(Global);
        v.extend_from_slice(self.ctrls[idx].label_types());
        Ok(v)
    }
}

// Reads natively-aligned values out of the flat instruction buffer produced
// by `decode::expr::transcode_expression`. The buffer's backing allocation is
// always 8-byte aligned (see `AlignedAllocator`), so any value written at its
// own natural alignment can be read back with an aligned pointer cast.
struct Cursor<'e> {
    bytes: &'e [u8],
    pos: usize,
}

impl<'e> Cursor<'e> {
    fn new(bytes: &'e [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn read<T: Copy>(&mut self) -> T {
        let aligned = self.pos.next_multiple_of(align_of::<T>());
        debug_assert!(aligned + size_of::<T>() <= self.bytes.len());
        // Safety: `aligned` is within bounds (checked above) and is a
        // multiple of `align_of::<T>()` relative to an 8-byte-aligned base,
        // and every value read here was written at this exact offset by a
        // pointer write of the same type in `decode::expr`.
        let value = unsafe { self.bytes.as_ptr().add(aligned).cast::<T>().read() };
        self.pos = aligned + size_of::<T>();
        value
    }

    fn read_vec<T: Copy>(&mut self) -> RawVec<T, Global> {
        let len: u32 = self.read();
        let mut vec = RawVec::new_in(Global);
        for _ in 0..len {
            vec.push(self.read());
        }
        vec
    }
}

// `access_size` is always a power of two (1, 2, 4, or 8), so its log2 is its
// trailing zero count.
fn check_alignment(memarg: MemArg, access_size: u32) -> Result<(), Error> {
    let max = access_size.trailing_zeros();
    if memarg.align > max {
        return Err(Error::InvalidAlignment {
            opcode_alignment: memarg.align,
            max,
        });
    }
    Ok(())
}

pub(crate) fn validate_expression<A: Allocator>(
    validator: &mut Validator<A>,
    expr: &Expression<A>,
    context: ExpressionValidationContext<A>,
) -> Result<(), Error> {
    let bytes: &[u8] = &**expr;
    let mut cursor = Cursor::new(bytes);
    let mut state = State::new();

    let (start_types, end_types, locals, is_constant): (
        RawVec<ValType, Global>,
        RawVec<ValType, Global>,
        &[Local],
        bool,
    ) = match context {
        ExpressionValidationContext::Function(func_type, locals) => {
            let mut starts = RawVec::new_in(Global);
            starts.extend_from_slice(&func_type.parameters);
            let mut ends = RawVec::new_in(Global);
            ends.extend_from_slice(&func_type.results);
            (starts, ends, locals, false)
        }
        ExpressionValidationContext::Constant(ty) => {
            let ends = {
                let mut v = RawVec::new_in(Global);
                v.push(ty);
                v
            };
            (RawVec::new_in(Global), ends, &[], true)
        }
    };
    state.push_ctrl(FrameKind::Func, &start_types, &end_types);

    // Local index `i` resolves to a function parameter for `i <
    // start_types.len()`, and otherwise to the function's own declared
    // locals.
    let local_type = |idx: u32| -> Option<ValType> {
        let idx = idx as usize;
        if idx < start_types.len() {
            Some(start_types[idx])
        } else {
            locals.get(idx - start_types.len()).map(Local::val_type)
        }
    };

    while !cursor.is_empty() {
        let op: Opcode = cursor.read();

        if is_constant {
            match op {
                Opcode::I32Const
                | Opcode::I64Const
                | Opcode::F32Const
                | Opcode::F64Const
                | Opcode::GlobalGet
                | Opcode::End => {}
                _ => return Err(Error::NonConstantInitializer),
            }
        }

        match op {
            Opcode::Unreachable => state.set_unreachable(),
            Opcode::Nop => {}

            Opcode::Block | Opcode::Loop | Opcode::If => {
                let bt: BlockType = cursor.read();
                let (ins, outs) = block_signature(validator, bt);
                let kind = match op {
                    Opcode::Block => FrameKind::Block,
                    Opcode::Loop => FrameKind::Loop,
                    _ => {
                        state.pop_expect(ValType::I32)?;
                        FrameKind::If
                    }
                };
                state.pop_vals(&ins)?;
                state.push_ctrl(kind, &ins, &outs);
            }
            Opcode::Else => {
                let frame = state.pop_ctrl()?;
                if frame.kind != FrameKind::If {
                    return Err(Error::StackUnderflow);
                }
                let starts: RawVec<ValType, Global> = {
                    let mut v = RawVec::new_in(Global);
                    v.extend_from_slice(&frame.start_types);
                    v
                };
                let ends: RawVec<ValType, Global> = {
                    let mut v = RawVec::new_in(Global);
                    v.extend_from_slice(&frame.end_types);
                    v
                };
                state.push_ctrl(FrameKind::Else, &starts, &ends);
            }
            Opcode::End => {
                let frame = state.pop_ctrl()?;
                let ends: RawVec<ValType, Global> = {
                    let mut v = RawVec::new_in(Global);
                    v.extend_from_slice(&frame.end_types);
                    v
                };
                state.push_vals(&ends);
            }

            Opcode::Br => {
                let depth: u32 = cursor.read();
                let types = state.label_types_at(depth)?;
                state.pop_vals(&types)?;
                state.set_unreachable();
            }
            Opcode::BrIf => {
                let depth: u32 = cursor.read();
                state.pop_expect(ValType::I32)?;
                let types = state.label_types_at(depth)?;
                state.pop_vals(&types)?;
                state.push_vals(&types);
            }
            Opcode::BrTable => {
                let labels = cursor.read_vec::<LabelIdx>();
                let default: LabelIdx = cursor.read();
                state.pop_expect(ValType::I32)?;
                let default_types = state.label_types_at(*default)?;
                let arity = default_types.len();
                for &label in &labels {
                    let types = state.label_types_at(*label)?;
                    if types.len() != arity {
                        return Err(Error::TypeMismatch {
                            expected: default_types.last().copied(),
                            actual: types.last().copied(),
                        });
                    }
                    state.pop_vals(&types)?;
                    state.push_vals(&types);
                }
                state.pop_vals(&default_types)?;
                state.set_unreachable();
            }
            Opcode::Return => {
                let types = state.label_types_at(state.ctrls.len() as u32 - 1)?;
                state.pop_vals(&types)?;
                state.set_unreachable();
            }
            Opcode::Call => {
                let funcidx_raw: u32 = cursor.read();
                let funcidx = FuncIdx::new(funcidx_raw);
                validator.validate(&funcidx)?;
                let func_type = validator.function_signature(funcidx);
                let params: RawVec<ValType, Global> = {
                    let mut v = RawVec::new_in(Global);
                    v.extend_from_slice(&func_type.parameters);
                    v
                };
                let results: RawVec<ValType, Global> = {
                    let mut v = RawVec::new_in(Global);
                    v.extend_from_slice(&func_type.results);
                    v
                };
                state.pop_vals(&params)?;
                state.push_vals(&results);
            }
            Opcode::CallIndirect => {
                let operands: CallIndirectOperands = cursor.read();
                validator.validate(&operands.table)?;
                validator.validate(&operands.ty)?;
                state.pop_expect(ValType::I32)?;
                let func_type = validator.function_type(operands.ty);
                let params: RawVec<ValType, Global> = {
                    let mut v = RawVec::new_in(Global);
                    v.extend_from_slice(&func_type.parameters);
                    v
                };
                let results: RawVec<ValType, Global> = {
                    let mut v = RawVec::new_in(Global);
                    v.extend_from_slice(&func_type.results);
                    v
                };
                state.pop_vals(&params)?;
                state.push_vals(&results);
            }

            Opcode::Drop => {
                state.pop_val()?;
            }
            Opcode::Select => {
                state.pop_expect(ValType::I32)?;
                let t1 = state.pop_val()?;
                let t2 = match t1 {
                    Operand::Val(ty) => state.pop_expect(ty)?,
                    Operand::Unknown => state.pop_val()?,
                };
                state.push_val(t2);
            }

            Opcode::LocalGet => {
                let idx: u32 = cursor.read();
                let ty = local_type(idx).ok_or_else(|| Error::UnknownLocal(LocalIdx::new(idx)))?;
                state.push_val(ty.into());
            }
            Opcode::LocalSet => {
                let idx: u32 = cursor.read();
                let ty = local_type(idx).ok_or_else(|| Error::UnknownLocal(LocalIdx::new(idx)))?;
                state.pop_expect(ty)?;
            }
            Opcode::LocalTee => {
                let idx: u32 = cursor.read();
                let ty = local_type(idx).ok_or_else(|| Error::UnknownLocal(LocalIdx::new(idx)))?;
                let val = state.pop_expect(ty)?;
                state.push_val(val);
            }
            Opcode::GlobalGet => {
                let idx: u32 = cursor.read();
                let gidx = GlobalIdx::new(idx);
                validator.validate(&gidx)?;
                if is_constant && (*gidx as usize) >= validator.imported_global_count() {
                    return Err(Error::NonConstantInitializer);
                }
                let global = validator.global_type(gidx);
                if is_constant && global.mutability == GlobalTypeMutability::Var {
                    return Err(Error::NonConstantInitializer);
                }
                state.push_val(global.value.into());
            }
            Opcode::GlobalSet => {
                let idx: u32 = cursor.read();
                let gidx = GlobalIdx::new(idx);
                validator.validate(&gidx)?;
                let global = validator.global_type(gidx);
                if global.mutability != GlobalTypeMutability::Var {
                    return Err(Error::ImmutableGlobalWrite(gidx));
                }
                state.pop_expect(global.value)?;
            }

            Opcode::I32Load => load(&mut cursor, &mut state, ValType::I32, 4, validator)?,
            Opcode::I64Load => load(&mut cursor, &mut state, ValType::I64, 8, validator)?,
            Opcode::F32Load => load(&mut cursor, &mut state, ValType::F32, 4, validator)?,
            Opcode::F64Load => load(&mut cursor, &mut state, ValType::F64, 8, validator)?,
            Opcode::I32Load8S | Opcode::I32Load8U => {
                load(&mut cursor, &mut state, ValType::I32, 1, validator)?;
            }
            Opcode::I32Load16S | Opcode::I32Load16U => {
                load(&mut cursor, &mut state, ValType::I32, 2, validator)?;
            }
            Opcode::I64Load8S | Opcode::I64Load8U => {
                load(&mut cursor, &mut state, ValType::I64, 1, validator)?;
            }
            Opcode::I64Load16S | Opcode::I64Load16U => {
                load(&mut cursor, &mut state, ValType::I64, 2, validator)?;
            }
            Opcode::I64Load32S | Opcode::I64Load32U => {
                load(&mut cursor, &mut state, ValType::I64, 4, validator)?;
            }
            Opcode::I32Store => store(&mut cursor, &mut state, ValType::I32, 4, validator)?,
            Opcode::I64Store => store(&mut cursor, &mut state, ValType::I64, 8, validator)?,
            Opcode::F32Store => store(&mut cursor, &mut state, ValType::F32, 4, validator)?,
            Opcode::F64Store => store(&mut cursor, &mut state, ValType::F64, 8, validator)?,
            Opcode::I32Store8 => store(&mut cursor, &mut state, ValType::I32, 1, validator)?,
            Opcode::I32Store16 => store(&mut cursor, &mut state, ValType::I32, 2, validator)?,
            Opcode::I64Store8 => store(&mut cursor, &mut state, ValType::I64, 1, validator)?,
            Opcode::I64Store16 => store(&mut cursor, &mut state, ValType::I64, 2, validator)?,
            Opcode::I64Store32 => store(&mut cursor, &mut state, ValType::I64, 4, validator)?,
            Opcode::MemorySize => {
                require_memory(validator)?;
                state.push_val(ValType::I32.into());
            }
            Opcode::MemoryGrow => {
                require_memory(validator)?;
                state.pop_expect(ValType::I32)?;
                state.push_val(ValType::I32.into());
            }

            Opcode::I32Const => {
                let _: i32 = cursor.read();
                state.push_val(ValType::I32.into());
            }
            Opcode::I64Const => {
                let _: i64 = cursor.read();
                state.push_val(ValType::I64.into());
            }
            Opcode::F32Const => {
                let _: f32 = cursor.read();
                state.push_val(ValType::F32.into());
            }
            Opcode::F64Const => {
                let _: f64 = cursor.read();
                state.push_val(ValType::F64.into());
            }

            Opcode::I32Eqz => testop(&mut state, ValType::I32)?,
            Opcode::I64Eqz => testop(&mut state, ValType::I64)?,

            Opcode::I32Eq
            | Opcode::I32Ne
            | Opcode::I32LtS
            | Opcode::I32LtU
            | Opcode::I32GtS
            | Opcode::I32GtU
            | Opcode::I32LeS
            | Opcode::I32LeU
            | Opcode::I32GeS
            | Opcode::I32GeU => relop(&mut state, ValType::I32)?,
            Opcode::I64Eq
            | Opcode::I64Ne
            | Opcode::I64LtS
            | Opcode::I64LtU
            | Opcode::I64GtS
            | Opcode::I64GtU
            | Opcode::I64LeS
            | Opcode::I64LeU
            | Opcode::I64GeS
            | Opcode::I64GeU => relop(&mut state, ValType::I64)?,
            Opcode::F32Eq
            | Opcode::F32Ne
            | Opcode::F32Lt
            | Opcode::F32Gt
            | Opcode::F32Le
            | Opcode::F32Ge => relop(&mut state, ValType::F32)?,
            Opcode::F64Eq
            | Opcode::F64Ne
            | Opcode::F64Lt
            | Opcode::F64Gt
            | Opcode::F64Le
            | Opcode::F64Ge => relop(&mut state, ValType::F64)?,

            Opcode::I32Clz | Opcode::I32Ctz | Opcode::I32Popcnt => unop(&mut state, ValType::I32)?,
            Opcode::I64Clz | Opcode::I64Ctz | Opcode::I64Popcnt => unop(&mut state, ValType::I64)?,

            Opcode::I32Add
            | Opcode::I32Sub
            | Opcode::I32Mul
            | Opcode::I32DivS
            | Opcode::I32DivU
            | Opcode::I32RemS
            | Opcode::I32RemU
            | Opcode::I32And
            | Opcode::I32Or
            | Opcode::I32Xor
            | Opcode::I32Shl
            | Opcode::I32ShrS
            | Opcode::I32ShrU
            | Opcode::I32Rotl
            | Opcode::I32Rotr => binop(&mut state, ValType::I32)?,
            Opcode::I64Add
            | Opcode::I64Sub
            | Opcode::I64Mul
            | Opcode::I64DivS
            | Opcode::I64DivU
            | Opcode::I64RemS
            | Opcode::I64RemU
            | Opcode::I64And
            | Opcode::I64Or
            | Opcode::I64Xor
            | Opcode::I64Shl
            | Opcode::I64ShrS
            | Opcode::I64ShrU
            | Opcode::I64Rotl
            | Opcode::I64Rotr => binop(&mut state, ValType::I64)?,

            Opcode::F32Abs
            | Opcode::F32Neg
            | Opcode::F32Ceil
            | Opcode::F32Floor
            | Opcode::F32Trunc
            | Opcode::F32Nearest
            | Opcode::F32Sqrt => unop(&mut state, ValType::F32)?,
            Opcode::F64Abs
            | Opcode::F64Neg
            | Opcode::F64Ceil
            | Opcode::F64Floor
            | Opcode::F64Trunc
            | Opcode::F64Nearest
            | Opcode::F64Sqrt => unop(&mut state, ValType::F64)?,
            Opcode::F32Add
            | Opcode::F32Sub
            | Opcode::F32Mul
            | Opcode::F32Div
            | Opcode::F32Min
            | Opcode::F32Max
            | Opcode::F32Copysign => binop(&mut state, ValType::F32)?,
            Opcode::F64Add
            | Opcode::F64Sub
            | Opcode::F64Mul
            | Opcode::F64Div
            | Opcode::F64Min
            | Opcode::F64Max
            | Opcode::F64Copysign => binop(&mut state, ValType::F64)?,

            Opcode::I32WrapI64 => cvtop(&mut state, ValType::I64, ValType::I32)?,
            Opcode::I32TruncF32S | Opcode::I32TruncF32U => {
                cvtop(&mut state, ValType::F32, ValType::I32)?;
            }
            Opcode::I32TruncF64S | Opcode::I32TruncF64U => {
                cvtop(&mut state, ValType::F64, ValType::I32)?;
            }
            Opcode::I64ExtendI32S | Opcode::I64ExtendI32U => {
                cvtop(&mut state, ValType::I32, ValType::I64)?;
            }
            Opcode::I64TruncF32S | Opcode::I64TruncF32U => {
                cvtop(&mut state, ValType::F32, ValType::I64)?;
            }
            Opcode::I64TruncF64S | Opcode::I64TruncF64U => {
                cvtop(&mut state, ValType::F64, ValType::I64)?;
            }
            Opcode::F32ConvertI32S | Opcode::F32ConvertI32U => {
                cvtop(&mut state, ValType::I32, ValType::F32)?;
            }
            Opcode::F32ConvertI64S | Opcode::F32ConvertI64U => {
                cvtop(&mut state, ValType::I64, ValType::F32)?;
            }
            Opcode::F32DemoteF64 => cvtop(&mut state, ValType::F64, ValType::F32)?,
            Opcode::F64ConvertI32S | Opcode::F64ConvertI32U => {
                cvtop(&mut state, ValType::I32, ValType::F64)?;
            }
            Opcode::F64ConvertI64S | Opcode::F64ConvertI64U => {
                cvtop(&mut state, ValType::I64, ValType::F64)?;
            }
            Opcode::F64PromoteF32 => cvtop(&mut state, ValType::F32, ValType::F64)?,
            Opcode::I32ReinterpretF32 => cvtop(&mut state, ValType::F32, ValType::I32)?,
            Opcode::I64ReinterpretF64 => cvtop(&mut state, ValType::F64, ValType::I64)?,
            Opcode::F32ReinterpretI32 => cvtop(&mut state, ValType::I32, ValType::F32)?,
            Opcode::F64ReinterpretI64 => cvtop(&mut state, ValType::I64, ValType::F64)?,
            Opcode::I32Extend8S | Opcode::I32Extend16S => unop(&mut state, ValType::I32)?,
            Opcode::I64Extend8S | Opcode::I64Extend16S | Opcode::I64Extend32S => {
                unop(&mut state, ValType::I64)?;
            }

            Opcode::BulkPrefix => {
                let bulk_op: BulkOpcode = cursor.read();
                let (from, to) = match bulk_op {
                    BulkOpcode::I32TruncSatF32S | BulkOpcode::I32TruncSatF32U => {
                        (ValType::F32, ValType::I32)
                    }
                    BulkOpcode::I32TruncSatF64S | BulkOpcode::I32TruncSatF64U => {
                        (ValType::F64, ValType::I32)
                    }
                    BulkOpcode::I64TruncSatF32S | BulkOpcode::I64TruncSatF32U => {
                        (ValType::F32, ValType::I64)
                    }
                    BulkOpcode::I64TruncSatF64S | BulkOpcode::I64TruncSatF64U => {
                        (ValType::F64, ValType::I64)
                    }
                };
                cvtop(&mut state, from, to)?;
            }
        }
    }

    Ok(())
}

fn block_signature<A: Allocator>(
    validator: &Validator<A>,
    bt: BlockType,
) -> (RawVec<ValType, Global>, RawVec<ValType, Global>) {
    match bt {
        BlockType::Empty => (RawVec::new_in(Global), RawVec::new_in(Global)),
        BlockType::Result(ty) => {
            let mut outs = RawVec::new_in(Global);
            outs.push(ty);
            (RawVec::new_in(Global), outs)
        }
        BlockType::TypeIndex(idx) => {
            let func_type = validator.function_type(idx);
            let mut ins = RawVec::new_in(Global);
            ins.extend_from_slice(&func_type.parameters);
            let mut outs = RawVec::new_in(Global);
            outs.extend_from_slice(&func_type.results);
            (ins, outs)
        }
    }
}

fn require_memory<A: Allocator>(validator: &Validator<A>) -> Result<(), Error> {
    if validator.memory_count() == 0 {
        return Err(Error::IndexOutOfBounds {
            id: SectionId::Memory,
            index: 0,
            capacity: 0,
        });
    }
    Ok(())
}

fn load<A: Allocator>(
    cursor: &mut Cursor,
    state: &mut State,
    ty: ValType,
    access_size: u32,
    validator: &Validator<A>,
) -> Result<(), Error> {
    require_memory(validator)?;
    let memarg: MemArg = cursor.read();
    check_alignment(memarg, access_size)?;
    state.pop_expect(ValType::I32)?;
    state.push_val(ty.into());
    Ok(())
}

fn store<A: Allocator>(
    cursor: &mut Cursor,
    state: &mut State,
    ty: ValType,
    access_size: u32,
    validator: &Validator<A>,
) -> Result<(), Error> {
    require_memory(validator)?;
    let memarg: MemArg = cursor.read();
    check_alignment(memarg, access_size)?;
    state.pop_expect(ty)?;
    state.pop_expect(ValType::I32)?;
    Ok(())
}

fn testop(state: &mut State, ty: ValType) -> Result<(), Error> {
    state.pop_expect(ty)?;
    state.push_val(ValType::I32.into());
    Ok(())
}

fn relop(state: &mut State, ty: ValType) -> Result<(), Error> {
    state.pop_expect(ty)?;
    state.pop_expect(ty)?;
    state.push_val(ValType::I32.into());
    Ok(())
}

fn unop(state: &mut State, ty: ValType) -> Result<(), Error> {
    state.pop_expect(ty)?;
    state.push_val(ty.into());
    Ok(())
}

fn binop(state: &mut State, ty: ValType) -> Result<(), Error> {
    state.pop_expect(ty)?;
    state.pop_expect(ty)?;
    state.push_val(ty.into());
    Ok(())
}

fn cvtop(state: &mut State, from: ValType, to: ValType) -> Result<(), Error> {
    state.pop_expect(from)?;
    state.push_val(to.into());
    Ok(())
}
