// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! The stack-machine interpreter: executes a validated [`crate::types::Expression`]
//! directly against its natively-aligned byte buffer, without re-walking LEB128.
//!
//! The operand stack, control-frame stack, and locals array are all transient,
//! per-invocation scratch space allocated from [`Global`], mirroring how
//! `crate::validate::expr` keeps its own type-checking stacks off the module's
//! allocator. Calls recurse through the host language's own call stack (one
//! Rust stack frame per WebAssembly activation), bounded by [`MAX_CALL_DEPTH`]
//! so a runaway recursive module traps instead of overflowing the host stack.

mod numeric;

use core::ops::Deref as _;

use crate::core_compat::alloc::Global;
use crate::core_compat::vec::Vec as RawVec;
use crate::runtime::{
    FuncAddr, FunctionInstance, GlobalAddr, HostContext, Store, TableAddr, Trap, Value,
    function_types_equal,
};
use crate::types::{
    BlockType, BulkOpcode, CallIndirectOperands, Expression, FunctionType, MemArg, Opcode, ValType,
};
use crate::Allocator;

/// Bounds call recursion so a module that calls itself without ever
/// terminating traps cleanly instead of exhausting the host's own stack.
const MAX_CALL_DEPTH: u32 = 1024;

#[derive(Clone, Copy, Eq, PartialEq)]
enum FrameKind {
    Block,
    Loop,
    If,
    Func,
}

#[derive(Clone, Copy)]
struct Frame {
    kind: FrameKind,
    branch_arity: usize,
    height: usize,
    end_pc: usize,
    loop_start_pc: usize,
}

// Reads natively-aligned values out of the flat instruction buffer, identical
// in layout assumptions to `validate::expr::Cursor` (same 8-byte-aligned
// backing allocation, same per-type natural-alignment reads).
struct Cursor<'e> {
    bytes: &'e [u8],
    pos: usize,
}

impl<'e> Cursor<'e> {
    fn new(bytes: &'e [u8], pos: usize) -> Self {
        Self { bytes, pos }
    }

    fn read<T: Copy>(&mut self) -> T {
        let aligned = self.pos.next_multiple_of(align_of::<T>());
        debug_assert!(aligned + size_of::<T>() <= self.bytes.len());
        // Safety: identical justification to `validate::expr::Cursor::read`.
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

// Scans forward from just past a `Block`/`Loop`/`If`'s `BlockType` operand,
// skipping every nested instruction's operands (without interpreting them) to
// find the position right after the frame's matching `End`, and, for an `If`,
// the position right after a top-level `Else` if one is present.
fn scan_block(bytes: &[u8], start: usize) -> (usize, Option<usize>) {
    let mut cursor = Cursor::new(bytes, start);
    let mut depth = 0u32;
    let mut else_pc = None;
    loop {
        let op: Opcode = cursor.read();
        match op {
            Opcode::Block | Opcode::Loop | Opcode::If => {
                let _: BlockType = cursor.read();
                depth += 1;
            }
            Opcode::Else => {
                if depth == 0 {
                    else_pc = Some(cursor.pos);
                }
            }
            Opcode::End => {
                if depth == 0 {
                    return (cursor.pos, else_pc);
                }
                depth -= 1;
            }
            Opcode::Br
            | Opcode::BrIf
            | Opcode::Call
            | Opcode::GlobalGet
            | Opcode::GlobalSet
            | Opcode::LocalGet
            | Opcode::LocalSet
            | Opcode::LocalTee => {
                let _: u32 = cursor.read();
            }
            Opcode::BrTable => {
                let _ = cursor.read_vec::<crate::types::LabelIdx>();
                let _: crate::types::LabelIdx = cursor.read();
            }
            Opcode::CallIndirect => {
                let _: CallIndirectOperands = cursor.read();
            }
            Opcode::BulkPrefix => {
                let _: BulkOpcode = cursor.read();
            }
            Opcode::I32Const => {
                let _: i32 = cursor.read();
            }
            Opcode::I64Const => {
                let _: i64 = cursor.read();
            }
            Opcode::F32Const => {
                let _: f32 = cursor.read();
            }
            Opcode::F64Const => {
                let _: f64 = cursor.read();
            }
            Opcode::F32Load
            | Opcode::F32Store
            | Opcode::F64Load
            | Opcode::F64Store
            | Opcode::I32Load
            | Opcode::I32Load8S
            | Opcode::I32Load8U
            | Opcode::I32Load16S
            | Opcode::I32Load16U
            | Opcode::I32Store
            | Opcode::I32Store8
            | Opcode::I32Store16
            | Opcode::I64Load
            | Opcode::I64Load8S
            | Opcode::I64Load8U
            | Opcode::I64Load16S
            | Opcode::I64Load16U
            | Opcode::I64Load32S
            | Opcode::I64Load32U
            | Opcode::I64Store
            | Opcode::I64Store8
            | Opcode::I64Store16
            | Opcode::I64Store32 => {
                let _: MemArg = cursor.read();
            }
            _ => {}
        }
    }
}

fn block_arity<A: Allocator>(
    store: &Store<A>,
    module_instance: usize,
    bt: BlockType,
) -> (usize, usize) {
    match bt {
        BlockType::Empty => (0, 0),
        BlockType::Result(_) => (0, 1),
        BlockType::TypeIndex(idx) => {
            let inst = store.module_instance(module_instance);
            let ft = &inst.module.typesec[*idx as usize];
            (ft.parameters.len(), ft.results.as_ref().len())
        }
    }
}

fn pop(operands: &mut RawVec<Value, Global>) -> Value {
    operands.pop().expect("validated")
}

fn pop_i32(operands: &mut RawVec<Value, Global>) -> i32 {
    match pop(operands) {
        Value::I32(v) => v,
        _ => unreachable!("validated"),
    }
}

// Executes a `br`/`br_if`/`br_table` jump to the label `k` frames up from the
// top of the control stack: truncates the operand stack down to the target's
// recorded height (preserving exactly `branch_arity` values), pops every
// frame through the target, and re-enters the target if it's a loop.
// Returns `true` when the branch targets the function's own implicit frame
// (depth == frames.len() - 1), which empties `frames` entirely and is
// equivalent to `return`: the caller must stop executing and return the
// operand stack's top `arity` values rather than keep walking `pc`.
fn do_branch(
    k: u32,
    operands: &mut RawVec<Value, Global>,
    frames: &mut RawVec<Frame, Global>,
    pc: &mut usize,
) -> bool {
    let target_idx = frames.len() - 1 - k as usize;
    let target = frames[target_idx];
    let arity = target.branch_arity;
    let new_len = operands.len() - arity;
    if new_len != target.height {
        for i in 0..arity {
            operands[target.height + i] = operands[new_len + i];
        }
    }
    operands.truncate(target.height + arity);
    frames.truncate(target_idx);
    if target.kind == FrameKind::Loop {
        frames.push(target);
        *pc = target.loop_start_pc;
        false
    } else if target_idx == 0 {
        true
    } else {
        *pc = target.end_pc;
        false
    }
}

fn function_arity<A: Allocator>(store: &Store<A>, addr: FuncAddr) -> (usize, usize) {
    match store.function(addr) {
        FunctionInstance::Host(h) => (h.ty.parameters.len(), h.ty.results.as_ref().len()),
        FunctionInstance::Wasm {
            module_instance,
            func_idx,
        } => {
            let inst = store.module_instance(*module_instance);
            let type_idx = inst.module.funcsec[*func_idx];
            let ft = &inst.module.typesec[*type_idx as usize];
            (ft.parameters.len(), ft.results.as_ref().len())
        }
    }
}

/// Returns a function's declared signature, cloned into `alloc`; used by the
/// linker to record export types independently of whichever allocator the
/// owning module happens to be backed by.
pub(crate) fn function_signature<A: Allocator, OutAlloc: Allocator>(
    store: &Store<A>,
    addr: FuncAddr,
    alloc: OutAlloc,
) -> FunctionType<OutAlloc> {
    match store.function(addr) {
        FunctionInstance::Host(h) => clone_function_type_across(&h.ty, alloc),
        FunctionInstance::Wasm {
            module_instance,
            func_idx,
        } => {
            let inst = store.module_instance(*module_instance);
            let type_idx = inst.module.funcsec[*func_idx];
            let ft = &inst.module.typesec[*type_idx as usize];
            clone_function_type_across(ft, alloc)
        }
    }
}

fn check_indirect_call_type<A: Allocator>(
    store: &Store<A>,
    addr: FuncAddr,
    declared: &FunctionType<A>,
) -> Result<(), Trap> {
    let matches = match store.function(addr) {
        FunctionInstance::Host(h) => function_types_equal(&h.ty, declared),
        FunctionInstance::Wasm {
            module_instance,
            func_idx,
        } => {
            let inst = store.module_instance(*module_instance);
            let type_idx = inst.module.funcsec[*func_idx];
            let actual = &inst.module.typesec[*type_idx as usize];
            function_types_equal(actual, declared)
        }
    };
    if matches {
        Ok(())
    } else {
        Err(Trap::IndirectCallTypeMismatch)
    }
}

/// Invokes a store-resident function with the embedder (or host call) as the
/// caller, i.e. with no enclosing module instance.
pub(crate) fn invoke<A: Allocator>(
    store: &mut Store<A>,
    addr: FuncAddr,
    args: &[Value],
) -> Result<RawVec<Value, Global>, Trap> {
    dispatch_call(store, addr, args, None, 0)
}

fn dispatch_call<A: Allocator>(
    store: &mut Store<A>,
    addr: FuncAddr,
    args: &[Value],
    caller_module: Option<usize>,
    depth: u32,
) -> Result<RawVec<Value, Global>, Trap> {
    if depth >= MAX_CALL_DEPTH {
        return Err(Trap::CallStackExhausted);
    }

    let wasm_target = match store.function(addr) {
        FunctionInstance::Wasm {
            module_instance,
            func_idx,
        } => Some((*module_instance, *func_idx)),
        FunctionInstance::Host(_) => None,
    };
    if let Some((module_instance, func_idx)) = wasm_target {
        return run_wasm_function(store, module_instance, func_idx, args, depth);
    }

    let body = match store.function(addr) {
        FunctionInstance::Host(h) => h.body_fn(),
        FunctionInstance::Wasm { .. } => unreachable!("handled above"),
    };
    let mem_addr = caller_module
        .and_then(|mi| store.module_instance(mi).mem_addrs.first().copied());
    let mem = mem_addr.map(|a| store.memory_mut(a));
    let mut ctx = HostContext::new(mem);
    body(args, &mut ctx)
}

fn run_wasm_function<A: Allocator>(
    store: &mut Store<A>,
    module_instance: usize,
    func_idx: usize,
    args: &[Value],
    depth: u32,
) -> Result<RawVec<Value, Global>, Trap> {
    let (result_count, local_types, code_len) = {
        let inst = store.module_instance(module_instance);
        let type_idx = inst.module.funcsec[func_idx];
        let func_type = &inst.module.typesec[*type_idx as usize];
        let function = &inst.module.codesec[func_idx];
        let locals: &[crate::types::Local] = function.locals.deref();
        let mut local_types: RawVec<ValType, Global> = RawVec::new_in(Global);
        for local in locals {
            local_types.push(local.val_type());
        }
        (
            func_type.results.as_ref().len(),
            local_types,
            function.code.as_ref().len(),
        )
    };

    let mut locals: RawVec<Value, Global> = RawVec::new_in(Global);
    locals.extend_from_slice(args);
    for ty in &local_types {
        locals.push(Value::zero(*ty));
    }

    let mut operands: RawVec<Value, Global> = RawVec::new_in(Global);
    let mut frames: RawVec<Frame, Global> = RawVec::new_in(Global);
    frames.push(Frame {
        kind: FrameKind::Func,
        branch_arity: result_count,
        height: 0,
        end_pc: code_len,
        loop_start_pc: 0,
    });

    let mut pc = 0usize;
    run_loop(
        store,
        module_instance,
        func_idx,
        &mut pc,
        &mut locals,
        &mut operands,
        &mut frames,
        depth,
    )
}

#[allow(clippy::too_many_arguments)]
fn run_loop<A: Allocator>(
    store: &mut Store<A>,
    module_instance: usize,
    func_idx: usize,
    pc: &mut usize,
    locals: &mut RawVec<Value, Global>,
    operands: &mut RawVec<Value, Global>,
    frames: &mut RawVec<Frame, Global>,
    depth: u32,
) -> Result<RawVec<Value, Global>, Trap> {
    loop {
        // Each iteration re-borrows the module's code immutably just long
        // enough to decode one instruction, so the borrow never overlaps
        // with the `&mut Store` needed by memory/global/call side effects.
        enum Decoded {
            Simple(Opcode),
            BlockLike(Opcode, BlockType, usize),
            Br(u32),
            BrIf(u32),
            BrTable(RawVec<crate::types::LabelIdx, Global>, crate::types::LabelIdx),
            Idx(Opcode, u32),
            CallIndirect(CallIndirectOperands),
            MemAccess(Opcode, MemArg),
            I32Const(i32),
            I64Const(i64),
            F32Const(f32),
            F64Const(f64),
            Bulk(BulkOpcode),
        }

        let decoded = {
            let inst = store.module_instance(module_instance);
            let bytes: &[u8] = inst.module.codesec[func_idx].code.as_ref();
            let mut cursor = Cursor::new(bytes, *pc);
            let op: Opcode = cursor.read();
            let decoded = match op {
                Opcode::Block | Opcode::Loop | Opcode::If => {
                    let bt: BlockType = cursor.read();
                    Decoded::BlockLike(op, bt, cursor.pos)
                }
                Opcode::Br => Decoded::Br(cursor.read()),
                Opcode::BrIf => Decoded::BrIf(cursor.read()),
                Opcode::BrTable => {
                    let labels = cursor.read_vec::<crate::types::LabelIdx>();
                    let default = cursor.read();
                    Decoded::BrTable(labels, default)
                }
                Opcode::Call
                | Opcode::GlobalGet
                | Opcode::GlobalSet
                | Opcode::LocalGet
                | Opcode::LocalSet
                | Opcode::LocalTee => Decoded::Idx(op, cursor.read()),
                Opcode::CallIndirect => Decoded::CallIndirect(cursor.read()),
                Opcode::I32Load
                | Opcode::I64Load
                | Opcode::F32Load
                | Opcode::F64Load
                | Opcode::I32Load8S
                | Opcode::I32Load8U
                | Opcode::I32Load16S
                | Opcode::I32Load16U
                | Opcode::I64Load8S
                | Opcode::I64Load8U
                | Opcode::I64Load16S
                | Opcode::I64Load16U
                | Opcode::I64Load32S
                | Opcode::I64Load32U
                | Opcode::I32Store
                | Opcode::I64Store
                | Opcode::F32Store
                | Opcode::F64Store
                | Opcode::I32Store8
                | Opcode::I32Store16
                | Opcode::I64Store8
                | Opcode::I64Store16
                | Opcode::I64Store32 => Decoded::MemAccess(op, cursor.read()),
                Opcode::I32Const => Decoded::I32Const(cursor.read()),
                Opcode::I64Const => Decoded::I64Const(cursor.read()),
                Opcode::F32Const => Decoded::F32Const(cursor.read()),
                Opcode::F64Const => Decoded::F64Const(cursor.read()),
                Opcode::BulkPrefix => Decoded::Bulk(cursor.read()),
                _ => Decoded::Simple(op),
            };
            *pc = cursor.pos;
            decoded
        };

        match decoded {
            Decoded::Simple(Opcode::Unreachable) => return Err(Trap::Unreachable),
            Decoded::Simple(Opcode::Nop) => {}

            Decoded::BlockLike(op, bt, after_blocktype) => {
                let (ins, outs) = block_arity(store, module_instance, bt);
                match op {
                    Opcode::Block | Opcode::Loop => {
                        let height = operands.len() - ins;
                        let (end_pc, _) = {
                            let inst = store.module_instance(module_instance);
                            let bytes: &[u8] = inst.module.codesec[func_idx].code.as_ref();
                            scan_block(bytes, after_blocktype)
                        };
                        let branch_arity = if op == Opcode::Loop { ins } else { outs };
                        frames.push(Frame {
                            kind: if op == Opcode::Loop {
                                FrameKind::Loop
                            } else {
                                FrameKind::Block
                            },
                            branch_arity,
                            height,
                            end_pc,
                            loop_start_pc: after_blocktype,
                        });
                    }
                    Opcode::If => {
                        let cond = pop_i32(operands);
                        let height = operands.len() - ins;
                        let (end_pc, else_pc) = {
                            let inst = store.module_instance(module_instance);
                            let bytes: &[u8] = inst.module.codesec[func_idx].code.as_ref();
                            scan_block(bytes, after_blocktype)
                        };
                        if cond != 0 {
                            frames.push(Frame {
                                kind: FrameKind::If,
                                branch_arity: outs,
                                height,
                                end_pc,
                                loop_start_pc: 0,
                            });
                        } else if let Some(else_pc) = else_pc {
                            frames.push(Frame {
                                kind: FrameKind::If,
                                branch_arity: outs,
                                height,
                                end_pc,
                                loop_start_pc: 0,
                            });
                            *pc = else_pc;
                        } else {
                            *pc = end_pc;
                        }
                    }
                    _ => unreachable!(),
                }
            }

            Decoded::Simple(Opcode::Else) => {
                let frame = frames.pop().expect("validated");
                *pc = frame.end_pc;
            }
            Decoded::Simple(Opcode::End) => {
                frames.pop().expect("validated");
                if frames.is_empty() {
                    break;
                }
            }

            Decoded::Br(k) => {
                if do_branch(k, operands, frames, pc) {
                    return Ok(operands.clone());
                }
            }
            Decoded::BrIf(k) => {
                if pop_i32(operands) != 0 && do_branch(k, operands, frames, pc) {
                    return Ok(operands.clone());
                }
            }
            Decoded::BrTable(labels, default) => {
                let idx = pop_i32(operands) as u32;
                let k = if (idx as usize) < labels.len() {
                    *labels[idx as usize]
                } else {
                    *default
                };
                if do_branch(k, operands, frames, pc) {
                    return Ok(operands.clone());
                }
            }
            Decoded::Simple(Opcode::Return) => {
                let func_frame = frames[0];
                let start = operands.len() - func_frame.branch_arity;
                let mut results = RawVec::new_in(Global);
                results.extend_from_slice(&operands[start..]);
                return Ok(results);
            }

            Decoded::Idx(Opcode::Call, idx) => {
                let addr = store.module_instance(module_instance).func_addrs[idx as usize];
                let (param_count, _) = function_arity(store, addr);
                let start = operands.len() - param_count;
                let mut args = RawVec::new_in(Global);
                args.extend_from_slice(&operands[start..]);
                operands.truncate(start);
                let results = dispatch_call(store, addr, &args, Some(module_instance), depth + 1)?;
                operands.extend_from_slice(&results);
            }
            Decoded::CallIndirect(operands_read) => {
                let table_idx = operands_read.table;
                let type_idx = operands_read.ty;
                let elem_idx = pop_i32(operands) as u32;
                let table_addr: TableAddr =
                    store.module_instance(module_instance).table_addrs[*table_idx as usize];
                let func_addr = store.table(table_addr).get_checked(elem_idx as usize)?;
                let declared = {
                    let alloc = store.allocator();
                    let inst = store.module_instance(module_instance);
                    // Clone the declared signature so the borrow of `inst`
                    // doesn't overlap the mutable `dispatch_call` below.
                    let ft = &inst.module.typesec[*type_idx as usize];
                    clone_function_type(ft, alloc)
                };
                check_indirect_call_type(store, func_addr, &declared)?;
                let param_count = declared.parameters.len();
                let start = operands.len() - param_count;
                let mut args = RawVec::new_in(Global);
                args.extend_from_slice(&operands[start..]);
                operands.truncate(start);
                let results =
                    dispatch_call(store, func_addr, &args, Some(module_instance), depth + 1)?;
                operands.extend_from_slice(&results);
            }

            Decoded::Simple(Opcode::Drop) => {
                operands.pop().expect("validated");
            }
            Decoded::Simple(Opcode::Select) => {
                let cond = pop_i32(operands);
                let b = pop(operands);
                let a = pop(operands);
                operands.push(if cond != 0 { a } else { b });
            }

            Decoded::Idx(Opcode::LocalGet, idx) => operands.push(locals[idx as usize]),
            Decoded::Idx(Opcode::LocalSet, idx) => locals[idx as usize] = pop(operands),
            Decoded::Idx(Opcode::LocalTee, idx) => {
                locals[idx as usize] = *operands.last().expect("validated");
            }
            Decoded::Idx(Opcode::GlobalGet, idx) => {
                let addr: GlobalAddr =
                    store.module_instance(module_instance).global_addrs[idx as usize];
                operands.push(store.global(addr).get());
            }
            Decoded::Idx(Opcode::GlobalSet, idx) => {
                let addr: GlobalAddr =
                    store.module_instance(module_instance).global_addrs[idx as usize];
                let v = pop(operands);
                store.global_mut(addr).set(v);
            }
            Decoded::Idx(..) => unreachable!("exhausted above"),

            Decoded::MemAccess(op, memarg) => {
                exec_memory_op(store, module_instance, op, memarg, operands)?;
            }
            Decoded::Simple(Opcode::MemorySize) => {
                let mem_addr = store.module_instance(module_instance).mem_addrs[0];
                operands.push(Value::I32(store.memory(mem_addr).size() as i32));
            }
            Decoded::Simple(Opcode::MemoryGrow) => {
                let mem_addr = store.module_instance(module_instance).mem_addrs[0];
                let delta = pop_i32(operands) as u32;
                let result = store.memory_mut(mem_addr).grow(delta);
                operands.push(Value::I32(result.map_or(-1, |p| p as i32)));
            }

            Decoded::I32Const(v) => operands.push(Value::I32(v)),
            Decoded::I64Const(v) => operands.push(Value::I64(v)),
            Decoded::F32Const(v) => operands.push(Value::F32(v)),
            Decoded::F64Const(v) => operands.push(Value::F64(v)),

            Decoded::Simple(Opcode::I32Eqz | Opcode::I64Eqz) => {
                let v = pop(operands);
                operands.push(numeric::eqz(v));
            }
            Decoded::Simple(
                op @ (Opcode::I32Eq
                | Opcode::I32Ne
                | Opcode::I32LtS
                | Opcode::I32LtU
                | Opcode::I32GtS
                | Opcode::I32GtU
                | Opcode::I32LeS
                | Opcode::I32LeU
                | Opcode::I32GeS
                | Opcode::I32GeU
                | Opcode::I64Eq
                | Opcode::I64Ne
                | Opcode::I64LtS
                | Opcode::I64LtU
                | Opcode::I64GtS
                | Opcode::I64GtU
                | Opcode::I64LeS
                | Opcode::I64LeU
                | Opcode::I64GeS
                | Opcode::I64GeU
                | Opcode::F32Eq
                | Opcode::F32Ne
                | Opcode::F32Lt
                | Opcode::F32Gt
                | Opcode::F32Le
                | Opcode::F32Ge
                | Opcode::F64Eq
                | Opcode::F64Ne
                | Opcode::F64Lt
                | Opcode::F64Gt
                | Opcode::F64Le
                | Opcode::F64Ge),
            ) => {
                let b = pop(operands);
                let a = pop(operands);
                operands.push(numeric::relop(op, a, b));
            }
            Decoded::Simple(
                op @ (Opcode::I32Clz
                | Opcode::I32Ctz
                | Opcode::I32Popcnt
                | Opcode::I64Clz
                | Opcode::I64Ctz
                | Opcode::I64Popcnt
                | Opcode::F32Abs
                | Opcode::F32Neg
                | Opcode::F32Ceil
                | Opcode::F32Floor
                | Opcode::F32Trunc
                | Opcode::F32Nearest
                | Opcode::F32Sqrt
                | Opcode::F64Abs
                | Opcode::F64Neg
                | Opcode::F64Ceil
                | Opcode::F64Floor
                | Opcode::F64Trunc
                | Opcode::F64Nearest
                | Opcode::F64Sqrt
                | Opcode::I32Extend8S
                | Opcode::I32Extend16S
                | Opcode::I64Extend8S
                | Opcode::I64Extend16S
                | Opcode::I64Extend32S),
            ) => {
                let v = pop(operands);
                operands.push(numeric::unop(op, v)?);
            }
            Decoded::Simple(
                op @ (Opcode::I32Add
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
                | Opcode::I32Rotr
                | Opcode::I64Add
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
                | Opcode::I64Rotr
                | Opcode::F32Add
                | Opcode::F32Sub
                | Opcode::F32Mul
                | Opcode::F32Div
                | Opcode::F32Min
                | Opcode::F32Max
                | Opcode::F32Copysign
                | Opcode::F64Add
                | Opcode::F64Sub
                | Opcode::F64Mul
                | Opcode::F64Div
                | Opcode::F64Min
                | Opcode::F64Max
                | Opcode::F64Copysign),
            ) => {
                let b = pop(operands);
                let a = pop(operands);
                operands.push(numeric::binop(op, a, b)?);
            }
            Decoded::Simple(
                op @ (Opcode::I32WrapI64
                | Opcode::I32TruncF32S
                | Opcode::I32TruncF32U
                | Opcode::I32TruncF64S
                | Opcode::I32TruncF64U
                | Opcode::I64ExtendI32S
                | Opcode::I64ExtendI32U
                | Opcode::I64TruncF32S
                | Opcode::I64TruncF32U
                | Opcode::I64TruncF64S
                | Opcode::I64TruncF64U
                | Opcode::F32ConvertI32S
                | Opcode::F32ConvertI32U
                | Opcode::F32ConvertI64S
                | Opcode::F32ConvertI64U
                | Opcode::F32DemoteF64
                | Opcode::F64ConvertI32S
                | Opcode::F64ConvertI32U
                | Opcode::F64ConvertI64S
                | Opcode::F64ConvertI64U
                | Opcode::F64PromoteF32
                | Opcode::I32ReinterpretF32
                | Opcode::I64ReinterpretF64
                | Opcode::F32ReinterpretI32
                | Opcode::F64ReinterpretI64),
            ) => {
                let v = pop(operands);
                operands.push(numeric::cvtop(op, v)?);
            }

            Decoded::Bulk(bulk_op) => {
                let v = pop(operands);
                operands.push(numeric::trunc_sat(bulk_op, v));
            }

            Decoded::Simple(_) => unreachable!("exhausted above"),
        }
    }

    let func_frame = frames[0];
    let start = operands.len() - func_frame.branch_arity;
    let mut results = RawVec::new_in(Global);
    results.extend_from_slice(&operands[start..]);
    Ok(results)
}

fn exec_memory_op<A: Allocator>(
    store: &mut Store<A>,
    module_instance: usize,
    op: Opcode,
    memarg: MemArg,
    operands: &mut RawVec<Value, Global>,
) -> Result<(), Trap> {
    let mem_addr = store.module_instance(module_instance).mem_addrs[0];
    match op {
        Opcode::I32Load => {
            let addr = pop_i32(operands) as u32;
            let bytes = store.memory(mem_addr).load::<4>(addr, memarg.offset)?;
            operands.push(Value::I32(i32::from_le_bytes(bytes)));
        }
        Opcode::I64Load => {
            let addr = pop_i32(operands) as u32;
            let bytes = store.memory(mem_addr).load::<8>(addr, memarg.offset)?;
            operands.push(Value::I64(i64::from_le_bytes(bytes)));
        }
        Opcode::F32Load => {
            let addr = pop_i32(operands) as u32;
            let bytes = store.memory(mem_addr).load::<4>(addr, memarg.offset)?;
            operands.push(Value::F32(f32::from_le_bytes(bytes)));
        }
        Opcode::F64Load => {
            let addr = pop_i32(operands) as u32;
            let bytes = store.memory(mem_addr).load::<8>(addr, memarg.offset)?;
            operands.push(Value::F64(f64::from_le_bytes(bytes)));
        }
        Opcode::I32Load8S => {
            let addr = pop_i32(operands) as u32;
            let bytes = store.memory(mem_addr).load::<1>(addr, memarg.offset)?;
            operands.push(Value::I32(i32::from(bytes[0] as i8)));
        }
        Opcode::I32Load8U => {
            let addr = pop_i32(operands) as u32;
            let bytes = store.memory(mem_addr).load::<1>(addr, memarg.offset)?;
            operands.push(Value::I32(i32::from(bytes[0])));
        }
        Opcode::I32Load16S => {
            let addr = pop_i32(operands) as u32;
            let bytes = store.memory(mem_addr).load::<2>(addr, memarg.offset)?;
            operands.push(Value::I32(i32::from(i16::from_le_bytes(bytes))));
        }
        Opcode::I32Load16U => {
            let addr = pop_i32(operands) as u32;
            let bytes = store.memory(mem_addr).load::<2>(addr, memarg.offset)?;
            operands.push(Value::I32(i32::from(u16::from_le_bytes(bytes))));
        }
        Opcode::I64Load8S => {
            let addr = pop_i32(operands) as u32;
            let bytes = store.memory(mem_addr).load::<1>(addr, memarg.offset)?;
            operands.push(Value::I64(i64::from(bytes[0] as i8)));
        }
        Opcode::I64Load8U => {
            let addr = pop_i32(operands) as u32;
            let bytes = store.memory(mem_addr).load::<1>(addr, memarg.offset)?;
            operands.push(Value::I64(i64::from(bytes[0])));
        }
        Opcode::I64Load16S => {
            let addr = pop_i32(operands) as u32;
            let bytes = store.memory(mem_addr).load::<2>(addr, memarg.offset)?;
            operands.push(Value::I64(i64::from(i16::from_le_bytes(bytes))));
        }
        Opcode::I64Load16U => {
            let addr = pop_i32(operands) as u32;
            let bytes = store.memory(mem_addr).load::<2>(addr, memarg.offset)?;
            operands.push(Value::I64(i64::from(u16::from_le_bytes(bytes))));
        }
        Opcode::I64Load32S => {
            let addr = pop_i32(operands) as u32;
            let bytes = store.memory(mem_addr).load::<4>(addr, memarg.offset)?;
            operands.push(Value::I64(i64::from(i32::from_le_bytes(bytes))));
        }
        Opcode::I64Load32U => {
            let addr = pop_i32(operands) as u32;
            let bytes = store.memory(mem_addr).load::<4>(addr, memarg.offset)?;
            operands.push(Value::I64(i64::from(u32::from_le_bytes(bytes))));
        }
        Opcode::I32Store => {
            let v = match pop(operands) {
                Value::I32(v) => v,
                _ => unreachable!("validated"),
            };
            let addr = pop_i32(operands) as u32;
            store
                .memory_mut(mem_addr)
                .store(addr, memarg.offset, &v.to_le_bytes())?;
        }
        Opcode::I64Store => {
            let v = match pop(operands) {
                Value::I64(v) => v,
                _ => unreachable!("validated"),
            };
            let addr = pop_i32(operands) as u32;
            store
                .memory_mut(mem_addr)
                .store(addr, memarg.offset, &v.to_le_bytes())?;
        }
        Opcode::F32Store => {
            let v = match pop(operands) {
                Value::F32(v) => v,
                _ => unreachable!("validated"),
            };
            let addr = pop_i32(operands) as u32;
            store
                .memory_mut(mem_addr)
                .store(addr, memarg.offset, &v.to_le_bytes())?;
        }
        Opcode::F64Store => {
            let v = match pop(operands) {
                Value::F64(v) => v,
                _ => unreachable!("validated"),
            };
            let addr = pop_i32(operands) as u32;
            store
                .memory_mut(mem_addr)
                .store(addr, memarg.offset, &v.to_le_bytes())?;
        }
        Opcode::I32Store8 => {
            let v = match pop(operands) {
                Value::I32(v) => v,
                _ => unreachable!("validated"),
            };
            let addr = pop_i32(operands) as u32;
            store
                .memory_mut(mem_addr)
                .store(addr, memarg.offset, &v.to_le_bytes()[..1])?;
        }
        Opcode::I32Store16 => {
            let v = match pop(operands) {
                Value::I32(v) => v,
                _ => unreachable!("validated"),
            };
            let addr = pop_i32(operands) as u32;
            store
                .memory_mut(mem_addr)
                .store(addr, memarg.offset, &v.to_le_bytes()[..2])?;
        }
        Opcode::I64Store8 => {
            let v = match pop(operands) {
                Value::I64(v) => v,
                _ => unreachable!("validated"),
            };
            let addr = pop_i32(operands) as u32;
            store
                .memory_mut(mem_addr)
                .store(addr, memarg.offset, &v.to_le_bytes()[..1])?;
        }
        Opcode::I64Store16 => {
            let v = match pop(operands) {
                Value::I64(v) => v,
                _ => unreachable!("validated"),
            };
            let addr = pop_i32(operands) as u32;
            store
                .memory_mut(mem_addr)
                .store(addr, memarg.offset, &v.to_le_bytes()[..2])?;
        }
        Opcode::I64Store32 => {
            let v = match pop(operands) {
                Value::I64(v) => v,
                _ => unreachable!("validated"),
            };
            let addr = pop_i32(operands) as u32;
            store
                .memory_mut(mem_addr)
                .store(addr, memarg.offset, &v.to_le_bytes()[..4])?;
        }
        _ => unreachable!("exhausted above"),
    }
    Ok(())
}

fn clone_function_type<A: Allocator>(ft: &FunctionType<A>, alloc: A) -> FunctionType<A> {
    clone_function_type_across::<A, A>(ft, alloc)
}

// Deep-copies a function signature into a possibly different allocator than
// the one it's currently backed by; `ValType` is `Copy`, so this is just a
// pair of element-wise copies regardless of which allocator either side uses.
fn clone_function_type_across<SrcAlloc: Allocator, OutAlloc: Allocator>(
    ft: &FunctionType<SrcAlloc>,
    alloc: OutAlloc,
) -> FunctionType<OutAlloc> {
    let mut parameters = RawVec::new_in(alloc.clone());
    parameters.extend_from_slice(&ft.parameters);
    let mut results = RawVec::new_in(alloc);
    results.extend_from_slice(ft.results.as_ref());
    FunctionType {
        parameters,
        results: crate::types::ResultType::new(results),
    }
}

/// Evaluates a constant initializer expression (the restricted
/// `i32.const`/`i64.const`/`f32.const`/`f64.const`/`global.get` subset
/// enforced by validation), used to compute global initial values and
/// element/data segment offsets at instantiation time. `imported_global_addrs`
/// is the owning module's own import-only global address prefix, the only
/// globals a constant expression may read.
pub(crate) fn eval_const<A: Allocator>(
    store: &Store<A>,
    imported_global_addrs: &[GlobalAddr],
    expr: &Expression<A>,
) -> Value {
    let bytes: &[u8] = expr.as_ref();
    let mut cursor = Cursor::new(bytes, 0);
    let mut value = None;
    loop {
        let op: Opcode = cursor.read();
        match op {
            Opcode::I32Const => value = Some(Value::I32(cursor.read())),
            Opcode::I64Const => value = Some(Value::I64(cursor.read())),
            Opcode::F32Const => value = Some(Value::F32(cursor.read())),
            Opcode::F64Const => value = Some(Value::F64(cursor.read())),
            Opcode::GlobalGet => {
                let idx: u32 = cursor.read();
                let addr = imported_global_addrs[idx as usize];
                value = Some(store.global(addr).get());
            }
            Opcode::End => break,
            _ => unreachable!("validated constant expression"),
        }
    }
    value.expect("validated constant expression produces exactly one value")
}
