// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! The store: runtime values, instances, and the address-indexed arenas that
//! back a running program.
//!
//! Addresses are dense integers handed out sequentially from each sort's
//! arena, mirroring the binary module's own index spaces but spanning every
//! module a [`crate::link::Builder`] has instantiated into one [`Store`].

pub mod memory;

use crate::core_compat::alloc::Global;
use crate::core_compat::vec::Vec as RawVec;
use crate::types::{FunctionType, GlobalType, GlobalTypeMutability, TableType, ValType};
use crate::{Allocator, Module};

pub use memory::Memory;

/// A runtime value: the tagged union every operand-stack slot, local
/// variable, global, and host-call argument/result is an instance of.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Value {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
}

impl Value {
    /// The value's type.
    pub fn ty(&self) -> ValType {
        match self {
            Value::I32(_) => ValType::I32,
            Value::I64(_) => ValType::I64,
            Value::F32(_) => ValType::F32,
            Value::F64(_) => ValType::F64,
        }
    }

    /// The zero value of the given type, used to default-initialize
    /// function locals and imported/empty globals.
    pub fn zero(ty: ValType) -> Self {
        match ty {
            ValType::I32 => Value::I32(0),
            ValType::I64 => Value::I64(0),
            ValType::F32 => Value::F32(0.0),
            ValType::F64 => Value::F64(0.0),
        }
    }

    pub(crate) fn as_i32(self) -> Option<i32> {
        match self {
            Value::I32(v) => Some(v),
            _ => None,
        }
    }

    pub(crate) fn as_i64(self) -> Option<i64> {
        match self {
            Value::I64(v) => Some(v),
            _ => None,
        }
    }
}

/// A value that happens to be typed as `i32`, used where the call sites know
/// the type statically (addresses, indices, conditions).
impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::I32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::I64(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::F32(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::F64(v)
    }
}

// Generates a `newtype`-ish arena address with a `new`/`index` pair, mirroring
// the module-index-space types in `crate::types` but scoped to the runtime
// store instead of a single module.
macro_rules! address {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, Eq, PartialEq)]
        pub struct $name(usize);

        impl $name {
            pub(crate) fn new(index: usize) -> Self {
                Self(index)
            }

            pub(crate) fn index(self) -> usize {
                self.0
            }
        }
    };
}

address!(
    /// Address of a function instance in the store.
    FuncAddr
);
address!(
    /// Address of a table instance in the store.
    TableAddr
);
address!(
    /// Address of a memory instance in the store.
    MemAddr
);
address!(
    /// Address of a global instance in the store.
    GlobalAddr
);

/// Runtime traps: the taxonomy of conditions that abort the current
/// invocation without corrupting the store.
#[derive(Clone, Debug)]
pub enum Trap {
    Unreachable,
    IntegerDivideByZero,
    IntegerOverflow,
    InvalidConversionToInteger,
    MemoryOutOfBounds,
    IndirectCallTypeMismatch,
    UndefinedElement,
    CallStackExhausted,
    Uninitialized,
    OutOfMemory,
    /// A host function call returned an application-level error.
    HostError(&'static str),
}

/// A global variable instance: a current value plus its mutability, carried
/// separately from [`GlobalType`] since the type's own mutability flag is
/// only consulted at link/validate time.
#[derive(Clone, Copy, Debug)]
pub struct GlobalInstance {
    pub(crate) value: Value,
    pub(crate) mutability: GlobalTypeMutability,
}

impl GlobalInstance {
    pub(crate) fn new(ty: GlobalType, value: Value) -> Self {
        Self {
            value,
            mutability: ty.mutability,
        }
    }

    /// The global's current value.
    pub fn get(&self) -> Value {
        self.value
    }

    /// Sets the global's value; callers are responsible for having checked
    /// mutability and type at the call site (the interpreter does so via
    /// validation having already run, the embedding API via
    /// [`crate::link::Error::ImmutableGlobal`]).
    pub(crate) fn set(&mut self, value: Value) {
        self.value = value;
    }
}

/// A table instance: a growable array of optional function addresses (this
/// engine predates reference types, so `funcref` is the only element type).
pub struct TableInstance<A: Allocator> {
    elements: RawVec<Option<FuncAddr>, A>,
    max: Option<u32>,
}

impl<A: Allocator> TableInstance<A> {
    pub(crate) fn new(ty: TableType, alloc: A) -> Self {
        let mut elements = RawVec::new_in(alloc);
        elements.resize(ty.min_elements() as usize, None);
        Self {
            elements,
            max: ty.max_elements(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.elements.len()
    }

    pub(crate) fn get(&self, index: usize) -> Option<FuncAddr> {
        self.elements.get(index).copied().flatten()
    }

    /// Writes `funcs` starting at `offset`; fails without mutating anything
    /// if the write would run past the end of the table.
    pub(crate) fn init_segment(&mut self, offset: usize, funcs: &[FuncAddr]) -> Result<(), Trap> {
        let end = offset.checked_add(funcs.len()).ok_or(Trap::UndefinedElement)?;
        if end > self.elements.len() {
            return Err(Trap::UndefinedElement);
        }
        for (slot, &addr) in self.elements[offset..end].iter_mut().zip(funcs) {
            *slot = Some(addr);
        }
        Ok(())
    }

    #[allow(dead_code)]
    pub(crate) fn max(&self) -> Option<u32> {
        self.max
    }

    /// Resolves a `call_indirect` table slot, distinguishing an out-of-range
    /// index from an in-range but never-initialized one.
    pub(crate) fn get_checked(&self, index: usize) -> Result<FuncAddr, Trap> {
        self.elements
            .get(index)
            .ok_or(Trap::UndefinedElement)?
            .ok_or(Trap::Uninitialized)
    }
}

/// Host-provided execution context exposed to a [`HostFunction`] body: the
/// calling module instance's memory 0, if it declared or imported one.
pub struct HostContext<'store, A: Allocator> {
    memory: Option<&'store mut Memory<A>>,
}

impl<'store, A: Allocator> HostContext<'store, A> {
    pub(crate) fn new(memory: Option<&'store mut Memory<A>>) -> Self {
        Self { memory }
    }

    /// The instance's linear memory, if it has one.
    pub fn memory(&mut self) -> Option<&mut Memory<A>> {
        self.memory.as_deref_mut()
    }
}

/// A host-provided callable registered with a [`crate::link::Builder`].
///
/// Host bodies are plain function pointers rather than capturing closures:
/// boxing a `dyn Fn` behind a non-default allocator needs an unsizing coercion
/// that the stable-Rust `allocator-api2` polyfill cannot provide (only
/// nightly's `core::alloc::Allocator` supports it), and this crate has to
/// build on both. Stateful host functions thread their state through the
/// module instance's own memory or globals instead, via [`HostContext`].
pub struct HostFunction<A: Allocator> {
    pub(crate) ty: FunctionType<Global>,
    body: fn(&[Value], &mut HostContext<'_, A>) -> Result<RawVec<Value, Global>, Trap>,
}

impl<A: Allocator> HostFunction<A> {
    /// Registers a host function of the given signature with a body that
    /// receives the popped arguments (in call order) and returns its
    /// results (in push order).
    pub fn new(
        ty: FunctionType<Global>,
        body: fn(&[Value], &mut HostContext<'_, A>) -> Result<RawVec<Value, Global>, Trap>,
    ) -> Self {
        Self { ty, body }
    }

    pub(crate) fn call(
        &self,
        args: &[Value],
        ctx: &mut HostContext<'_, A>,
    ) -> Result<RawVec<Value, Global>, Trap> {
        (self.body)(args, ctx)
    }

    // Extracts the body as a bare, `Copy` function pointer, so a caller can
    // drop its borrow of the owning `Store` before constructing the
    // `HostContext` (which may need its own mutable borrow of the store).
    pub(crate) fn body_fn(
        &self,
    ) -> fn(&[Value], &mut HostContext<'_, A>) -> Result<RawVec<Value, Global>, Trap> {
        self.body
    }
}

/// A function instance: either a module-defined function (identified by
/// which module instance owns it and its index into that module's code
/// section) or a host function.
pub enum FunctionInstance<A: Allocator> {
    Wasm {
        module_instance: usize,
        func_idx: usize,
    },
    Host(HostFunction<A>),
}

/// An instantiated module: the decoded [`Module`] plus its per-sort address
/// tables (imports first, then module-defined items, matching the module's
/// own index space).
pub struct ModuleInstance<A: Allocator> {
    pub(crate) module: Module<A>,
    pub(crate) func_addrs: RawVec<FuncAddr, A>,
    pub(crate) table_addrs: RawVec<TableAddr, A>,
    pub(crate) mem_addrs: RawVec<MemAddr, A>,
    pub(crate) global_addrs: RawVec<GlobalAddr, A>,
}

/// The store: the single owner of every instantiated function, table,
/// memory, global, and module that a [`crate::link::Program`] runs against.
pub struct Store<A: Allocator> {
    alloc: A,
    pub(crate) functions: RawVec<FunctionInstance<A>, A>,
    pub(crate) tables: RawVec<TableInstance<A>, A>,
    pub(crate) memories: RawVec<Memory<A>, A>,
    pub(crate) globals: RawVec<GlobalInstance, A>,
    pub(crate) modules: RawVec<ModuleInstance<A>, A>,
}

impl<A: Allocator> Store<A> {
    pub(crate) fn new(alloc: A) -> Self {
        Self {
            functions: RawVec::new_in(alloc.clone()),
            tables: RawVec::new_in(alloc.clone()),
            memories: RawVec::new_in(alloc.clone()),
            globals: RawVec::new_in(alloc.clone()),
            modules: RawVec::new_in(alloc.clone()),
            alloc,
        }
    }

    pub(crate) fn allocator(&self) -> A {
        self.alloc.clone()
    }

    pub(crate) fn push_function(&mut self, instance: FunctionInstance<A>) -> FuncAddr {
        let addr = FuncAddr::new(self.functions.len());
        self.functions.push(instance);
        addr
    }

    pub(crate) fn push_table(&mut self, instance: TableInstance<A>) -> TableAddr {
        let addr = TableAddr::new(self.tables.len());
        self.tables.push(instance);
        addr
    }

    pub(crate) fn push_memory(&mut self, instance: Memory<A>) -> MemAddr {
        let addr = MemAddr::new(self.memories.len());
        self.memories.push(instance);
        addr
    }

    pub(crate) fn push_global(&mut self, instance: GlobalInstance) -> GlobalAddr {
        let addr = GlobalAddr::new(self.globals.len());
        self.globals.push(instance);
        addr
    }

    pub(crate) fn function(&self, addr: FuncAddr) -> &FunctionInstance<A> {
        &self.functions[addr.index()]
    }

    pub(crate) fn global(&self, addr: GlobalAddr) -> &GlobalInstance {
        &self.globals[addr.index()]
    }

    pub(crate) fn global_mut(&mut self, addr: GlobalAddr) -> &mut GlobalInstance {
        &mut self.globals[addr.index()]
    }

    pub(crate) fn memory(&self, addr: MemAddr) -> &Memory<A> {
        &self.memories[addr.index()]
    }

    pub(crate) fn memory_mut(&mut self, addr: MemAddr) -> &mut Memory<A> {
        &mut self.memories[addr.index()]
    }

    pub(crate) fn table(&self, addr: TableAddr) -> &TableInstance<A> {
        &self.tables[addr.index()]
    }

    pub(crate) fn table_mut(&mut self, addr: TableAddr) -> &mut TableInstance<A> {
        &mut self.tables[addr.index()]
    }

    pub(crate) fn module_instance(&self, idx: usize) -> &ModuleInstance<A> {
        &self.modules[idx]
    }
}

/// Structural equality between two function signatures, ignoring which
/// allocator each happens to be backed by; used by `call_indirect` to check
/// a table slot's actual type against the instruction's declared type.
pub(crate) fn function_types_equal<A1: Allocator, A2: Allocator>(
    a: &FunctionType<A1>,
    b: &FunctionType<A2>,
) -> bool {
    a.parameters.as_slice() == b.parameters.as_slice()
        && a.results.as_ref().as_slice() == b.results.as_ref().as_slice()
}
