// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! The linker: turns a set of registered modules and host bindings into a
//! running [`Program`].
//!
//! [`Builder`] collects binary or text module sources, host functions, and
//! optional host tables/memories/globals, then [`Builder::build`] parses and
//! validates every module, orders them by their inter-module imports,
//! resolves each import against the host bindings first and then against
//! already-instantiated modules, and allocates everything into a single
//! [`Store`]. Element and data segments are applied, and any declared start
//! function is invoked, before the resulting [`Program`] is handed back.

use crate::core_compat::alloc::Global;
use crate::core_compat::boxed::Box;
use crate::core_compat::vec::Vec as RawVec;
use crate::decode::{self, ContextStack, NoCustomSectionVisitor};
use crate::interp;
use crate::runtime::{
    FuncAddr, FunctionInstance, GlobalAddr, GlobalInstance, HostFunction, MemAddr, Memory,
    ModuleInstance, Store, TableAddr, TableInstance, Trap, Value, function_types_equal,
};
use crate::storage::Buffer;
use crate::types::{
    Export, ExportDescriptor, FunctionType, GlobalType, GlobalTypeMutability, Import,
    ImportDescriptor, Limits, MemType, Name, TableType, ValType,
};
use crate::{Allocator, Module};

/// A bounded, owned copy of a name used only to attach context to an
/// [`Error`]; bounded so that attaching it doesn't itself need a fallible
/// allocation on the error path.
#[derive(Clone, Copy)]
pub struct ErrorName {
    bytes: [u8; 64],
    len: u8,
}

impl ErrorName {
    fn new(s: &str) -> Self {
        let len = s.len().min(64);
        let mut bytes = [0u8; 64];
        bytes[..len].copy_from_slice(&s.as_bytes()[..len]);
        Self {
            bytes,
            len: len as u8,
        }
    }

    /// The name's text, truncated to 64 bytes if the original was longer.
    pub fn as_str(&self) -> &str {
        core::str::from_utf8(&self.bytes[..self.len as usize]).unwrap_or("")
    }
}

impl core::fmt::Debug for ErrorName {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:?}", self.as_str())
    }
}

/// Errors arising while building or using a [`Program`].
#[derive(Debug)]
pub enum Error {
    /// A registered module's bytes failed to parse, either as a binary or a
    /// text module.
    ParseError,
    /// A registered module parsed but failed static validation.
    ValidationError,
    /// Two registered modules share the same name.
    DuplicateModuleName(ErrorName),
    /// The registered modules' imports form a cycle.
    CyclicImports,
    /// No host binding or already-built module exports the requested import.
    ImportNotFound {
        importer: ErrorName,
        namespace: ErrorName,
        field: ErrorName,
    },
    /// An import was found but its kind, signature, or limits don't match.
    ImportMismatch {
        importer: ErrorName,
        provider: ErrorName,
    },
    /// An element or data segment would write past the end of its table or
    /// memory.
    SegmentOutOfRange,
    /// A start function (or a module-defined table/memory allocation)
    /// trapped during instantiation.
    InitializerTrap(Trap),
    /// No export with the requested name exists.
    ExportNotFound,
    /// An export exists but isn't of the requested kind.
    WrongExportKind,
    /// A `set_global` targeted an immutable global.
    ImmutableGlobal,
    /// A call's argument count or types didn't match the function's
    /// declared signature, or a `get_global`/`set_global`'s scalar type
    /// didn't match the global's declared type.
    IllegalArgument,
    /// A function call trapped.
    Trap(Trap),
}

fn name_str<A: Allocator>(name: &Name<A>) -> &str {
    name.as_ref().as_ref()
}

fn name_in<A: Allocator>(s: &str, alloc: A) -> Name<A> {
    let mut bytes = RawVec::new_in(alloc.clone());
    bytes.extend_from_slice(s.as_bytes());
    let ptr = Box::into_raw(bytes.into_boxed_slice());
    // Safety: `ptr`'s bytes were just copied from a valid `&str`, so the data
    // is valid UTF-8 and the `[u8]`/`str` layouts are identical.
    let boxed_str = unsafe { Box::from_raw_in(ptr as *mut str, alloc) };
    Name::new(boxed_str)
}

fn import_not_found<A: Allocator>(
    importer: &Name<A>,
    namespace: &Name<A>,
    field: &Name<A>,
) -> Error {
    let err = Error::ImportNotFound {
        importer: ErrorName::new(name_str(importer)),
        namespace: ErrorName::new(name_str(namespace)),
        field: ErrorName::new(name_str(field)),
    };
    log::warn!("{err:?}");
    err
}

fn import_mismatch<A: Allocator>(importer: &Name<A>, provider: &Name<A>) -> Error {
    let err = Error::ImportMismatch {
        importer: ErrorName::new(name_str(importer)),
        provider: ErrorName::new(name_str(provider)),
    };
    log::warn!("{err:?}");
    err
}

fn segment_out_of_range() -> Error {
    log::warn!("element or data segment out of range");
    Error::SegmentOutOfRange
}

fn limits_compatible(actual: Limits, expected: Limits) -> bool {
    actual.min >= expected.min
        && match expected.max {
            None => true,
            Some(expected_max) => actual.max.is_some_and(|actual_max| actual_max <= expected_max),
        }
}

/// A scalar WebAssembly value type with a native Rust representation, used by
/// [`Program::get_global`]/[`Program::set_global`] to type-check the access
/// against the global's declared type.
pub trait Scalar: Copy {
    #[doc(hidden)]
    const VAL_TYPE: ValType;
    #[doc(hidden)]
    fn into_value(self) -> Value;
    #[doc(hidden)]
    fn from_value(value: Value) -> Option<Self>;
}

macro_rules! impl_scalar {
    ($ty:ty, $variant:ident) => {
        impl Scalar for $ty {
            const VAL_TYPE: ValType = ValType::$variant;

            fn into_value(self) -> Value {
                Value::$variant(self)
            }

            fn from_value(value: Value) -> Option<Self> {
                match value {
                    Value::$variant(v) => Some(v),
                    _ => None,
                }
            }
        }
    };
}
impl_scalar!(i32, I32);
impl_scalar!(i64, I64);
impl_scalar!(f32, F32);
impl_scalar!(f64, F64);

// What a registered module's bytes are still waiting to be parsed from.
enum ModuleSource<A: Allocator> {
    Binary(RawVec<u8, A>),
    Text(RawVec<u8, A>),
}

struct PendingModule<A: Allocator> {
    name: Name<A>,
    source: ModuleSource<A>,
}

struct HostEntry<A: Allocator, T> {
    namespace: Name<A>,
    name: Name<A>,
    value: T,
}

// The resolved kind and address of something another module (or the
// embedder) can import or look up by name. Table/memory/global types carry
// no allocator of their own, but a function's signature is cloned into
// `Global` so that exports don't entangle the store's allocator with the
// builder's bookkeeping.
enum ExportKind {
    Function(FuncAddr, FunctionType<Global>),
    Table(TableAddr, TableType),
    Memory(MemAddr, MemType),
    Global(GlobalAddr, GlobalType),
}

struct ExportEntry<A: Allocator> {
    namespace: Name<A>,
    field: Name<A>,
    kind: ExportKind,
}

fn find_entry<'e, A: Allocator>(
    exports: &'e [ExportEntry<A>],
    namespace: &Name<A>,
    field: &Name<A>,
) -> Option<&'e ExportEntry<A>> {
    exports
        .iter()
        .find(|e| &e.namespace == namespace && &e.field == field)
}

/// Collects module sources and host bindings, then builds them into a
/// running [`Program`].
pub struct Builder<A: Allocator = Global> {
    alloc: A,
    modules: RawVec<PendingModule<A>, A>,
    host_functions: RawVec<HostEntry<A, HostFunction<A>>, A>,
    host_tables: RawVec<HostEntry<A, TableType>, A>,
    host_memories: RawVec<HostEntry<A, MemType>, A>,
    host_globals: RawVec<HostEntry<A, (GlobalType, Value)>, A>,
}

impl<A: Allocator> Builder<A> {
    /// Creates an empty builder backed by `alloc`.
    pub fn with_allocator(alloc: A) -> Self {
        Self {
            alloc: alloc.clone(),
            modules: RawVec::new_in(alloc.clone()),
            host_functions: RawVec::new_in(alloc.clone()),
            host_tables: RawVec::new_in(alloc.clone()),
            host_memories: RawVec::new_in(alloc.clone()),
            host_globals: RawVec::new_in(alloc),
        }
    }

    /// Registers a binary-encoded module under `name`. The bytes are copied.
    pub fn register_binary_module(&mut self, name: &str, bytes: &[u8]) {
        let mut copy = RawVec::new_in(self.alloc.clone());
        copy.extend_from_slice(bytes);
        self.modules.push(PendingModule {
            name: name_in(name, self.alloc.clone()),
            source: ModuleSource::Binary(copy),
        });
    }

    /// Registers a text-format module under `name`. The source is copied.
    pub fn register_text_module(&mut self, name: &str, text: &str) {
        let mut copy = RawVec::new_in(self.alloc.clone());
        copy.extend_from_slice(text.as_bytes());
        self.modules.push(PendingModule {
            name: name_in(name, self.alloc.clone()),
            source: ModuleSource::Text(copy),
        });
    }

    /// Registers a host function importable as `(namespace, name)`.
    pub fn register_host_function(&mut self, namespace: &str, name: &str, function: HostFunction<A>) {
        self.host_functions.push(HostEntry {
            namespace: name_in(namespace, self.alloc.clone()),
            name: name_in(name, self.alloc.clone()),
            value: function,
        });
    }

    /// Registers a host-owned table, empty and sized per `ty`, importable as
    /// `(namespace, name)`.
    pub fn register_host_table(&mut self, namespace: &str, name: &str, ty: TableType) {
        self.host_tables.push(HostEntry {
            namespace: name_in(namespace, self.alloc.clone()),
            name: name_in(name, self.alloc.clone()),
            value: ty,
        });
    }

    /// Registers a host-owned memory, zeroed and sized per `ty`, importable
    /// as `(namespace, name)`.
    pub fn register_host_memory(&mut self, namespace: &str, name: &str, ty: MemType) {
        self.host_memories.push(HostEntry {
            namespace: name_in(namespace, self.alloc.clone()),
            name: name_in(name, self.alloc.clone()),
            value: ty,
        });
    }

    /// Registers a host-owned global with the given initial value,
    /// importable as `(namespace, name)`.
    pub fn register_host_global(&mut self, namespace: &str, name: &str, ty: GlobalType, initial: Value) {
        self.host_globals.push(HostEntry {
            namespace: name_in(namespace, self.alloc.clone()),
            name: name_in(name, self.alloc.clone()),
            value: (ty, initial),
        });
    }

    /// Parses, validates, links, and instantiates every registered module
    /// and host binding into a running [`Program`].
    pub fn build(self) -> Result<Program<A>, Error> {
        let Builder {
            alloc,
            modules: pending,
            host_functions,
            host_tables,
            host_memories,
            host_globals,
        } = self;

        for i in 0..pending.len() {
            for j in (i + 1)..pending.len() {
                if pending[i].name == pending[j].name {
                    let err = Error::DuplicateModuleName(ErrorName::new(name_str(&pending[i].name)));
                    log::warn!("{err:?}");
                    return Err(err);
                }
            }
        }

        let mut parsed: RawVec<Option<(Name<A>, Module<A>)>, A> = RawVec::new_in(alloc.clone());
        for module in pending {
            let decoded = parse_and_validate(module.source, alloc.clone())?;
            parsed.push(Some((module.name, decoded)));
        }

        let order = topological_order(&parsed, alloc.clone())?;

        let mut store = Store::new(alloc.clone());
        let mut exports: RawVec<ExportEntry<A>, A> = RawVec::new_in(alloc.clone());
        seed_host_exports(
            &mut store,
            &mut exports,
            host_functions,
            host_tables,
            host_memories,
            host_globals,
            alloc.clone(),
        )?;

        for module_idx in order {
            let (name, module) = parsed[module_idx]
                .take()
                .expect("each module is instantiated exactly once");
            instantiate_module(&mut store, &mut exports, name, module, alloc.clone())?;
        }

        Ok(Program { store, exports })
    }
}

impl Builder<Global> {
    /// Creates an empty builder backed by the global allocator.
    pub fn new() -> Self {
        Self::with_allocator(Global)
    }
}

impl Default for Builder<Global> {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_and_validate<A: Allocator>(source: ModuleSource<A>, alloc: A) -> Result<Module<A>, Error> {
    let mut module = match source {
        ModuleSource::Binary(bytes) => {
            let stream = Buffer::new(bytes);
            let mut context = ContextStack::default();
            let mut visitor = NoCustomSectionVisitor {};
            decode::decode_module(stream, &mut context, &mut visitor, alloc).map_err(|error| {
                let with_context = decode::ErrorWithContext { error, context };
                log::warn!("module parse failed: {with_context:?}");
                Error::ParseError
            })?
        }
        ModuleSource::Text(text) => {
            let text = core::str::from_utf8(&text).map_err(|_| {
                log::warn!("text module is not valid UTF-8");
                Error::ParseError
            })?;
            crate::text::parse_module(text, alloc).map_err(|error| {
                log::warn!("text module parse failed: {error:?}");
                Error::ParseError
            })?
        }
    };

    crate::validate::prepare_module_for_validation(&mut module);
    crate::validate::validate_module(&module).map_err(|error| {
        log::warn!("module failed validation: {error:?}");
        Error::ValidationError
    })?;
    Ok(module)
}

// Orders registered modules so that every module appears after the other
// registered modules it imports from, failing if that's impossible. Modules
// that don't import from any other registered module (importing only from
// the host, or not at all) can appear in any order relative to one another.
fn topological_order<A: Allocator>(
    parsed: &[Option<(Name<A>, Module<A>)>],
    alloc: A,
) -> Result<RawVec<usize, A>, Error> {
    let n = parsed.len();
    let mut deps: RawVec<RawVec<usize, A>, A> = RawVec::new_in(alloc.clone());
    for entry in parsed {
        let (_, module) = entry.as_ref().expect("not yet taken");
        let mut module_deps: RawVec<usize, A> = RawVec::new_in(alloc.clone());
        for import in module.importsec.iter() {
            if let Some(j) = parsed.iter().position(|other| {
                other
                    .as_ref()
                    .is_some_and(|(name, _)| *name == import.module)
            }) && !module_deps.contains(&j)
            {
                module_deps.push(j);
            }
        }
        deps.push(module_deps);
    }

    #[derive(Clone, Copy, PartialEq)]
    enum State {
        Unvisited,
        Visiting,
        Done,
    }

    let mut state: RawVec<State, A> = RawVec::new_in(alloc.clone());
    for _ in 0..n {
        state.push(State::Unvisited);
    }
    let mut order: RawVec<usize, A> = RawVec::new_in(alloc.clone());

    // Iterative post-order DFS: a stack of (node, index of the next
    // dependency of that node still to visit), so the traversal can't blow
    // the native call stack regardless of how many modules are registered.
    let mut stack: RawVec<(usize, usize), A> = RawVec::new_in(alloc);
    for start in 0..n {
        if state[start] != State::Unvisited {
            continue;
        }
        state[start] = State::Visiting;
        stack.push((start, 0));
        while let Some(&(node, next)) = stack.last() {
            if next < deps[node].len() {
                let dep = deps[node][next];
                stack.last_mut().expect("just peeked").1 += 1;
                match state[dep] {
                    State::Unvisited => {
                        state[dep] = State::Visiting;
                        stack.push((dep, 0));
                    }
                    State::Visiting => {
                        log::warn!("cyclic module imports detected");
                        return Err(Error::CyclicImports);
                    }
                    State::Done => {}
                }
            } else {
                state[node] = State::Done;
                order.push(node);
                stack.pop();
            }
        }
    }
    Ok(order)
}

fn seed_host_exports<A: Allocator>(
    store: &mut Store<A>,
    exports: &mut RawVec<ExportEntry<A>, A>,
    host_functions: RawVec<HostEntry<A, HostFunction<A>>, A>,
    host_tables: RawVec<HostEntry<A, TableType>, A>,
    host_memories: RawVec<HostEntry<A, MemType>, A>,
    host_globals: RawVec<HostEntry<A, (GlobalType, Value)>, A>,
    alloc: A,
) -> Result<(), Error> {
    for entry in host_functions {
        let ty = entry.value.ty.clone();
        let addr = store.push_function(FunctionInstance::Host(entry.value));
        exports.push(ExportEntry {
            namespace: entry.namespace,
            field: entry.name,
            kind: ExportKind::Function(addr, ty),
        });
    }
    for entry in host_tables {
        let addr = store.push_table(TableInstance::new(entry.value, alloc.clone()));
        exports.push(ExportEntry {
            namespace: entry.namespace,
            field: entry.name,
            kind: ExportKind::Table(addr, entry.value),
        });
    }
    for entry in host_memories {
        let memory = Memory::new(entry.value, alloc.clone()).map_err(|trap| {
            log::error!("failed to allocate host memory: {trap:?}");
            Error::InitializerTrap(trap)
        })?;
        let addr = store.push_memory(memory);
        exports.push(ExportEntry {
            namespace: entry.namespace,
            field: entry.name,
            kind: ExportKind::Memory(addr, entry.value),
        });
    }
    for entry in host_globals {
        let (ty, value) = entry.value;
        let addr = store.push_global(GlobalInstance::new(ty, value));
        exports.push(ExportEntry {
            namespace: entry.namespace,
            field: entry.name,
            kind: ExportKind::Global(addr, ty),
        });
    }
    Ok(())
}

fn resolve_function_import<A: Allocator>(
    exports: &[ExportEntry<A>],
    importer: &Name<A>,
    import: &Import<A>,
    declared: &FunctionType<A>,
) -> Result<FuncAddr, Error> {
    let entry = find_entry(exports, &import.module, &import.field)
        .ok_or_else(|| import_not_found(importer, &import.module, &import.field))?;
    match &entry.kind {
        ExportKind::Function(addr, ty) if function_types_equal(declared, ty) => Ok(*addr),
        _ => Err(import_mismatch(importer, &import.module)),
    }
}

fn resolve_table_import<A: Allocator>(
    exports: &[ExportEntry<A>],
    importer: &Name<A>,
    import: &Import<A>,
    expected: TableType,
) -> Result<TableAddr, Error> {
    let entry = find_entry(exports, &import.module, &import.field)
        .ok_or_else(|| import_not_found(importer, &import.module, &import.field))?;
    match &entry.kind {
        ExportKind::Table(addr, actual)
            if actual.reftype == expected.reftype && limits_compatible(actual.limits, expected.limits) =>
        {
            Ok(*addr)
        }
        _ => Err(import_mismatch(importer, &import.module)),
    }
}

fn resolve_memory_import<A: Allocator>(
    exports: &[ExportEntry<A>],
    importer: &Name<A>,
    import: &Import<A>,
    expected: MemType,
) -> Result<MemAddr, Error> {
    let entry = find_entry(exports, &import.module, &import.field)
        .ok_or_else(|| import_not_found(importer, &import.module, &import.field))?;
    match &entry.kind {
        ExportKind::Memory(addr, actual) if limits_compatible(**actual, *expected) => Ok(*addr),
        _ => Err(import_mismatch(importer, &import.module)),
    }
}

fn resolve_global_import<A: Allocator>(
    exports: &[ExportEntry<A>],
    importer: &Name<A>,
    import: &Import<A>,
    expected: GlobalType,
) -> Result<GlobalAddr, Error> {
    let entry = find_entry(exports, &import.module, &import.field)
        .ok_or_else(|| import_not_found(importer, &import.module, &import.field))?;
    match &entry.kind {
        ExportKind::Global(addr, actual)
            if actual.value == expected.value && actual.mutability == expected.mutability =>
        {
            Ok(*addr)
        }
        _ => Err(import_mismatch(importer, &import.module)),
    }
}

fn apply_element_segments<A: Allocator>(
    store: &mut Store<A>,
    module: &Module<A>,
    func_addrs: &[FuncAddr],
    table_addrs: &[TableAddr],
    imported_global_addrs: &[GlobalAddr],
) -> Result<(), Error> {
    // Resolve and bounds-check every segment before writing any of them, so
    // one out-of-range segment can't leave an earlier one half-applied.
    let mut resolved: RawVec<(TableAddr, usize, RawVec<FuncAddr, Global>), Global> = RawVec::new_in(Global);
    for seg in module.elemsec.iter() {
        let table_addr = table_addrs[*seg.table as usize];
        let offset = match interp::eval_const(store, imported_global_addrs, &seg.offset) {
            Value::I32(v) => v as u32 as usize,
            _ => unreachable!("validated constant expression"),
        };
        let mut funcs: RawVec<FuncAddr, Global> = RawVec::new_in(Global);
        for fidx in seg.funcs.iter().copied() {
            funcs.push(func_addrs[*fidx as usize]);
        }
        let end = offset.checked_add(funcs.len()).ok_or_else(segment_out_of_range)?;
        if end > store.table(table_addr).len() {
            return Err(segment_out_of_range());
        }
        resolved.push((table_addr, offset, funcs));
    }
    for (table_addr, offset, funcs) in resolved {
        store
            .table_mut(table_addr)
            .init_segment(offset, &funcs)
            .expect("bounds already checked");
    }
    Ok(())
}

fn apply_data_segments<A: Allocator>(
    store: &mut Store<A>,
    module: &Module<A>,
    mem_addrs: &[MemAddr],
    imported_global_addrs: &[GlobalAddr],
) -> Result<(), Error> {
    let mut resolved: RawVec<(MemAddr, u32, &[u8]), Global> = RawVec::new_in(Global);
    for seg in module.datasec.iter() {
        let mem_addr = mem_addrs[*seg.memory as usize];
        let offset = match interp::eval_const(store, imported_global_addrs, &seg.offset) {
            Value::I32(v) => v as u32,
            _ => unreachable!("validated constant expression"),
        };
        let data: &[u8] = &seg.init;
        let end = (offset as usize).checked_add(data.len());
        let in_range = end.is_some_and(|end| end <= store.memory(mem_addr).bytes().len());
        if !in_range {
            return Err(segment_out_of_range());
        }
        resolved.push((mem_addr, offset, data));
    }
    for (mem_addr, offset, data) in resolved {
        store
            .memory_mut(mem_addr)
            .init_segment(offset, data)
            .expect("bounds already checked");
    }
    Ok(())
}

fn instantiate_module<A: Allocator>(
    store: &mut Store<A>,
    exports: &mut RawVec<ExportEntry<A>, A>,
    name: Name<A>,
    module: Module<A>,
    alloc: A,
) -> Result<usize, Error> {
    let module_instance_idx = store.modules.len();

    let mut func_addrs: RawVec<FuncAddr, A> = RawVec::new_in(alloc.clone());
    let mut table_addrs: RawVec<TableAddr, A> = RawVec::new_in(alloc.clone());
    let mut mem_addrs: RawVec<MemAddr, A> = RawVec::new_in(alloc.clone());
    let mut global_addrs: RawVec<GlobalAddr, A> = RawVec::new_in(alloc.clone());
    let mut table_types: RawVec<TableType, Global> = RawVec::new_in(Global);
    let mut mem_types: RawVec<MemType, Global> = RawVec::new_in(Global);
    let mut global_types: RawVec<GlobalType, Global> = RawVec::new_in(Global);

    for import in module.importsec.iter() {
        match &import.descriptor {
            ImportDescriptor::Function(type_idx) => {
                let declared = &module.typesec[**type_idx as usize];
                let addr = resolve_function_import(exports, &name, import, declared)?;
                func_addrs.push(addr);
            }
            ImportDescriptor::Table(ty) => {
                let addr = resolve_table_import(exports, &name, import, *ty)?;
                table_addrs.push(addr);
                table_types.push(*ty);
            }
            ImportDescriptor::Memory(ty) => {
                let addr = resolve_memory_import(exports, &name, import, *ty)?;
                mem_addrs.push(addr);
                mem_types.push(*ty);
            }
            ImportDescriptor::Global(ty) => {
                let addr = resolve_global_import(exports, &name, import, *ty)?;
                global_addrs.push(addr);
                global_types.push(*ty);
            }
        }
    }
    let imported_global_count = global_addrs.len();

    for func_idx in 0..module.codesec.len() {
        func_addrs.push(store.push_function(FunctionInstance::Wasm {
            module_instance: module_instance_idx,
            func_idx,
        }));
    }
    for ty in module.tablesec.iter().copied() {
        table_addrs.push(store.push_table(TableInstance::new(ty, alloc.clone())));
        table_types.push(ty);
    }
    for ty in module.memsec.iter().copied() {
        let memory = Memory::new(ty, alloc.clone()).map_err(|trap| {
            log::error!("failed to allocate module memory: {trap:?}");
            Error::InitializerTrap(trap)
        })?;
        mem_addrs.push(store.push_memory(memory));
        mem_types.push(ty);
    }
    for global in module.globalsec.iter() {
        let value = interp::eval_const(store, &global_addrs[..imported_global_count], &global.init);
        global_addrs.push(store.push_global(GlobalInstance::new(global.ty, value)));
        global_types.push(global.ty);
    }

    apply_element_segments(
        store,
        &module,
        &func_addrs,
        &table_addrs,
        &global_addrs[..imported_global_count],
    )?;
    apply_data_segments(store, &module, &mem_addrs, &global_addrs[..imported_global_count])?;

    for export in module.exportsec.iter() {
        let kind = export_kind(
            store,
            export,
            &func_addrs,
            &table_addrs,
            &mem_addrs,
            &global_addrs,
            &table_types,
            &mem_types,
            &global_types,
        );
        exports.push(ExportEntry {
            namespace: name_in(name_str(&name), alloc.clone()),
            field: name_in(name_str(&export.field), alloc.clone()),
            kind,
        });
    }

    let start_addr = module.startsec.map(|start| func_addrs[**start as usize]);

    store.modules.push(ModuleInstance {
        module,
        func_addrs,
        table_addrs,
        mem_addrs,
        global_addrs,
    });
    debug_assert_eq!(store.modules.len() - 1, module_instance_idx);

    if let Some(addr) = start_addr {
        interp::invoke(store, addr, &[]).map_err(|trap| {
            log::error!("start function trapped: {trap:?}");
            Error::InitializerTrap(trap)
        })?;
    }

    Ok(module_instance_idx)
}

#[allow(clippy::too_many_arguments)]
fn export_kind<A: Allocator>(
    store: &Store<A>,
    export: &Export<A>,
    func_addrs: &[FuncAddr],
    table_addrs: &[TableAddr],
    mem_addrs: &[MemAddr],
    global_addrs: &[GlobalAddr],
    table_types: &[TableType],
    mem_types: &[MemType],
    global_types: &[GlobalType],
) -> ExportKind {
    match export.descriptor {
        ExportDescriptor::Function(idx) => {
            let addr = func_addrs[*idx as usize];
            ExportKind::Function(addr, interp::function_signature(store, addr, Global))
        }
        ExportDescriptor::Table(idx) => {
            let i = *idx as usize;
            ExportKind::Table(table_addrs[i], table_types[i])
        }
        ExportDescriptor::Memory(idx) => {
            let i = *idx as usize;
            ExportKind::Memory(mem_addrs[i], mem_types[i])
        }
        ExportDescriptor::Global(idx) => {
            let i = *idx as usize;
            ExportKind::Global(global_addrs[i], global_types[i])
        }
    }
}

/// A function export, resolved and type-checked, ready to call via
/// [`Program::call`].
pub struct FunctionHandle {
    addr: FuncAddr,
    parameters: RawVec<ValType, Global>,
    results: RawVec<ValType, Global>,
}

impl FunctionHandle {
    /// The function's parameter types.
    pub fn parameters(&self) -> &[ValType] {
        &self.parameters
    }

    /// The function's result types.
    pub fn results(&self) -> &[ValType] {
        &self.results
    }
}

/// A linked and instantiated program: every registered module's exports,
/// plus the host bindings, resolved into one running [`Store`].
pub struct Program<A: Allocator = Global> {
    store: Store<A>,
    exports: RawVec<ExportEntry<A>, A>,
}

impl<A: Allocator> Program<A> {
    fn find_export(&self, module: &str, field: &str) -> Result<&ExportKind, Error> {
        self.exports
            .iter()
            .find(|e| name_str(&e.namespace) == module && name_str(&e.field) == field)
            .map(|e| &e.kind)
            .ok_or(Error::ExportNotFound)
    }

    /// The first memory allocated into the program's store, if any module or
    /// host binding declared one.
    pub fn memory(&self) -> Option<&Memory<A>> {
        self.store.memories.first()
    }

    /// The first memory allocated into the program's store, mutably.
    pub fn memory_mut(&mut self) -> Option<&mut Memory<A>> {
        self.store.memories.first_mut()
    }

    /// Reads a global export's current value.
    pub fn get_global<T: Scalar>(&self, module: &str, name: &str) -> Result<T, Error> {
        match self.find_export(module, name)? {
            ExportKind::Global(addr, ty) if ty.value == T::VAL_TYPE => {
                T::from_value(self.store.global(*addr).get()).ok_or(Error::IllegalArgument)
            }
            ExportKind::Global(..) => Err(Error::IllegalArgument),
            _ => Err(Error::WrongExportKind),
        }
    }

    /// Writes a global export's value, rejecting the write if the global is
    /// immutable or the value's type doesn't match.
    pub fn set_global<T: Scalar>(&mut self, module: &str, name: &str, value: T) -> Result<(), Error> {
        let (addr, ty) = match self.find_export(module, name)? {
            ExportKind::Global(addr, ty) => (*addr, *ty),
            _ => return Err(Error::WrongExportKind),
        };
        if ty.value != T::VAL_TYPE {
            return Err(Error::IllegalArgument);
        }
        if ty.mutability != GlobalTypeMutability::Var {
            return Err(Error::ImmutableGlobal);
        }
        self.store.global_mut(addr).set(value.into_value());
        Ok(())
    }

    /// Resolves a function export into a callable handle.
    pub fn get_function(&self, module: &str, name: &str) -> Result<FunctionHandle, Error> {
        match self.find_export(module, name)? {
            ExportKind::Function(addr, ty) => {
                let mut parameters = RawVec::new_in(Global);
                parameters.extend_from_slice(&ty.parameters);
                let mut results = RawVec::new_in(Global);
                results.extend_from_slice(ty.results.as_ref());
                Ok(FunctionHandle {
                    addr: *addr,
                    parameters,
                    results,
                })
            }
            _ => Err(Error::WrongExportKind),
        }
    }

    /// Calls a resolved function export, validating the argument count and
    /// types against its declared signature first.
    pub fn call(&mut self, handle: &FunctionHandle, args: &[Value]) -> Result<RawVec<Value, Global>, Error> {
        let matches = args.len() == handle.parameters.len()
            && args.iter().zip(&handle.parameters).all(|(arg, ty)| arg.ty() == *ty);
        if !matches {
            return Err(Error::IllegalArgument);
        }
        interp::invoke(&mut self.store, handle.addr, args).map_err(|trap| {
            log::error!("function call trapped: {trap:?}");
            Error::Trap(trap)
        })
    }
}
