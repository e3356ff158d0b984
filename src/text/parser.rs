// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Recursive-descent parser turning a token stream into a [`Module`].
//!
//! Name resolution happens in two passes over the module's top-level
//! fields. The first pass builds the index spaces for types, functions,
//! tables, memories and globals (imports of a kind always precede
//! definitions of that kind, matching the convention
//! `crate::validate::Validator` already assumes). The second pass resolves
//! everything that can forward-reference a later field: function bodies,
//! global initializers, element/data offsets, and standalone `export`/
//! `start` fields.

use crate::core_compat::alloc::Global;
use crate::core_compat::vec::Vec as RawVec;
use crate::types::{
    BlockType, BulkOpcode, CallIndirectOperands, Export, ExportDescriptor, ExportSection,
    Function, FunctionType, Global as WasmGlobal, GlobalType, GlobalTypeMutability, Import,
    ImportDescriptor, ImportSection, Limits, Local, Locals, MemArg, MemType, Opcode, RefType,
    ResultType, TableType, ValType,
};
use crate::{Allocator, Module};

use super::expr::{ExpressionBuilder, Writable};
use super::lexer::{FloatLiteral, LexError, Lexer, Position, Token, TokenKind};

/// Errors that can arise while parsing a text-format module.
#[derive(Clone, Copy, Debug)]
pub enum Error {
    Lex(LexError),
    UnexpectedEof,
    Expected(&'static str, Position),
    UnknownIdentifier(&'static str, Position),
    DuplicateIdentifier(&'static str, Position),
    IndexOutOfRange(&'static str, Position),
    InvalidLiteral(Position),
    InvalidMnemonic(Position),
    LabelMismatch(Position),
    OutOfMemory,
}

impl From<LexError> for Error {
    fn from(e: LexError) -> Self {
        Error::Lex(e)
    }
}

// Maximum number of function-local declarations; mirrors the binary
// decoder's own MAX_LOCALS_PER_FUNCTION limit.
const MAX_LOCALS_PER_FUNCTION: usize = 2000;

fn oom<T>(_: T) -> Error {
    Error::OutOfMemory
}

fn push<T>(vec: &mut RawVec<T, Global>, value: T) -> Result<(), Error> {
    vec.try_reserve_exact(1).map_err(oom)?;
    vec.push(value);
    Ok(())
}

// ---------------------------------------------------------------------
// Token cursor
// ---------------------------------------------------------------------

// A cursor always spans the entire token buffer for a module, never a
// sub-slice: a field's token range is just a pair of indices into it, so
// that ranges captured while parsing one field (e.g. a deferred function
// body) remain meaningful when a cursor is re-seeked to them later, in a
// different pass, without having to renormalize offsets.
#[derive(Clone, Copy)]
struct Cursor<'a> {
    tokens: &'a [Token<'a>],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(tokens: &'a [Token<'a>]) -> Self {
        Self { tokens, pos: 0 }
    }

    fn at(tokens: &'a [Token<'a>], pos: usize) -> Self {
        Self { tokens, pos }
    }

    fn peek(&self) -> Option<&'a Token<'a>> {
        self.tokens.get(self.pos)
    }

    fn pos_or_last(&self) -> Position {
        self.peek()
            .or_else(|| self.tokens.last())
            .map(|t| t.pos)
            .unwrap_or(Position::START)
    }

    fn bump(&mut self) -> Option<&'a Token<'a>> {
        let t = self.tokens.get(self.pos)?;
        self.pos += 1;
        Some(t)
    }

    fn at_rparen(&self) -> bool {
        matches!(self.peek().map(|t| &t.kind), Some(TokenKind::RParen))
    }

    fn at_lparen(&self) -> bool {
        matches!(self.peek().map(|t| &t.kind), Some(TokenKind::LParen))
    }

    fn at_end(&self) -> bool {
        self.peek().is_none()
    }

    fn at_keyword(&self, word: &str) -> bool {
        matches!(self.peek().map(|t| &t.kind), Some(TokenKind::Keyword(k)) if *k == word)
    }

    fn expect_lparen(&mut self) -> Result<(), Error> {
        match self.bump() {
            Some(Token { kind: TokenKind::LParen, .. }) => Ok(()),
            other => Err(Error::Expected("(", other.map(|t| t.pos).unwrap_or(Position::START))),
        }
    }

    fn expect_rparen(&mut self) -> Result<(), Error> {
        match self.bump() {
            Some(Token { kind: TokenKind::RParen, .. }) => Ok(()),
            other => Err(Error::Expected(")", other.map(|t| t.pos).unwrap_or(Position::START))),
        }
    }

    fn expect_keyword(&mut self, word: &'static str) -> Result<(), Error> {
        match self.bump() {
            Some(Token { kind: TokenKind::Keyword(k), .. }) if *k == word => Ok(()),
            other => Err(Error::Expected(word, other.map(|t| t.pos).unwrap_or(Position::START))),
        }
    }

    // Consumes an optional `$id`.
    fn opt_id(&mut self) -> Option<&'a str> {
        if let Some(Token { kind: TokenKind::Id(name), .. }) = self.peek() {
            let name = *name;
            self.bump();
            Some(name)
        } else {
            None
        }
    }

    // Advances past the contents of a parenthesized form whose opening `(`
    // has already been consumed (so `self.pos` sits at depth 1), returning
    // the token span of its contents (excluding the matching `)`, which is
    // consumed).
    fn skip_to_matching_rparen(&mut self) -> Result<(usize, usize), Error> {
        let start = self.pos;
        let mut depth = 1u32;
        loop {
            match self.bump() {
                None => return Err(Error::UnexpectedEof),
                Some(Token { kind: TokenKind::LParen, .. }) => depth += 1,
                Some(Token { kind: TokenKind::RParen, .. }) => {
                    depth -= 1;
                    if depth == 0 {
                        return Ok((start, self.pos - 1));
                    }
                }
                _ => {}
            }
        }
    }
}

// ---------------------------------------------------------------------
// Symbol tables
// ---------------------------------------------------------------------

struct IndexSpace<'a> {
    names: RawVec<Option<&'a str>, Global>,
}

impl<'a> IndexSpace<'a> {
    fn new() -> Self {
        Self { names: RawVec::new_in(Global) }
    }

    fn resolve(&self, name: &str) -> Option<u32> {
        self.names
            .iter()
            .position(|n| *n == Some(name))
            .map(|i| i as u32)
    }

    fn push_named(
        &mut self,
        name: Option<&'a str>,
        sort: &'static str,
        pos: Position,
    ) -> Result<u32, Error> {
        if let Some(n) = name
            && self.resolve(n).is_some()
        {
            return Err(Error::DuplicateIdentifier(sort, pos));
        }
        let idx = self.names.len() as u32;
        push(&mut self.names, name)?;
        Ok(idx)
    }

    fn len(&self) -> u32 {
        self.names.len() as u32
    }
}

#[derive(Clone, Copy)]
enum IdxRef<'a> {
    Id(&'a str, Position),
    Num(u32),
}

fn resolve_idx(idx_ref: IdxRef<'_>, space: &IndexSpace<'_>, sort: &'static str) -> Result<u32, Error> {
    match idx_ref {
        IdxRef::Num(n) => {
            if n < space.len() {
                Ok(n)
            } else {
                Err(Error::IndexOutOfRange(sort, Position::START))
            }
        }
        IdxRef::Id(name, pos) => space.resolve(name).ok_or(Error::UnknownIdentifier(sort, pos)),
    }
}

// A function-type signature kept in scratch form until the module is
// assembled in the caller's allocator.
struct Signature {
    params: RawVec<ValType, Global>,
    results: RawVec<ValType, Global>,
}

impl Signature {
    fn matches(&self, params: &[ValType], results: &[ValType]) -> bool {
        self.params.as_slice() == params && self.results.as_slice() == results
    }
}

struct TypeTable<'a> {
    sigs: RawVec<Signature, Global>,
    ids: IndexSpace<'a>,
}

impl<'a> TypeTable<'a> {
    fn new() -> Self {
        Self { sigs: RawVec::new_in(Global), ids: IndexSpace::new() }
    }

    fn find_or_add(&mut self, params: RawVec<ValType, Global>, results: RawVec<ValType, Global>) -> Result<u32, Error> {
        for (i, sig) in self.sigs.iter().enumerate() {
            if sig.matches(&params, &results) {
                return Ok(i as u32);
            }
        }
        let idx = self.sigs.len() as u32;
        push(&mut self.sigs, Signature { params, results })?;
        Ok(idx)
    }
}

// ---------------------------------------------------------------------
// Deferred (pending) field data
// ---------------------------------------------------------------------

struct PendingImport {
    module: RawVec<u8, Global>,
    field: RawVec<u8, Global>,
    descriptor: ImportDescriptor,
}

// Token spans are stored as plain index ranges into the master token
// buffer that lives for the whole of `parse_module`, rather than as
// borrowed slices, since a borrowed `&[Token<'a>]` would tie every pending
// field to the lifetime of that local buffer instead of to the source
// text `'a`.
type TokenRange = (usize, usize);

struct PendingFunc<'a> {
    type_idx: u32,
    locals: RawVec<(Option<&'a str>, ValType), Global>,
    param_count: u32,
    body: TokenRange,
}

struct PendingGlobal {
    ty: GlobalType,
    init: TokenRange,
}

struct PendingExport<'a> {
    field: RawVec<u8, Global>,
    sort: ExportSort,
    target: IdxRef<'a>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum ExportSort {
    Function,
    Table,
    Memory,
    Global,
}

struct PendingElem<'a> {
    table: IdxRef<'a>,
    offset: TokenRange,
    funcs: RawVec<IdxRef<'a>, Global>,
}

struct PendingData<'a> {
    memory: IdxRef<'a>,
    offset: TokenRange,
    bytes: RawVec<u8, Global>,
}

// An element/data segment synthesized from an inline `(elem ...)`/`(data
// ...)` abbreviation on a table/memory field; its offset is always the
// trivial `i32.const 0`, so it carries no deferred token span.
struct ImmediateElem<'a> {
    table_idx: u32,
    funcs: RawVec<IdxRef<'a>, Global>,
}

struct ImmediateData {
    memory_idx: u32,
    bytes: RawVec<u8, Global>,
}

struct FieldSpan<'a> {
    keyword: &'a str,
    pos: Position,
    range: TokenRange,
}

// ---------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------

struct Parser<'a> {
    types: TypeTable<'a>,
    funcs: IndexSpace<'a>,
    tables: IndexSpace<'a>,
    mems: IndexSpace<'a>,
    globals: IndexSpace<'a>,

    import_requests: RawVec<ImportRequest<'a>, Global>,
    def_requests: RawVec<DefRequest<'a>, Global>,

    // Populated by assign_imports/assign_defs: the funcidx/tableidx/memidx/
    // globalidx-ordered view used during final assembly and during body
    // resolution (a func body needs its own locals' value types, which are
    // only known once def_requests has been consumed).
    func_defs: RawVec<PendingFunc<'a>, Global>,
    table_defs: RawVec<TableType, Global>,
    mem_defs: RawVec<MemType, Global>,
    global_defs: RawVec<PendingGlobal, Global>,
    resolved_imports: RawVec<PendingImport, Global>,

    exports: RawVec<PendingExport<'a>, Global>,
    start: Option<IdxRef<'a>>,
    elems: RawVec<PendingElem<'a>, Global>,
    datas: RawVec<PendingData<'a>, Global>,
    immediate_elems: RawVec<ImmediateElem<'a>, Global>,
    immediate_datas: RawVec<ImmediateData, Global>,
}

impl<'a> Parser<'a> {
    fn new() -> Self {
        Self {
            types: TypeTable::new(),
            funcs: IndexSpace::new(),
            tables: IndexSpace::new(),
            mems: IndexSpace::new(),
            globals: IndexSpace::new(),
            import_requests: RawVec::new_in(Global),
            def_requests: RawVec::new_in(Global),
            func_defs: RawVec::new_in(Global),
            table_defs: RawVec::new_in(Global),
            mem_defs: RawVec::new_in(Global),
            global_defs: RawVec::new_in(Global),
            resolved_imports: RawVec::new_in(Global),
            exports: RawVec::new_in(Global),
            start: None,
            elems: RawVec::new_in(Global),
            datas: RawVec::new_in(Global),
            immediate_elems: RawVec::new_in(Global),
            immediate_datas: RawVec::new_in(Global),
        }
    }

    // -------------------------------------------------------------
    // Shared lexical helpers
    // -------------------------------------------------------------

    fn read_ref(&self, cur: &mut Cursor<'a>) -> Result<IdxRef<'a>, Error> {
        match cur.bump() {
            Some(Token { kind: TokenKind::Id(name), pos }) => Ok(IdxRef::Id(name, *pos)),
            Some(Token { kind: TokenKind::Int { negative: false, text, hex }, pos }) => {
                parse_u32_digits(text, *hex).map(IdxRef::Num).map_err(|_| Error::InvalidLiteral(*pos))
            }
            other => Err(Error::Expected("index or identifier", other.map(|t| t.pos).unwrap_or(Position::START))),
        }
    }

    fn parse_valtype(&self, cur: &mut Cursor<'a>) -> Result<ValType, Error> {
        match cur.bump() {
            Some(Token { kind: TokenKind::Keyword(k), pos }) => match *k {
                "i32" => Ok(ValType::I32),
                "i64" => Ok(ValType::I64),
                "f32" => Ok(ValType::F32),
                "f64" => Ok(ValType::F64),
                _ => Err(Error::Expected("value type", *pos)),
            },
            other => Err(Error::Expected("value type", other.map(|t| t.pos).unwrap_or(Position::START))),
        }
    }

    fn parse_reftype(&self, cur: &mut Cursor<'a>) -> Result<RefType, Error> {
        match cur.bump() {
            Some(Token { kind: TokenKind::Keyword(k), pos }) => match *k {
                "funcref" | "anyfunc" => Ok(RefType::Func),
                _ => Err(Error::Expected("reference type", *pos)),
            },
            other => Err(Error::Expected("reference type", other.map(|t| t.pos).unwrap_or(Position::START))),
        }
    }

    fn parse_limits(&self, cur: &mut Cursor<'a>) -> Result<Limits, Error> {
        let min = match cur.bump() {
            Some(Token { kind: TokenKind::Int { negative: false, text, hex }, pos }) => {
                parse_u32_digits(text, *hex).map_err(|_| Error::InvalidLiteral(*pos))?
            }
            other => return Err(Error::Expected("limits", other.map(|t| t.pos).unwrap_or(Position::START))),
        };
        let max = if let Some(Token { kind: TokenKind::Int { negative: false, text, hex }, .. }) = cur.peek() {
            let (text, hex) = (*text, *hex);
            let pos = cur.peek().unwrap().pos;
            cur.bump();
            Some(parse_u32_digits(text, hex).map_err(|_| Error::InvalidLiteral(pos))?)
        } else {
            None
        };
        Ok(Limits { min, max })
    }

    // Parses a typeuse: an optional `(type ref)` followed by any number of
    // `(param ...)` and `(result ...)` clauses. Returns the resolved type
    // index and the parameter names (for local-index naming in the
    // function body), synthesizing a fresh type if no explicit `(type
    // ref)` was given.
    fn parse_typeuse(
        &mut self,
        cur: &mut Cursor<'a>,
    ) -> Result<(u32, RawVec<Option<&'a str>, Global>), Error> {
        let mut explicit_type = None;
        if cur.at_lparen() {
            let save = cur.pos;
            cur.bump();
            if cur.at_keyword("type") {
                cur.bump();
                let r = self.read_ref(cur)?;
                cur.expect_rparen()?;
                explicit_type = Some(resolve_idx(r, &self.types.ids, "type")?);
            } else {
                cur.pos = save;
            }
        }

        let mut param_names = RawVec::new_in(Global);
        let mut params = RawVec::new_in(Global);
        while cur.at_lparen() {
            let save = cur.pos;
            cur.bump();
            if cur.at_keyword("param") {
                cur.bump();
                let id = cur.opt_id();
                if id.is_some() {
                    let ty = self.parse_valtype(cur)?;
                    push(&mut param_names, id)?;
                    push(&mut params, ty)?;
                } else {
                    while !cur.at_rparen() {
                        let ty = self.parse_valtype(cur)?;
                        push(&mut param_names, None)?;
                        push(&mut params, ty)?;
                    }
                }
                cur.expect_rparen()?;
            } else {
                cur.pos = save;
                break;
            }
        }

        let mut results = RawVec::new_in(Global);
        while cur.at_lparen() {
            let save = cur.pos;
            cur.bump();
            if cur.at_keyword("result") {
                cur.bump();
                while !cur.at_rparen() {
                    let ty = self.parse_valtype(cur)?;
                    push(&mut results, ty)?;
                }
                cur.expect_rparen()?;
            } else {
                cur.pos = save;
                break;
            }
        }

        let type_idx = match explicit_type {
            Some(idx) => idx,
            None => self.types.find_or_add(params, results)?,
        };
        Ok((type_idx, param_names))
    }

    fn parse_blocktype(&mut self, cur: &mut Cursor<'a>) -> Result<BlockType, Error> {
        if cur.at_lparen() {
            let (type_idx, _) = self.parse_typeuse(cur)?;
            let sig = &self.types.sigs[type_idx as usize];
            return Ok(if sig.params.is_empty() && sig.results.is_empty() {
                BlockType::Empty
            } else if sig.params.is_empty() && sig.results.len() == 1 {
                BlockType::Result(sig.results[0])
            } else {
                BlockType::TypeIndex(crate::types::TypeIdx::new(type_idx))
            });
        }
        if let Some(Token { kind: TokenKind::Keyword(k), .. }) = cur.peek()
            && matches!(*k, "i32" | "i64" | "f32" | "f64")
        {
            let ty = self.parse_valtype(cur)?;
            return Ok(BlockType::Result(ty));
        }
        Ok(BlockType::Empty)
    }
}

fn strip_underscores(buf: &mut RawVec<u8, Global>, text: &str) -> Result<(), Error> {
    buf.clear();
    for b in text.bytes().filter(|&b| b != b'_') {
        push(buf, b)?;
    }
    Ok(())
}

fn parse_u32_digits(text: &str, hex: bool) -> Result<u32, ()> {
    let mut buf = RawVec::new_in(Global);
    strip_underscores(&mut buf, text).map_err(|_| ())?;
    let s = core::str::from_utf8(&buf).map_err(|_| ())?;
    u32::from_str_radix(s, if hex { 16 } else { 10 }).map_err(|_| ())
}

fn parse_u64_digits(text: &str, hex: bool) -> Result<u64, ()> {
    let mut buf = RawVec::new_in(Global);
    strip_underscores(&mut buf, text).map_err(|_| ())?;
    let s = core::str::from_utf8(&buf).map_err(|_| ())?;
    u64::from_str_radix(s, if hex { 16 } else { 10 }).map_err(|_| ())
}

fn literal_i32(negative: bool, text: &str, hex: bool, pos: Position) -> Result<i32, Error> {
    let mag = parse_u32_digits(text, hex).map_err(|_| Error::InvalidLiteral(pos))?;
    let v = mag as i32;
    Ok(if negative { v.wrapping_neg() } else { v })
}

fn literal_i64(negative: bool, text: &str, hex: bool, pos: Position) -> Result<i64, Error> {
    let mag = parse_u64_digits(text, hex).map_err(|_| Error::InvalidLiteral(pos))?;
    let v = mag as i64;
    Ok(if negative { v.wrapping_neg() } else { v })
}

fn parse_hex_float(text: &str) -> Option<f64> {
    let bytes = text.as_bytes();
    let mut i = 0;
    let mut mantissa = 0f64;
    while i < bytes.len() && (bytes[i].is_ascii_hexdigit() || bytes[i] == b'_') {
        if bytes[i] != b'_' {
            mantissa = mantissa * 16.0 + (bytes[i] as char).to_digit(16)? as f64;
        }
        i += 1;
    }
    if i < bytes.len() && bytes[i] == b'.' {
        i += 1;
        let mut frac = 1.0 / 16.0;
        while i < bytes.len() && (bytes[i].is_ascii_hexdigit() || bytes[i] == b'_') {
            if bytes[i] != b'_' {
                mantissa += (bytes[i] as char).to_digit(16)? as f64 * frac;
                frac /= 16.0;
            }
            i += 1;
        }
    }
    let mut exp = 0i32;
    if i < bytes.len() && (bytes[i] == b'p' || bytes[i] == b'P') {
        i += 1;
        let neg = i < bytes.len() && bytes[i] == b'-';
        if i < bytes.len() && (bytes[i] == b'+' || bytes[i] == b'-') {
            i += 1;
        }
        let mut e = 0i32;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            e = e * 10 + (bytes[i] - b'0') as i32;
            i += 1;
        }
        exp = if neg { -e } else { e };
    }
    if i != bytes.len() {
        return None;
    }
    Some(mantissa * 2f64.powi(exp))
}

fn literal_f64(negative: bool, fl: &FloatLiteral<'_>, pos: Position) -> Result<f64, Error> {
    let value = match fl {
        FloatLiteral::Value { text, hex: false } => {
            let mut buf = RawVec::new_in(Global);
            strip_underscores(&mut buf, text).map_err(|_| Error::OutOfMemory)?;
            let s = core::str::from_utf8(&buf).map_err(|_| Error::InvalidLiteral(pos))?;
            s.parse::<f64>().map_err(|_| Error::InvalidLiteral(pos))?
        }
        FloatLiteral::Value { text, hex: true } => {
            parse_hex_float(text).ok_or(Error::InvalidLiteral(pos))?
        }
        FloatLiteral::Inf { .. } => f64::INFINITY,
        FloatLiteral::Nan { .. } | FloatLiteral::NanCanonical { .. } | FloatLiteral::NanArithmetic { .. } => {
            f64::NAN
        }
        FloatLiteral::NanPayload { hex_digits, .. } => {
            let payload = u64::from_str_radix(hex_digits, 16).map_err(|_| Error::InvalidLiteral(pos))?;
            f64::from_bits(0x7ff0_0000_0000_0000 | (payload & 0x000f_ffff_ffff_ffff))
        }
    };
    Ok(if negative { -value } else { value })
}

fn literal_f32(negative: bool, fl: &FloatLiteral<'_>, pos: Position) -> Result<f32, Error> {
    if let FloatLiteral::NanPayload { hex_digits, .. } = fl {
        let payload = u32::from_str_radix(hex_digits, 16).map_err(|_| Error::InvalidLiteral(pos))?;
        let v = f32::from_bits(0x7f80_0000 | (payload & 0x007f_ffff));
        return Ok(if negative { -v } else { v });
    }
    literal_f64(negative, fl, pos).map(|v| v as f32)
}

// ---------------------------------------------------------------------
// Mnemonic table
// ---------------------------------------------------------------------

enum OpShape {
    Plain(Opcode),
    Mem(Opcode),
    I32Const,
    I64Const,
    F32Const,
    F64Const,
    LocalRef(Opcode),
    GlobalRef(Opcode),
    FuncRef,
    CallIndirectOp,
    LabelRef(Opcode),
    BrTableOp,
    Block,
    Loop,
    If,
    Bulk(BulkOpcode),
}

fn lookup_opcode(word: &str) -> Option<OpShape> {
    use Opcode::*;
    Some(match word {
        "unreachable" => OpShape::Plain(Unreachable),
        "nop" => OpShape::Plain(Nop),
        "block" => OpShape::Block,
        "loop" => OpShape::Loop,
        "if" => OpShape::If,
        "br" => OpShape::LabelRef(Br),
        "br_if" => OpShape::LabelRef(BrIf),
        "br_table" => OpShape::BrTableOp,
        "return" => OpShape::Plain(Return),
        "call" => OpShape::FuncRef,
        "call_indirect" => OpShape::CallIndirectOp,
        "drop" => OpShape::Plain(Drop),
        "select" => OpShape::Plain(Select),
        "local.get" => OpShape::LocalRef(LocalGet),
        "local.set" => OpShape::LocalRef(LocalSet),
        "local.tee" => OpShape::LocalRef(LocalTee),
        "global.get" => OpShape::GlobalRef(GlobalGet),
        "global.set" => OpShape::GlobalRef(GlobalSet),
        "i32.load" => OpShape::Mem(I32Load),
        "i64.load" => OpShape::Mem(I64Load),
        "f32.load" => OpShape::Mem(F32Load),
        "f64.load" => OpShape::Mem(F64Load),
        "i32.load8_s" => OpShape::Mem(I32Load8S),
        "i32.load8_u" => OpShape::Mem(I32Load8U),
        "i32.load16_s" => OpShape::Mem(I32Load16S),
        "i32.load16_u" => OpShape::Mem(I32Load16U),
        "i64.load8_s" => OpShape::Mem(I64Load8S),
        "i64.load8_u" => OpShape::Mem(I64Load8U),
        "i64.load16_s" => OpShape::Mem(I64Load16S),
        "i64.load16_u" => OpShape::Mem(I64Load16U),
        "i64.load32_s" => OpShape::Mem(I64Load32S),
        "i64.load32_u" => OpShape::Mem(I64Load32U),
        "i32.store" => OpShape::Mem(I32Store),
        "i64.store" => OpShape::Mem(I64Store),
        "f32.store" => OpShape::Mem(F32Store),
        "f64.store" => OpShape::Mem(F64Store),
        "i32.store8" => OpShape::Mem(I32Store8),
        "i32.store16" => OpShape::Mem(I32Store16),
        "i64.store8" => OpShape::Mem(I64Store8),
        "i64.store16" => OpShape::Mem(I64Store16),
        "i64.store32" => OpShape::Mem(I64Store32),
        "memory.size" => OpShape::Plain(MemorySize),
        "memory.grow" => OpShape::Plain(MemoryGrow),
        "i32.const" => OpShape::I32Const,
        "i64.const" => OpShape::I64Const,
        "f32.const" => OpShape::F32Const,
        "f64.const" => OpShape::F64Const,
        "i32.eqz" => OpShape::Plain(I32Eqz),
        "i32.eq" => OpShape::Plain(I32Eq),
        "i32.ne" => OpShape::Plain(I32Ne),
        "i32.lt_s" => OpShape::Plain(I32LtS),
        "i32.lt_u" => OpShape::Plain(I32LtU),
        "i32.gt_s" => OpShape::Plain(I32GtS),
        "i32.gt_u" => OpShape::Plain(I32GtU),
        "i32.le_s" => OpShape::Plain(I32LeS),
        "i32.le_u" => OpShape::Plain(I32LeU),
        "i32.ge_s" => OpShape::Plain(I32GeS),
        "i32.ge_u" => OpShape::Plain(I32GeU),
        "i64.eqz" => OpShape::Plain(I64Eqz),
        "i64.eq" => OpShape::Plain(I64Eq),
        "i64.ne" => OpShape::Plain(I64Ne),
        "i64.lt_s" => OpShape::Plain(I64LtS),
        "i64.lt_u" => OpShape::Plain(I64LtU),
        "i64.gt_s" => OpShape::Plain(I64GtS),
        "i64.gt_u" => OpShape::Plain(I64GtU),
        "i64.le_s" => OpShape::Plain(I64LeS),
        "i64.le_u" => OpShape::Plain(I64LeU),
        "i64.ge_s" => OpShape::Plain(I64GeS),
        "i64.ge_u" => OpShape::Plain(I64GeU),
        "f32.eq" => OpShape::Plain(F32Eq),
        "f32.ne" => OpShape::Plain(F32Ne),
        "f32.lt" => OpShape::Plain(F32Lt),
        "f32.gt" => OpShape::Plain(F32Gt),
        "f32.le" => OpShape::Plain(F32Le),
        "f32.ge" => OpShape::Plain(F32Ge),
        "f64.eq" => OpShape::Plain(F64Eq),
        "f64.ne" => OpShape::Plain(F64Ne),
        "f64.lt" => OpShape::Plain(F64Lt),
        "f64.gt" => OpShape::Plain(F64Gt),
        "f64.le" => OpShape::Plain(F64Le),
        "f64.ge" => OpShape::Plain(F64Ge),
        "i32.clz" => OpShape::Plain(I32Clz),
        "i32.ctz" => OpShape::Plain(I32Ctz),
        "i32.popcnt" => OpShape::Plain(I32Popcnt),
        "i32.add" => OpShape::Plain(I32Add),
        "i32.sub" => OpShape::Plain(I32Sub),
        "i32.mul" => OpShape::Plain(I32Mul),
        "i32.div_s" => OpShape::Plain(I32DivS),
        "i32.div_u" => OpShape::Plain(I32DivU),
        "i32.rem_s" => OpShape::Plain(I32RemS),
        "i32.rem_u" => OpShape::Plain(I32RemU),
        "i32.and" => OpShape::Plain(I32And),
        "i32.or" => OpShape::Plain(I32Or),
        "i32.xor" => OpShape::Plain(I32Xor),
        "i32.shl" => OpShape::Plain(I32Shl),
        "i32.shr_s" => OpShape::Plain(I32ShrS),
        "i32.shr_u" => OpShape::Plain(I32ShrU),
        "i32.rotl" => OpShape::Plain(I32Rotl),
        "i32.rotr" => OpShape::Plain(I32Rotr),
        "i64.clz" => OpShape::Plain(I64Clz),
        "i64.ctz" => OpShape::Plain(I64Ctz),
        "i64.popcnt" => OpShape::Plain(I64Popcnt),
        "i64.add" => OpShape::Plain(I64Add),
        "i64.sub" => OpShape::Plain(I64Sub),
        "i64.mul" => OpShape::Plain(I64Mul),
        "i64.div_s" => OpShape::Plain(I64DivS),
        "i64.div_u" => OpShape::Plain(I64DivU),
        "i64.rem_s" => OpShape::Plain(I64RemS),
        "i64.rem_u" => OpShape::Plain(I64RemU),
        "i64.and" => OpShape::Plain(I64And),
        "i64.or" => OpShape::Plain(I64Or),
        "i64.xor" => OpShape::Plain(I64Xor),
        "i64.shl" => OpShape::Plain(I64Shl),
        "i64.shr_s" => OpShape::Plain(I64ShrS),
        "i64.shr_u" => OpShape::Plain(I64ShrU),
        "i64.rotl" => OpShape::Plain(I64Rotl),
        "i64.rotr" => OpShape::Plain(I64Rotr),
        "f32.abs" => OpShape::Plain(F32Abs),
        "f32.neg" => OpShape::Plain(F32Neg),
        "f32.ceil" => OpShape::Plain(F32Ceil),
        "f32.floor" => OpShape::Plain(F32Floor),
        "f32.trunc" => OpShape::Plain(F32Trunc),
        "f32.nearest" => OpShape::Plain(F32Nearest),
        "f32.sqrt" => OpShape::Plain(F32Sqrt),
        "f32.add" => OpShape::Plain(F32Add),
        "f32.sub" => OpShape::Plain(F32Sub),
        "f32.mul" => OpShape::Plain(F32Mul),
        "f32.div" => OpShape::Plain(F32Div),
        "f32.min" => OpShape::Plain(F32Min),
        "f32.max" => OpShape::Plain(F32Max),
        "f32.copysign" => OpShape::Plain(F32Copysign),
        "f64.abs" => OpShape::Plain(F64Abs),
        "f64.neg" => OpShape::Plain(F64Neg),
        "f64.ceil" => OpShape::Plain(F64Ceil),
        "f64.floor" => OpShape::Plain(F64Floor),
        "f64.trunc" => OpShape::Plain(F64Trunc),
        "f64.nearest" => OpShape::Plain(F64Nearest),
        "f64.sqrt" => OpShape::Plain(F64Sqrt),
        "f64.add" => OpShape::Plain(F64Add),
        "f64.sub" => OpShape::Plain(F64Sub),
        "f64.mul" => OpShape::Plain(F64Mul),
        "f64.div" => OpShape::Plain(F64Div),
        "f64.min" => OpShape::Plain(F64Min),
        "f64.max" => OpShape::Plain(F64Max),
        "f64.copysign" => OpShape::Plain(F64Copysign),
        "i32.wrap_i64" => OpShape::Plain(I32WrapI64),
        "i32.trunc_f32_s" => OpShape::Plain(I32TruncF32S),
        "i32.trunc_f32_u" => OpShape::Plain(I32TruncF32U),
        "i32.trunc_f64_s" => OpShape::Plain(I32TruncF64S),
        "i32.trunc_f64_u" => OpShape::Plain(I32TruncF64U),
        "i64.extend_i32_s" => OpShape::Plain(I64ExtendI32S),
        "i64.extend_i32_u" => OpShape::Plain(I64ExtendI32U),
        "i64.trunc_f32_s" => OpShape::Plain(I64TruncF32S),
        "i64.trunc_f32_u" => OpShape::Plain(I64TruncF32U),
        "i64.trunc_f64_s" => OpShape::Plain(I64TruncF64S),
        "i64.trunc_f64_u" => OpShape::Plain(I64TruncF64U),
        "f32.convert_i32_s" => OpShape::Plain(F32ConvertI32S),
        "f32.convert_i32_u" => OpShape::Plain(F32ConvertI32U),
        "f32.convert_i64_s" => OpShape::Plain(F32ConvertI64S),
        "f32.convert_i64_u" => OpShape::Plain(F32ConvertI64U),
        "f32.demote_f64" => OpShape::Plain(F32DemoteF64),
        "f64.convert_i32_s" => OpShape::Plain(F64ConvertI32S),
        "f64.convert_i32_u" => OpShape::Plain(F64ConvertI32U),
        "f64.convert_i64_s" => OpShape::Plain(F64ConvertI64S),
        "f64.convert_i64_u" => OpShape::Plain(F64ConvertI64U),
        "f64.promote_f32" => OpShape::Plain(F64PromoteF32),
        "i32.reinterpret_f32" => OpShape::Plain(I32ReinterpretF32),
        "i64.reinterpret_f64" => OpShape::Plain(I64ReinterpretF64),
        "f32.reinterpret_i32" => OpShape::Plain(F32ReinterpretI32),
        "f64.reinterpret_i64" => OpShape::Plain(F64ReinterpretI64),
        "i32.extend8_s" => OpShape::Plain(I32Extend8S),
        "i32.extend16_s" => OpShape::Plain(I32Extend16S),
        "i64.extend8_s" => OpShape::Plain(I64Extend8S),
        "i64.extend16_s" => OpShape::Plain(I64Extend16S),
        "i64.extend32_s" => OpShape::Plain(I64Extend32S),
        "i32.trunc_sat_f32_s" => OpShape::Bulk(BulkOpcode::I32TruncSatF32S),
        "i32.trunc_sat_f32_u" => OpShape::Bulk(BulkOpcode::I32TruncSatF32U),
        "i32.trunc_sat_f64_s" => OpShape::Bulk(BulkOpcode::I32TruncSatF64S),
        "i32.trunc_sat_f64_u" => OpShape::Bulk(BulkOpcode::I32TruncSatF64U),
        "i64.trunc_sat_f32_s" => OpShape::Bulk(BulkOpcode::I64TruncSatF32S),
        "i64.trunc_sat_f32_u" => OpShape::Bulk(BulkOpcode::I64TruncSatF32U),
        "i64.trunc_sat_f64_s" => OpShape::Bulk(BulkOpcode::I64TruncSatF64S),
        "i64.trunc_sat_f64_u" => OpShape::Bulk(BulkOpcode::I64TruncSatF64U),
        _ => return None,
    })
}

// ---------------------------------------------------------------------
// Instruction sequence parsing (emits directly into an ExpressionBuilder)
// ---------------------------------------------------------------------

// Per-function context threaded through instruction parsing.
struct FuncCtx<'a> {
    locals: IndexSpace<'a>,
    labels: RawVec<Option<&'a str>, Global>,
}

impl<'a> FuncCtx<'a> {
    fn resolve_label(&self, idx_ref: IdxRef<'a>) -> Result<u32, Error> {
        match idx_ref {
            IdxRef::Num(n) => Ok(n),
            IdxRef::Id(name, pos) => self
                .labels
                .iter()
                .rposition(|n| *n == Some(name))
                .map(|i| (self.labels.len() - 1 - i) as u32)
                .ok_or(Error::UnknownIdentifier("label", pos)),
        }
    }
}

impl<'a> Parser<'a> {
    // Parses a `offset=N`/`align=N` memarg suffix, if present; otherwise
    // returns the natural alignment default (`natural_align`, log2 of the
    // access size) and offset zero.
    fn parse_memarg(&self, cur: &mut Cursor<'a>, natural_align: u32) -> Result<MemArg, Error> {
        let mut offset = 0u32;
        let mut align = natural_align;
        loop {
            let Some(Token { kind: TokenKind::Keyword(k), pos }) = cur.peek() else {
                break;
            };
            if let Some(rest) = k.strip_prefix("offset=") {
                offset = parse_u32_digits(rest, rest.starts_with("0x")).unwrap_or(0);
                let _ = pos;
                cur.bump();
            } else if let Some(rest) = k.strip_prefix("align=") {
                let rest = rest.strip_prefix("0x").unwrap_or(rest);
                let n = parse_u32_digits(rest, k.contains("0x")).map_err(|_| Error::InvalidLiteral(*pos))?;
                align = n.trailing_zeros();
                cur.bump();
            } else {
                break;
            }
        }
        Ok(MemArg { offset, align })
    }

    fn write<A: Allocator, T: Writable>(&self, b: &mut ExpressionBuilder<A>, v: T) -> Result<(), Error> {
        b.write(v).map_err(oom)
    }

    // Parses zero or more instructions (plain or folded) until `)` or one
    // of `terminators` is seen (without consuming it).
    fn parse_instr_seq<A: Allocator>(
        &mut self,
        cur: &mut Cursor<'a>,
        ctx: &mut FuncCtx<'a>,
        terminators: &[&str],
        b: &mut ExpressionBuilder<A>,
    ) -> Result<(), Error> {
        loop {
            if cur.at_rparen() || cur.at_end() {
                return Ok(());
            }
            if let Some(Token { kind: TokenKind::Keyword(k), .. }) = cur.peek()
                && terminators.contains(k)
            {
                return Ok(());
            }
            self.parse_instr(cur, ctx, b)?;
        }
    }

    fn parse_instr<A: Allocator>(
        &mut self,
        cur: &mut Cursor<'a>,
        ctx: &mut FuncCtx<'a>,
        b: &mut ExpressionBuilder<A>,
    ) -> Result<(), Error> {
        if cur.at_lparen() {
            cur.bump();
            self.parse_folded_instr(cur, ctx, b)?;
            cur.expect_rparen()
        } else {
            self.parse_plain_instr(cur, ctx, b)
        }
    }

    // Parses the body of a folded instruction, i.e. everything after the
    // opening `(` up to (but not including) its matching `)`.
    fn parse_folded_instr<A: Allocator>(
        &mut self,
        cur: &mut Cursor<'a>,
        ctx: &mut FuncCtx<'a>,
        b: &mut ExpressionBuilder<A>,
    ) -> Result<(), Error> {
        let Some(Token { kind: TokenKind::Keyword(word), pos }) = cur.bump() else {
            return Err(Error::Expected("instruction", cur.pos_or_last()));
        };
        let (word, pos) = (*word, *pos);

        match word {
            "block" | "loop" => {
                let label = cur.opt_id();
                let bt = self.parse_blocktype(cur)?;
                ctx.labels.try_reserve_exact(1).map_err(oom)?;
                ctx.labels.push(label);
                self.write(b, if word == "block" { Opcode::Block } else { Opcode::Loop })?;
                self.write(b, bt)?;
                self.parse_instr_seq(cur, ctx, &[], b)?;
                self.write(b, Opcode::End)?;
                ctx.labels.pop();
                Ok(())
            }
            "if" => {
                let label = cur.opt_id();
                let bt = self.parse_blocktype(cur)?;
                // Folded condition operands, if any (must come before the
                // (then ...) clause).
                while cur.at_lparen() && !is_then_or_else(cur) {
                    cur.bump();
                    self.parse_folded_instr(cur, ctx, b)?;
                    cur.expect_rparen()?;
                }
                ctx.labels.try_reserve_exact(1).map_err(oom)?;
                ctx.labels.push(label);
                self.write(b, Opcode::If)?;
                self.write(b, bt)?;
                cur.expect_lparen()?;
                cur.expect_keyword("then")?;
                self.parse_instr_seq(cur, ctx, &[], b)?;
                cur.expect_rparen()?;
                if cur.at_lparen() {
                    let save = cur.pos;
                    cur.bump();
                    if cur.at_keyword("else") {
                        cur.bump();
                        self.write(b, Opcode::Else)?;
                        self.parse_instr_seq(cur, ctx, &[], b)?;
                        cur.expect_rparen()?;
                    } else {
                        cur.pos = save;
                    }
                }
                self.write(b, Opcode::End)?;
                ctx.labels.pop();
                Ok(())
            }
            _ => {
                // Any other instruction: folded children first (each a
                // parenthesized sub-instruction), then this op's own
                // immediate operands.
                while cur.at_lparen() {
                    cur.bump();
                    self.parse_folded_instr(cur, ctx, b)?;
                    cur.expect_rparen()?;
                }
                self.emit_simple(word, pos, cur, ctx, b)
            }
        }
    }

    fn parse_plain_instr<A: Allocator>(
        &mut self,
        cur: &mut Cursor<'a>,
        ctx: &mut FuncCtx<'a>,
        b: &mut ExpressionBuilder<A>,
    ) -> Result<(), Error> {
        let Some(Token { kind: TokenKind::Keyword(word), pos }) = cur.bump() else {
            return Err(Error::Expected("instruction", cur.pos_or_last()));
        };
        let (word, pos) = (*word, *pos);

        match word {
            "block" | "loop" => {
                let label = cur.opt_id();
                let bt = self.parse_blocktype(cur)?;
                ctx.labels.try_reserve_exact(1).map_err(oom)?;
                ctx.labels.push(label);
                self.write(b, if word == "block" { Opcode::Block } else { Opcode::Loop })?;
                self.write(b, bt)?;
                self.parse_instr_seq(cur, ctx, &["end"], b)?;
                cur.expect_keyword("end")?;
                check_end_label(cur, label)?;
                self.write(b, Opcode::End)?;
                ctx.labels.pop();
                Ok(())
            }
            "if" => {
                let label = cur.opt_id();
                let bt = self.parse_blocktype(cur)?;
                ctx.labels.try_reserve_exact(1).map_err(oom)?;
                ctx.labels.push(label);
                self.write(b, Opcode::If)?;
                self.write(b, bt)?;
                self.parse_instr_seq(cur, ctx, &["else", "end"], b)?;
                if cur.at_keyword("else") {
                    cur.bump();
                    check_end_label(cur, label)?;
                    self.write(b, Opcode::Else)?;
                    self.parse_instr_seq(cur, ctx, &["end"], b)?;
                }
                cur.expect_keyword("end")?;
                check_end_label(cur, label)?;
                self.write(b, Opcode::End)?;
                ctx.labels.pop();
                Ok(())
            }
            _ => self.emit_simple(word, pos, cur, ctx, b),
        }
    }

    // Shared tail for any non-control-flow instruction: resolve its
    // mnemonic and emit the opcode plus whatever operand(s) it requires.
    fn emit_simple<A: Allocator>(
        &mut self,
        word: &'a str,
        pos: Position,
        cur: &mut Cursor<'a>,
        ctx: &mut FuncCtx<'a>,
        b: &mut ExpressionBuilder<A>,
    ) -> Result<(), Error> {
        let shape = lookup_opcode(word).ok_or(Error::InvalidMnemonic(pos))?;
        match shape {
            OpShape::Plain(op) => self.write(b, op),
            OpShape::Mem(op) => {
                let natural_align = mem_op_natural_align(op);
                let memarg = self.parse_memarg(cur, natural_align)?;
                self.write(b, op)?;
                self.write(b, memarg)
            }
            OpShape::I32Const => {
                let v = self.read_int_literal(cur, pos)?;
                self.write(b, Opcode::I32Const)?;
                self.write(b, literal_i32(v.0, v.1, v.2, pos)?)
            }
            OpShape::I64Const => {
                let v = self.read_int_literal(cur, pos)?;
                self.write(b, Opcode::I64Const)?;
                self.write(b, literal_i64(v.0, v.1, v.2, pos)?)
            }
            OpShape::F32Const => {
                let (neg, fl) = self.read_float_literal(cur, pos)?;
                self.write(b, Opcode::F32Const)?;
                self.write(b, literal_f32(neg, &fl, pos)?)
            }
            OpShape::F64Const => {
                let (neg, fl) = self.read_float_literal(cur, pos)?;
                self.write(b, Opcode::F64Const)?;
                self.write(b, literal_f64(neg, &fl, pos)?)
            }
            OpShape::LocalRef(op) => {
                let r = self.read_ref(cur)?;
                let idx = resolve_idx(r, &ctx.locals, "local")?;
                self.write(b, op)?;
                self.write(b, idx)
            }
            OpShape::GlobalRef(op) => {
                let r = self.read_ref(cur)?;
                let idx = resolve_idx(r, &self.globals, "global")?;
                self.write(b, op)?;
                self.write(b, idx)
            }
            OpShape::FuncRef => {
                let r = self.read_ref(cur)?;
                let idx = resolve_idx(r, &self.funcs, "function")?;
                self.write(b, Opcode::Call)?;
                self.write(b, idx)
            }
            OpShape::CallIndirectOp => {
                let (type_idx, _) = self.parse_typeuse(cur)?;
                self.write(b, Opcode::CallIndirect)?;
                self.write(
                    b,
                    CallIndirectOperands {
                        table: crate::types::TableIdx::new(0),
                        ty: crate::types::TypeIdx::new(type_idx),
                    },
                )
            }
            OpShape::LabelRef(op) => {
                let r = self.read_ref(cur)?;
                let depth = ctx.resolve_label(r)?;
                self.write(b, op)?;
                self.write(b, crate::types::LabelIdx::new(depth))
            }
            OpShape::BrTableOp => {
                let mut labels: RawVec<crate::types::LabelIdx, Global> = RawVec::new_in(Global);
                loop {
                    let r = self.read_ref(cur)?;
                    let depth = ctx.resolve_label(r)?;
                    push(&mut labels, crate::types::LabelIdx::new(depth))?;
                    let is_more = matches!(
                        cur.peek().map(|t| &t.kind),
                        Some(TokenKind::Id(_)) | Some(TokenKind::Int { negative: false, .. })
                    );
                    if !is_more {
                        break;
                    }
                }
                let default = labels.pop().ok_or(Error::Expected("label", pos))?;
                self.write(b, Opcode::BrTable)?;
                b.write_vec(&labels).map_err(oom)?;
                self.write(b, default)
            }
            OpShape::Bulk(sub) => {
                self.write(b, Opcode::BulkPrefix)?;
                self.write(b, sub)
            }
            OpShape::Block | OpShape::Loop | OpShape::If => unreachable!(),
        }
    }

    fn read_int_literal(
        &self,
        cur: &mut Cursor<'a>,
        pos: Position,
    ) -> Result<(bool, &'a str, bool), Error> {
        match cur.bump() {
            Some(Token { kind: TokenKind::Int { negative, text, hex }, .. }) => Ok((*negative, text, *hex)),
            _ => Err(Error::Expected("integer literal", pos)),
        }
    }

    fn read_float_literal(
        &self,
        cur: &mut Cursor<'a>,
        pos: Position,
    ) -> Result<(bool, FloatLiteral<'a>), Error> {
        match cur.bump() {
            Some(Token { kind: TokenKind::Float(fl), .. }) => Ok((float_literal_negative(fl), *fl)),
            Some(Token { kind: TokenKind::Int { negative, text, hex }, .. }) => {
                Ok((*negative, FloatLiteral::Value { text, hex: *hex }))
            }
            _ => Err(Error::Expected("float literal", pos)),
        }
    }
}

fn float_literal_negative(fl: &FloatLiteral<'_>) -> bool {
    match fl {
        FloatLiteral::Value { .. } => false,
        FloatLiteral::Inf { negative }
        | FloatLiteral::Nan { negative }
        | FloatLiteral::NanCanonical { negative }
        | FloatLiteral::NanArithmetic { negative }
        | FloatLiteral::NanPayload { negative, .. } => *negative,
    }
}

fn is_then_or_else(cur: &Cursor<'_>) -> bool {
    matches!(
        cur.tokens.get(cur.pos + 1).map(|t| &t.kind),
        Some(TokenKind::Keyword("then")) | Some(TokenKind::Keyword("else"))
    )
}

fn check_end_label<'a>(cur: &mut Cursor<'a>, label: Option<&'a str>) -> Result<(), Error> {
    if let Some(Token { kind: TokenKind::Id(name), pos }) = cur.peek() {
        let (name, pos) = (*name, *pos);
        if Some(name) != label {
            return Err(Error::LabelMismatch(pos));
        }
        cur.bump();
    }
    Ok(())
}

fn mem_op_natural_align(op: Opcode) -> u32 {
    use Opcode::*;
    match op {
        I32Load8S | I32Load8U | I64Load8S | I64Load8U | I32Store8 | I64Store8 => 0,
        I32Load16S | I32Load16U | I64Load16S | I64Load16U | I32Store16 | I64Store16 => 1,
        I32Load | F32Load | I64Load32S | I64Load32U | I32Store | F32Store | I64Store32 => 2,
        I64Load | F64Load | I64Store | F64Store => 3,
        _ => 0,
    }
}

// ---------------------------------------------------------------------
// Module-level field parsing (Phase A: declarations, B: bodies)
// ---------------------------------------------------------------------

struct ExportClauses {
    names: RawVec<RawVec<u8, Global>, Global>,
}

impl<'a> Parser<'a> {
    // Parses the `id? (export "name")*` prefix common to func/table/
    // memory/global fields. Returns the id and the export names (deferred
    // registration happens once the caller knows this field's assigned
    // index).
    fn parse_export_prefix(&mut self, cur: &mut Cursor<'a>) -> Result<(Option<&'a str>, ExportClauses), Error> {
        let id = cur.opt_id();
        let mut names = RawVec::new_in(Global);
        while cur.at_lparen() {
            let save = cur.pos;
            cur.bump();
            if cur.at_keyword("export") {
                cur.bump();
                let name = self.read_string_bytes(cur)?;
                cur.expect_rparen()?;
                push(&mut names, name)?;
            } else {
                cur.pos = save;
                break;
            }
        }
        Ok((id, ExportClauses { names }))
    }

    // Strings are lexed into an already-unescaped byte buffer owned by the
    // token; this clones it out for use past the token stream's lifetime.
    fn read_string_bytes(&self, cur: &mut Cursor<'a>) -> Result<RawVec<u8, Global>, Error> {
        match cur.bump() {
            Some(Token { kind: TokenKind::Str(bytes), .. }) => Ok(bytes.clone()),
            other => Err(Error::Expected("string", other.map(|t| t.pos).unwrap_or(Position::START))),
        }
    }

    fn parse_inline_import(
        &self,
        cur: &mut Cursor<'a>,
    ) -> Result<Option<(RawVec<u8, Global>, RawVec<u8, Global>)>, Error> {
        if !cur.at_lparen() {
            return Ok(None);
        }
        let save = cur.pos;
        cur.bump();
        if cur.at_keyword("import") {
            cur.bump();
            let module = self.read_string_bytes(cur)?;
            let field = self.read_string_bytes(cur)?;
            cur.expect_rparen()?;
            Ok(Some((module, field)))
        } else {
            cur.pos = save;
            Ok(None)
        }
    }

    fn parse_globaltype(&mut self, cur: &mut Cursor<'a>) -> Result<GlobalType, Error> {
        if cur.at_lparen() {
            let save = cur.pos;
            cur.bump();
            if cur.at_keyword("mut") {
                cur.bump();
                let value = self.parse_valtype(cur)?;
                cur.expect_rparen()?;
                return Ok(GlobalType { value, mutability: GlobalTypeMutability::Var });
            }
            cur.pos = save;
        }
        let value = self.parse_valtype(cur)?;
        Ok(GlobalType { value, mutability: GlobalTypeMutability::Const })
    }

    // Reads a plain (non-parenthesized) list of func/table/mem index-or-id
    // references, up to the enclosing `)`.
    fn parse_ref_list(&self, cur: &mut Cursor<'a>) -> Result<RawVec<IdxRef<'a>, Global>, Error> {
        let mut refs = RawVec::new_in(Global);
        while !cur.at_rparen() {
            push(&mut refs, self.read_ref(cur)?)?;
        }
        Ok(refs)
    }

    fn parse_datastring(&self, cur: &mut Cursor<'a>) -> Result<RawVec<u8, Global>, Error> {
        let mut bytes = RawVec::new_in(Global);
        while !cur.at_rparen() {
            let chunk = self.read_string_bytes(cur)?;
            for b in chunk.iter().copied() {
                push(&mut bytes, b)?;
            }
        }
        Ok(bytes)
    }

    // Consumes `(offset instr*)` or its bare-folded-instruction shorthand,
    // returning the absolute token range of the instruction sequence
    // inside (excluding the `offset` keyword, if present).
    fn parse_offset_expr(&self, cur: &mut Cursor<'a>) -> Result<TokenRange, Error> {
        cur.expect_lparen()?;
        if cur.at_keyword("offset") {
            cur.bump();
        }
        cur.skip_to_matching_rparen()
    }

    // -------------------------------------------------------------
    // Phase A: type/import/definition-header field processing
    // -------------------------------------------------------------

    fn parse_type_field(&mut self, tokens: &'a [Token<'a>], field: &FieldSpan<'a>) -> Result<(), Error> {
        let mut cur = Cursor::at(tokens, field.range.0);
        let id = cur.opt_id();
        cur.expect_lparen()?;
        cur.expect_keyword("func")?;

        let mut params = RawVec::new_in(Global);
        while cur.at_lparen() {
            let save = cur.pos;
            cur.bump();
            if cur.at_keyword("param") {
                cur.bump();
                let pid = cur.opt_id();
                if pid.is_some() {
                    push(&mut params, self.parse_valtype(&mut cur)?)?;
                } else {
                    while !cur.at_rparen() {
                        push(&mut params, self.parse_valtype(&mut cur)?)?;
                    }
                }
                cur.expect_rparen()?;
            } else {
                cur.pos = save;
                break;
            }
        }
        let mut results = RawVec::new_in(Global);
        while cur.at_lparen() {
            let save = cur.pos;
            cur.bump();
            if cur.at_keyword("result") {
                cur.bump();
                while !cur.at_rparen() {
                    push(&mut results, self.parse_valtype(&mut cur)?)?;
                }
                cur.expect_rparen()?;
            } else {
                cur.pos = save;
                break;
            }
        }
        cur.expect_rparen()?;

        self.types.ids.push_named(id, "type", field.pos)?;
        push(&mut self.types.sigs, Signature { params, results })?;
        Ok(())
    }

    fn parse_standalone_import(
        &mut self,
        tokens: &'a [Token<'a>],
        field: &FieldSpan<'a>,
        requests: &mut RawVec<ImportRequest<'a>, Global>,
    ) -> Result<(), Error> {
        let mut cur = Cursor::at(tokens, field.range.0);
        let module = self.read_string_bytes(&mut cur)?;
        let modfield = self.read_string_bytes(&mut cur)?;
        cur.expect_lparen()?;
        let Some(Token { kind: TokenKind::Keyword(kind_word), .. }) = cur.bump() else {
            return Err(Error::Expected("import kind", field.pos));
        };
        let kind_word = *kind_word;
        let id = cur.opt_id();
        let (descriptor, sort) = match kind_word {
            "func" => {
                let (type_idx, _) = self.parse_typeuse(&mut cur)?;
                (ImportDescriptor::Function(crate::types::TypeIdx::new(type_idx)), ExportSort::Function)
            }
            "table" => {
                let limits = self.parse_limits(&mut cur)?;
                let reftype = self.parse_reftype(&mut cur)?;
                (ImportDescriptor::Table(TableType { reftype, limits }), ExportSort::Table)
            }
            "memory" => {
                let limits = self.parse_limits(&mut cur)?;
                (ImportDescriptor::Memory(MemType::new(limits)), ExportSort::Memory)
            }
            "global" => {
                let ty = self.parse_globaltype(&mut cur)?;
                (ImportDescriptor::Global(ty), ExportSort::Global)
            }
            _ => return Err(Error::Expected("import kind", field.pos)),
        };
        cur.expect_rparen()?;
        cur.expect_rparen()?;
        push(
            requests,
            ImportRequest {
                id,
                pos: field.pos,
                module,
                field: modfield,
                exports: RawVec::new_in(Global),
                descriptor,
                sort,
            },
        )
    }

    // Handles `func`/`table`/`memory`/`global` fields, routing each to
    // either the import-request list (if it carries an inline `(import
    // ...)` clause) or the definition-request list.
    fn parse_def_or_inline_import_field(
        &mut self,
        tokens: &'a [Token<'a>],
        field: &FieldSpan<'a>,
        import_requests: &mut RawVec<ImportRequest<'a>, Global>,
        def_requests: &mut RawVec<DefRequest<'a>, Global>,
    ) -> Result<(), Error> {
        let mut cur = Cursor::at(tokens, field.range.0);
        let (id, exports) = self.parse_export_prefix(&mut cur)?;
        let inline_import = self.parse_inline_import(&mut cur)?;

        let sort = match field.keyword {
            "func" => ExportSort::Function,
            "table" => ExportSort::Table,
            "memory" => ExportSort::Memory,
            "global" => ExportSort::Global,
            _ => unreachable!(),
        };

        if let Some((module, modfield)) = inline_import {
            let descriptor = match field.keyword {
                "func" => {
                    let (type_idx, _) = self.parse_typeuse(&mut cur)?;
                    ImportDescriptor::Function(crate::types::TypeIdx::new(type_idx))
                }
                "table" => {
                    let limits = self.parse_limits(&mut cur)?;
                    let reftype = self.parse_reftype(&mut cur)?;
                    ImportDescriptor::Table(TableType { reftype, limits })
                }
                "memory" => {
                    let limits = self.parse_limits(&mut cur)?;
                    ImportDescriptor::Memory(MemType::new(limits))
                }
                "global" => ImportDescriptor::Global(self.parse_globaltype(&mut cur)?),
                _ => unreachable!(),
            };
            return push(
                import_requests,
                ImportRequest { id, pos: field.pos, module, field: modfield, exports: exports.names, descriptor, sort },
            );
        }

        let kind = match field.keyword {
            "func" => {
                let (type_idx, param_names) = self.parse_typeuse(&mut cur)?;
                let param_count = param_names.len() as u32;
                let mut locals = RawVec::new_in(Global);
                {
                    let sig = &self.types.sigs[type_idx as usize];
                    for (name, ty) in param_names.into_iter().zip(sig.params.iter().copied()) {
                        push(&mut locals, (name, ty))?;
                    }
                }
                while cur.at_lparen() {
                    let save = cur.pos;
                    cur.bump();
                    if cur.at_keyword("local") {
                        cur.bump();
                        let lid = cur.opt_id();
                        if lid.is_some() {
                            let ty = self.parse_valtype(&mut cur)?;
                            push(&mut locals, (lid, ty))?;
                        } else {
                            while !cur.at_rparen() {
                                let ty = self.parse_valtype(&mut cur)?;
                                push(&mut locals, (None, ty))?;
                            }
                        }
                        cur.expect_rparen()?;
                    } else {
                        cur.pos = save;
                        break;
                    }
                }
                if locals.len() - param_count as usize > MAX_LOCALS_PER_FUNCTION {
                    return Err(Error::IndexOutOfRange("local", field.pos));
                }
                let body = (cur.pos, field.range.1);
                DefKind::Func { type_idx, param_count, locals, body }
            }
            "table" => {
                if cur.at_lparen() {
                    let save = cur.pos;
                    cur.bump();
                    if cur.at_keyword("elem") {
                        cur.bump();
                        let funcs = self.parse_ref_list(&mut cur)?;
                        cur.expect_rparen()?;
                        let n = funcs.len() as u32;
                        let limits = Limits { min: n, max: Some(n) };
                        let reftype = RefType::Func;
                        DefKind::Table { ty: TableType { reftype, limits }, inline_elem: Some(funcs) }
                    } else {
                        cur.pos = save;
                        let limits = self.parse_limits(&mut cur)?;
                        let reftype = self.parse_reftype(&mut cur)?;
                        DefKind::Table { ty: TableType { reftype, limits }, inline_elem: None }
                    }
                } else {
                    let limits = self.parse_limits(&mut cur)?;
                    let reftype = self.parse_reftype(&mut cur)?;
                    DefKind::Table { ty: TableType { reftype, limits }, inline_elem: None }
                }
            }
            "memory" => {
                if cur.at_lparen() {
                    let save = cur.pos;
                    cur.bump();
                    if cur.at_keyword("data") {
                        cur.bump();
                        let bytes = self.parse_datastring(&mut cur)?;
                        cur.expect_rparen()?;
                        let pages = bytes.len().div_ceil(MemType::PAGE_SIZE) as u32;
                        let limits = Limits { min: pages, max: Some(pages) };
                        DefKind::Memory { ty: MemType::new(limits), inline_data: Some(bytes) }
                    } else {
                        cur.pos = save;
                        let limits = self.parse_limits(&mut cur)?;
                        DefKind::Memory { ty: MemType::new(limits), inline_data: None }
                    }
                } else {
                    let limits = self.parse_limits(&mut cur)?;
                    DefKind::Memory { ty: MemType::new(limits), inline_data: None }
                }
            }
            "global" => {
                let ty = self.parse_globaltype(&mut cur)?;
                let init = (cur.pos, field.range.1);
                DefKind::Global { ty, init }
            }
            _ => unreachable!(),
        };

        push(def_requests, DefRequest { id, pos: field.pos, exports: exports.names, sort, kind })
    }
}

struct ImportRequest<'a> {
    id: Option<&'a str>,
    pos: Position,
    module: RawVec<u8, Global>,
    field: RawVec<u8, Global>,
    exports: RawVec<RawVec<u8, Global>, Global>,
    descriptor: ImportDescriptor,
    sort: ExportSort,
}

enum DefKind<'a> {
    Func {
        type_idx: u32,
        param_count: u32,
        locals: RawVec<(Option<&'a str>, ValType), Global>,
        body: TokenRange,
    },
    Table {
        ty: TableType,
        inline_elem: Option<RawVec<IdxRef<'a>, Global>>,
    },
    Memory {
        ty: MemType,
        inline_data: Option<RawVec<u8, Global>>,
    },
    Global {
        ty: GlobalType,
        init: TokenRange,
    },
}

struct DefRequest<'a> {
    id: Option<&'a str>,
    pos: Position,
    exports: RawVec<RawVec<u8, Global>, Global>,
    sort: ExportSort,
    kind: DefKind<'a>,
}

const SORTS: [ExportSort; 4] =
    [ExportSort::Function, ExportSort::Table, ExportSort::Memory, ExportSort::Global];

fn sort_name(sort: ExportSort) -> &'static str {
    match sort {
        ExportSort::Function => "func",
        ExportSort::Table => "table",
        ExportSort::Memory => "memory",
        ExportSort::Global => "global",
    }
}

impl<'a> Parser<'a> {
    // Registers every pending import, grouped by kind and in source order
    // within each kind, before any definition of that kind is registered
    // (see assign_defs). This is the module-wide index-space convention the
    // validator assumes.
    fn assign_imports(&mut self) -> Result<(), Error> {
        let requests = core::mem::replace(&mut self.import_requests, RawVec::new_in(Global));
        for &sort in &SORTS {
            for req in requests.iter().filter(|r| r.sort == sort) {
                let idx = match sort {
                    ExportSort::Function => self.funcs.push_named(req.id, "func", req.pos)?,
                    ExportSort::Table => self.tables.push_named(req.id, "table", req.pos)?,
                    ExportSort::Memory => self.mems.push_named(req.id, "memory", req.pos)?,
                    ExportSort::Global => self.globals.push_named(req.id, "global", req.pos)?,
                };
                push(
                    &mut self.resolved_imports,
                    PendingImport {
                        module: req.module.clone(),
                        field: req.field.clone(),
                        descriptor: req.descriptor,
                    },
                )?;
                for name in req.exports.iter() {
                    push(
                        &mut self.exports,
                        PendingExport { field: name.clone(), sort, target: IdxRef::Num(idx) },
                    )?;
                }
            }
        }
        Ok(())
    }

    // Registers every pending definition, grouped by kind the same way as
    // assign_imports, continuing each kind's index space where its imports
    // left off.
    fn assign_defs(&mut self) -> Result<(), Error> {
        let requests = core::mem::replace(&mut self.def_requests, RawVec::new_in(Global));
        for &sort in &SORTS {
            for req in requests.iter().filter(|r| r.sort == sort) {
                let idx = match sort {
                    ExportSort::Function => self.funcs.push_named(req.id, sort_name(sort), req.pos)?,
                    ExportSort::Table => self.tables.push_named(req.id, sort_name(sort), req.pos)?,
                    ExportSort::Memory => self.mems.push_named(req.id, sort_name(sort), req.pos)?,
                    ExportSort::Global => self.globals.push_named(req.id, sort_name(sort), req.pos)?,
                };
                match &req.kind {
                    DefKind::Func { type_idx, param_count, locals, body } => {
                        push(
                            &mut self.func_defs,
                            PendingFunc {
                                type_idx: *type_idx,
                                param_count: *param_count,
                                locals: locals.clone(),
                                body: *body,
                            },
                        )?;
                    }
                    DefKind::Table { ty, inline_elem } => {
                        push(&mut self.table_defs, *ty)?;
                        if let Some(funcs) = inline_elem {
                            push(
                                &mut self.immediate_elems,
                                ImmediateElem { table_idx: idx, funcs: funcs.clone() },
                            )?;
                        }
                    }
                    DefKind::Memory { ty, inline_data } => {
                        push(&mut self.mem_defs, *ty)?;
                        if let Some(bytes) = inline_data {
                            push(
                                &mut self.immediate_datas,
                                ImmediateData { memory_idx: idx, bytes: bytes.clone() },
                            )?;
                        }
                    }
                    DefKind::Global { ty, init } => {
                        push(&mut self.global_defs, PendingGlobal { ty: *ty, init: *init })?;
                    }
                }
                for name in req.exports.iter() {
                    push(
                        &mut self.exports,
                        PendingExport { field: name.clone(), sort, target: IdxRef::Num(idx) },
                    )?;
                }
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------
    // Phase B: standalone export/start/elem/data fields
    // -------------------------------------------------------------

    fn parse_standalone_export(&mut self, tokens: &'a [Token<'a>], field: &FieldSpan<'a>) -> Result<(), Error> {
        let mut cur = Cursor::at(tokens, field.range.0);
        let name = self.read_string_bytes(&mut cur)?;
        cur.expect_lparen()?;
        let Some(Token { kind: TokenKind::Keyword(kind_word), .. }) = cur.bump() else {
            return Err(Error::Expected("export kind", field.pos));
        };
        let sort = match *kind_word {
            "func" => ExportSort::Function,
            "table" => ExportSort::Table,
            "memory" => ExportSort::Memory,
            "global" => ExportSort::Global,
            _ => return Err(Error::Expected("export kind", field.pos)),
        };
        let target = self.read_ref(&mut cur)?;
        cur.expect_rparen()?;
        cur.expect_rparen()?;
        push(&mut self.exports, PendingExport { field: name, sort, target })
    }

    fn parse_start_field(&mut self, tokens: &'a [Token<'a>], field: &FieldSpan<'a>) -> Result<(), Error> {
        let mut cur = Cursor::at(tokens, field.range.0);
        self.start = Some(self.read_ref(&mut cur)?);
        Ok(())
    }

    fn parse_elem_field(&mut self, tokens: &'a [Token<'a>], field: &FieldSpan<'a>) -> Result<(), Error> {
        let mut cur = Cursor::at(tokens, field.range.0);
        let table = if cur.at_lparen() || matches!(cur.peek().map(|t| &t.kind), Some(TokenKind::Int { .. })) {
            // A bare index/id here names the target table; otherwise the
            // offset clause/shorthand follows directly.
            if let Some(Token { kind: TokenKind::Id(_) | TokenKind::Int { .. }, .. }) = cur.peek() {
                self.read_ref(&mut cur)?
            } else {
                IdxRef::Num(0)
            }
        } else {
            IdxRef::Num(0)
        };
        let offset = self.parse_offset_expr(&mut cur)?;
        let funcs = self.parse_ref_list(&mut cur)?;
        push(&mut self.elems, PendingElem { table, offset, funcs })
    }

    fn parse_data_field(&mut self, tokens: &'a [Token<'a>], field: &FieldSpan<'a>) -> Result<(), Error> {
        let mut cur = Cursor::at(tokens, field.range.0);
        let memory = if let Some(Token { kind: TokenKind::Id(_) | TokenKind::Int { .. }, .. }) = cur.peek() {
            self.read_ref(&mut cur)?
        } else {
            IdxRef::Num(0)
        };
        let offset = self.parse_offset_expr(&mut cur)?;
        let bytes = self.parse_datastring(&mut cur)?;
        push(&mut self.datas, PendingData { memory, offset, bytes })
    }

    // -------------------------------------------------------------
    // Phase B: deferred instruction-sequence resolution
    // -------------------------------------------------------------

    // Parses a deferred token range as a bare instruction sequence (no
    // enclosing parens), emitting a trailing top-level `end`, the way the
    // binary decoder's transcode_expression expects to find one.
    fn resolve_expr<A: Allocator>(
        &mut self,
        tokens: &'a [Token<'a>],
        range: TokenRange,
        ctx: &mut FuncCtx<'a>,
        alloc: A,
    ) -> Result<Expression<A>, Error> {
        let mut cur = Cursor::at(tokens, range.0);
        let mut builder = ExpressionBuilder::new(alloc);
        self.parse_instr_seq(&mut cur, ctx, &[], &mut builder)?;
        self.write(&mut builder, Opcode::End)?;
        Ok(builder.finalize())
    }
}

// ---------------------------------------------------------------------
// Final-allocator construction helpers
// ---------------------------------------------------------------------

fn name_in<A: Allocator>(bytes: &[u8], alloc: A) -> Result<crate::types::Name<A>, Error> {
    let mut copy = crate::core_compat::vec::Vec::new_in(alloc.clone());
    copy.try_reserve_exact(bytes.len()).map_err(oom)?;
    copy.extend_from_slice(bytes);
    let ptr = crate::core_compat::boxed::Box::into_raw(copy.into_boxed_slice());
    // Safety: the WAT string escape rules guarantee the decoded bytes of a
    // name literal are valid UTF-8.
    let boxed_str = unsafe { crate::core_compat::boxed::Box::from_raw_in(ptr as *mut str, alloc) };
    Ok(crate::types::Name::new(boxed_str))
}

fn copy_into<T: Clone, A: Allocator>(
    src: &[T],
    alloc: A,
) -> Result<crate::core_compat::vec::Vec<T, A>, Error> {
    let mut v = crate::core_compat::vec::Vec::new_in(alloc);
    v.try_reserve_exact(src.len()).map_err(oom)?;
    v.extend_from_slice(src);
    Ok(v)
}

// ---------------------------------------------------------------------
// Top-level field scanning and module assembly
// ---------------------------------------------------------------------

// Advances past the contents of a single top-level field (whose opening `(`
// has already been consumed), returning its keyword and absolute token span.
fn scan_field<'a>(cur: &mut Cursor<'a>) -> Result<FieldSpan<'a>, Error> {
    let pos = cur.pos_or_last();
    let Some(Token { kind: TokenKind::Keyword(keyword), .. }) = cur.bump() else {
        return Err(Error::Expected("field keyword", pos));
    };
    let keyword = *keyword;
    let range = cur.skip_to_matching_rparen()?;
    Ok(FieldSpan { keyword, pos, range })
}

fn scan_module_fields<'a>(
    tokens: &'a [Token<'a>],
) -> Result<RawVec<FieldSpan<'a>, Global>, Error> {
    let mut cur = Cursor::new(tokens);
    cur.expect_lparen()?;
    cur.expect_keyword("module")?;
    cur.opt_id();
    let mut fields = RawVec::new_in(Global);
    while !cur.at_rparen() {
        cur.expect_lparen()?;
        push(&mut fields, scan_field(&mut cur)?)?;
    }
    cur.expect_rparen()?;
    if !cur.at_end() {
        return Err(Error::Expected("end of input", cur.pos_or_last()));
    }
    Ok(fields)
}

/// Parses a complete WebAssembly text-format module.
pub(crate) fn parse_module<A: Allocator>(text: &str, alloc: A) -> Result<Module<A>, Error> {
    let mut lexer = Lexer::new(text);
    let mut tokens: RawVec<Token<'_>, Global> = RawVec::new_in(Global);
    while let Some(token) = lexer.next()? {
        push(&mut tokens, token)?;
    }
    let tokens: &[Token<'_>] = &tokens;

    let fields = scan_module_fields(tokens)?;
    let mut parser = Parser::new();

    // Phase A, pass 1: type declarations, establishing the type index
    // space that typeuse resolution in every other field depends on.
    for field in fields.iter() {
        if field.keyword == "type" {
            parser.parse_type_field(tokens, field)?;
        }
    }

    // Phase A, pass 2: import and definition headers, collected as
    // requests (not yet index-assigned).
    for field in fields.iter() {
        match field.keyword {
            "type" => {}
            "import" => {
                let mut import_requests = core::mem::replace(&mut parser.import_requests, RawVec::new_in(Global));
                let result = parser.parse_standalone_import(tokens, field, &mut import_requests);
                parser.import_requests = import_requests;
                result?;
            }
            "func" | "table" | "memory" | "global" => {
                let mut import_requests = core::mem::replace(&mut parser.import_requests, RawVec::new_in(Global));
                let mut def_requests = core::mem::replace(&mut parser.def_requests, RawVec::new_in(Global));
                let result =
                    parser.parse_def_or_inline_import_field(tokens, field, &mut import_requests, &mut def_requests);
                parser.import_requests = import_requests;
                parser.def_requests = def_requests;
                result?;
            }
            "export" | "start" | "elem" | "data" => {}
            other => return Err(Error::Expected(other, field.pos)),
        }
    }

    parser.assign_imports()?;
    parser.assign_defs()?;

    // Phase B: fields (and sub-parts of already-processed fields) that
    // forward-reference the now-complete index spaces.
    for field in fields.iter() {
        match field.keyword {
            "export" => parser.parse_standalone_export(tokens, field)?,
            "start" => parser.parse_start_field(tokens, field)?,
            "elem" => parser.parse_elem_field(tokens, field)?,
            "data" => parser.parse_data_field(tokens, field)?,
            _ => {}
        }
    }

    assemble_module(parser, tokens, alloc)
}

fn assemble_module<'a, A: Allocator>(
    mut parser: Parser<'a>,
    tokens: &'a [Token<'a>],
    alloc: A,
) -> Result<Module<A>, Error> {
    // Type section.
    let mut typesec = crate::core_compat::vec::Vec::new_in(alloc.clone());
    typesec.try_reserve_exact(parser.types.sigs.len()).map_err(oom)?;
    for sig in parser.types.sigs.iter() {
        let parameters = copy_into(&sig.params, alloc.clone())?;
        let results = ResultType::new(copy_into(&sig.results, alloc.clone())?);
        typesec.push(FunctionType { parameters, results });
    }

    // Import section.
    let mut importsec = crate::core_compat::vec::Vec::new_in(alloc.clone());
    importsec.try_reserve_exact(parser.resolved_imports.len()).map_err(oom)?;
    for import in parser.resolved_imports.iter() {
        importsec.push(Import {
            module: name_in(&import.module, alloc.clone())?,
            field: name_in(&import.field, alloc.clone())?,
            descriptor: import.descriptor,
        });
    }

    // Function/table/memory sections (definitions only).
    let mut funcsec = crate::core_compat::vec::Vec::new_in(alloc.clone());
    funcsec.try_reserve_exact(parser.func_defs.len()).map_err(oom)?;
    for func in parser.func_defs.iter() {
        funcsec.push(crate::types::TypeIdx::new(func.type_idx));
    }
    let tablesec = copy_into(&parser.table_defs, alloc.clone())?;
    let memsec = copy_into(&parser.mem_defs, alloc.clone())?;

    // Function bodies, global initializers, and segment offsets all
    // forward-reference the (now complete) index spaces, so are resolved
    // here in a single Phase B sweep.
    let mut codesec = crate::core_compat::vec::Vec::new_in(alloc.clone());
    codesec.try_reserve_exact(parser.func_defs.len()).map_err(oom)?;
    for i in 0..parser.func_defs.len() {
        let mut ctx = FuncCtx { locals: IndexSpace::new(), labels: RawVec::new_in(Global) };
        let (body, param_count) = {
            let func = &parser.func_defs[i];
            for (name, _ty) in func.locals.iter() {
                ctx.locals.push_named(*name, "local", Position::START)?;
            }
            (func.body, func.param_count)
        };
        let mut locals = crate::core_compat::vec::Vec::new_in(alloc.clone());
        {
            let func = &parser.func_defs[i];
            let local_decls = &func.locals.as_slice()[param_count as usize..];
            locals.try_reserve_exact(local_decls.len()).map_err(oom)?;
            for (_, ty) in local_decls.iter() {
                locals.push(default_local(*ty));
            }
        }
        let code = parser.resolve_expr(tokens, body, &mut ctx, alloc.clone())?;
        codesec.push(Function { locals: Locals::new(locals), code });
    }

    let mut globalsec = crate::core_compat::vec::Vec::new_in(alloc.clone());
    globalsec.try_reserve_exact(parser.global_defs.len()).map_err(oom)?;
    for i in 0..parser.global_defs.len() {
        let (ty, init_range) = {
            let global = &parser.global_defs[i];
            (global.ty, global.init)
        };
        let mut ctx = FuncCtx { locals: IndexSpace::new(), labels: RawVec::new_in(Global) };
        let init = parser.resolve_expr(tokens, init_range, &mut ctx, alloc.clone())?;
        globalsec.push(WasmGlobal { ty, init });
    }

    // Export section.
    let mut exportsec = crate::core_compat::vec::Vec::new_in(alloc.clone());
    exportsec.try_reserve_exact(parser.exports.len()).map_err(oom)?;
    for export in parser.exports.iter() {
        let space = match export.sort {
            ExportSort::Function => &parser.funcs,
            ExportSort::Table => &parser.tables,
            ExportSort::Memory => &parser.mems,
            ExportSort::Global => &parser.globals,
        };
        let idx = resolve_idx(export.target, space, sort_name(export.sort))?;
        let descriptor = match export.sort {
            ExportSort::Function => ExportDescriptor::Function(crate::types::FuncIdx::new(idx)),
            ExportSort::Table => ExportDescriptor::Table(crate::types::TableIdx::new(idx)),
            ExportSort::Memory => ExportDescriptor::Memory(crate::types::MemIdx::new(idx)),
            ExportSort::Global => ExportDescriptor::Global(crate::types::GlobalIdx::new(idx)),
        };
        exportsec.push(Export { field: name_in(&export.field, alloc.clone())?, descriptor });
    }

    // Start section.
    let startsec = match parser.start {
        Some(idx_ref) => {
            let idx = resolve_idx(idx_ref, &parser.funcs, "func")?;
            Some(crate::types::StartSection::new(crate::types::FuncIdx::new(idx)))
        }
        None => None,
    };

    // Element section: deferred `(elem ...)` fields plus inline table
    // abbreviations, both now resolvable.
    let mut elemsec = crate::core_compat::vec::Vec::new_in(alloc.clone());
    for immediate in parser.immediate_elems.iter() {
        let mut funcs = crate::core_compat::vec::Vec::new_in(alloc.clone());
        funcs.try_reserve_exact(immediate.funcs.len()).map_err(oom)?;
        for f in immediate.funcs.iter() {
            funcs.push(crate::types::FuncIdx::new(resolve_idx(*f, &parser.funcs, "func")?));
        }
        let mut builder = ExpressionBuilder::new(alloc.clone());
        parser.write(&mut builder, Opcode::I32Const)?;
        parser.write(&mut builder, 0i32)?;
        parser.write(&mut builder, Opcode::End)?;
        elemsec.push(crate::types::ElementSegment {
            table: crate::types::TableIdx::new(immediate.table_idx),
            offset: builder.finalize(),
            funcs,
        });
    }
    for i in 0..parser.elems.len() {
        let (table_ref, offset_range) = {
            let elem = &parser.elems[i];
            (elem.table, elem.offset)
        };
        let table_idx = resolve_idx(table_ref, &parser.tables, "table")?;
        let mut ctx = FuncCtx { locals: IndexSpace::new(), labels: RawVec::new_in(Global) };
        let offset = parser.resolve_expr(tokens, offset_range, &mut ctx, alloc.clone())?;
        let mut funcs = crate::core_compat::vec::Vec::new_in(alloc.clone());
        let func_refs = parser.elems[i].funcs.clone();
        funcs.try_reserve_exact(func_refs.len()).map_err(oom)?;
        for f in func_refs.iter() {
            funcs.push(crate::types::FuncIdx::new(resolve_idx(*f, &parser.funcs, "func")?));
        }
        elemsec.push(crate::types::ElementSegment {
            table: crate::types::TableIdx::new(table_idx),
            offset,
            funcs,
        });
    }

    // Data section: deferred `(data ...)` fields plus inline memory
    // abbreviations.
    let mut datasec = crate::core_compat::vec::Vec::new_in(alloc.clone());
    for immediate in parser.immediate_datas.iter() {
        let mut builder = ExpressionBuilder::new(alloc.clone());
        parser.write(&mut builder, Opcode::I32Const)?;
        parser.write(&mut builder, 0i32)?;
        parser.write(&mut builder, Opcode::End)?;
        datasec.push(crate::types::DataSegment {
            memory: crate::types::MemIdx::new(immediate.memory_idx),
            offset: builder.finalize(),
            init: copy_into(&immediate.bytes, alloc.clone())?,
        });
    }
    for i in 0..parser.datas.len() {
        let (memory_ref, offset_range) = {
            let data = &parser.datas[i];
            (data.memory, data.offset)
        };
        let memory_idx = resolve_idx(memory_ref, &parser.mems, "memory")?;
        let mut ctx = FuncCtx { locals: IndexSpace::new(), labels: RawVec::new_in(Global) };
        let offset = parser.resolve_expr(tokens, offset_range, &mut ctx, alloc.clone())?;
        let bytes = parser.datas[i].bytes.clone();
        datasec.push(crate::types::DataSegment {
            memory: crate::types::MemIdx::new(memory_idx),
            offset,
            init: copy_into(&bytes, alloc.clone())?,
        });
    }
    let datacountsec = if datasec.is_empty() { None } else { Some(datasec.len() as u32) };

    Ok(Module {
        version: crate::types::Version::V1,
        typesec: crate::types::TypeSection::new(typesec),
        importsec: ImportSection::new(importsec),
        funcsec: crate::types::FunctionSection::new(funcsec),
        tablesec: crate::types::TableSection::new(tablesec),
        memsec: crate::types::MemorySection::new(memsec),
        globalsec: crate::types::GlobalSection::new(globalsec),
        exportsec: ExportSection::new(exportsec),
        startsec,
        elemsec: crate::types::ElementSection::new(elemsec),
        datacountsec,
        codesec: crate::types::CodeSection::new(codesec),
        datasec: crate::types::DataSection::new(datasec),
    })
}

fn default_local(ty: ValType) -> Local {
    match ty {
        ValType::I32 => Local::I32(0),
        ValType::I64 => Local::I64(0),
        ValType::F32 => Local::F32(0.0),
        ValType::F64 => Local::F64(0.0),
    }
}
