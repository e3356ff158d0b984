// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! End-to-end scenarios driving [`wazm::link::Builder`] against text-format
//! modules, covering the scenarios a caller actually exercises: parsing,
//! linking, instantiation, global/memory access, and traps.

use wazm::core_compat::alloc::Global;
use wazm::core_compat::vec::Vec as RawVec;
use wazm::link::{Builder, Error};
use wazm::runtime::{HostFunction, Trap, Value};
use wazm::types::{FunctionType, ResultType, ValType};

fn func_type(params: &[ValType], results: &[ValType]) -> FunctionType<Global> {
    let mut p = RawVec::new_in(Global);
    p.extend_from_slice(params);
    let mut r = RawVec::new_in(Global);
    r.extend_from_slice(results);
    FunctionType {
        parameters: p,
        results: ResultType::new(r),
    }
}

#[test]
fn fibonacci() {
    let src = r#"
        (module
          (func $fib (param $n i32) (result i32)
            (if (result i32) (i32.lt_s (local.get $n) (i32.const 2))
              (then (i32.const 1))
              (else
                (i32.add
                  (call $fib (i32.sub (local.get $n) (i32.const 1)))
                  (call $fib (i32.sub (local.get $n) (i32.const 2)))))))
          (export "fib" (func $fib)))
    "#;

    let mut builder = Builder::new();
    builder.register_text_module("m", src);
    let mut program = builder.build().expect("module should link and instantiate");

    let handle = program.get_function("m", "fib").expect("fib export");
    for (n, want) in [(0, 1), (1, 1), (2, 2), (10, 89), (20, 10946)] {
        let results = program.call(&handle, &[Value::I32(n)]).expect("fib call");
        assert_eq!(results.as_slice(), &[Value::I32(want)]);
    }
}

#[test]
fn memory_store_and_host_readback() {
    fn read_back(
        args: &[Value],
        ctx: &mut wazm::runtime::HostContext<'_, Global>,
    ) -> Result<RawVec<Value, Global>, Trap> {
        let _ = ctx;
        assert_eq!(args, &[Value::I32(42)]);
        Ok(RawVec::new_in(Global))
    }

    let src = r#"
        (module
          (import "host" "fn" (func $host_fn (param i32)))
          (memory (export "memory") 1)
          (func $start
            (i32.store (i32.const 12) (i32.const 42))
            (call $host_fn (i32.load (i32.const 12))))
          (start $start))
    "#;

    let mut builder = Builder::new();
    builder.register_host_function(
        "host",
        "fn",
        HostFunction::new(func_type(&[ValType::I32], &[]), read_back),
    );
    builder.register_text_module("m", src);
    let program = builder.build().expect("start function should run and call the host");
    assert!(program.memory().is_some());
}

#[test]
fn indirect_call_mismatch_traps() {
    let src = r#"
        (module
          (type $i64_of_void (func (result i64)))
          (func $f (result i32) (i32.const 0))
          (table funcref (elem $f))
          (func (export "run") (result i64)
            (call_indirect (type $i64_of_void) (i32.const 0))))
    "#;

    let mut builder = Builder::new();
    builder.register_text_module("m", src);
    let mut program = builder.build().expect("module should link");
    let handle = program.get_function("m", "run").expect("run export");
    let err = program.call(&handle, &[]).expect_err("call_indirect should trap on type mismatch");
    assert!(matches!(err, Error::Trap(Trap::IndirectCallTypeMismatch)));
}

#[test]
fn import_shape_mismatch_is_rejected() {
    let a = r#"(module (func (export "memory") (result i32) (i32.const 0)))"#;
    let b = r#"(module (import "a" "memory" (memory 1)))"#;

    let mut builder = Builder::new();
    builder.register_text_module("a", a);
    builder.register_text_module("b", b);
    let err = builder.build().expect_err("memory import should not bind to a function export");
    assert!(matches!(err, Error::ImportMismatch { .. }));
}

#[test]
fn saturating_truncation_clamps_instead_of_trapping() {
    let src = r#"
        (module
          (func (export "run") (param f32) (result i32)
            (i32.trunc_sat_f32_s (local.get 0))))
    "#;

    let mut builder = Builder::new();
    builder.register_text_module("m", src);
    let mut program = builder.build().expect("module should link");
    let handle = program.get_function("m", "run").expect("run export");

    let cases = [
        (f32::INFINITY, 0x7fffffffu32 as i32),
        (f32::NEG_INFINITY, 0x80000000u32 as i32),
        (f32::NAN, 0),
    ];
    for (input, want) in cases {
        let results = program.call(&handle, &[Value::F32(input)]).expect("trunc_sat call");
        assert_eq!(results.as_slice(), &[Value::I32(want)]);
    }
}

#[test]
fn immutable_global_write_is_rejected() {
    let src = r#"(module (global (export "g") i32 (i32.const 1)))"#;

    let mut builder = Builder::new();
    builder.register_text_module("m", src);
    let mut program = builder.build().expect("module should link");

    assert_eq!(program.get_global::<i32>("m", "g").expect("g is readable"), 1);
    let err = program.set_global("m", "g", 2i32).expect_err("global is immutable");
    assert!(matches!(err, Error::ImmutableGlobal));
    assert_eq!(program.get_global::<i32>("m", "g").expect("g is readable"), 1);
}
