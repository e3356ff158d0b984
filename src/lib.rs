// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! An embeddable WebAssembly engine: binary and text module parsing,
//! static validation, linking and instantiation, and a stack-machine
//! interpreter for the core WebAssembly 1.0 specification.

#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![cfg_attr(nightly, feature(allocator_api))]

#[cfg(nightly)]
extern crate alloc;

pub mod core_compat;
pub mod decode;
pub mod interp;
pub mod link;
pub mod runtime;
pub mod storage;
pub mod text;
pub mod types;

mod module;
mod validate;

pub use module::{Allocator, Module};
