//! Core runtime for a sandboxed WebAssembly execution engine: the
//! compartment/context object graph, linear memories and tables, module
//! instantiation, JIT object loading, and the invoke boundary that turns
//! hardware/panic faults into typed traps.
//!
//! What this crate does *not* do (left to other, out-of-scope
//! components): parse or validate Wasm bytecode, lower it to machine
//! code, or provide WASI/Emscripten host bindings. It is handed already
//! validated [`rt_environ::ModuleIr`]s and already compiled
//! [`rt_environ::CompiledModule`]s and is responsible for everything
//! that happens from "load this object code" onward.

pub mod compartment;
pub mod config;
pub mod context;
pub mod error;
pub mod exception;
pub mod function;
pub mod global;
pub mod instance;
pub mod intrinsics;
pub mod invoke;
pub mod jit;
pub mod memory;
mod mmap;
pub mod object;
pub mod resource_quota;
pub mod table;
pub mod value;
pub mod vmcontext;

pub use compartment::Compartment;
pub use config::Config;
pub use context::Context;
pub use error::{RuntimeError, RuntimeResult, Trap};
pub use exception::{Exception, ExceptionType};
pub use function::Function;
pub use global::Global;
pub use instance::{instantiate_module, Imports, Instance};
pub use invoke::{invoke_function, invoke_function_checked};
pub use memory::Memory;
pub use object::{Foreign, ObjectKind};
pub use resource_quota::ResourceQuota;
pub use table::{Table, TableElementRef};
pub use value::Value;
