#![deny(unsafe_code)]

pub mod byte_iter;
pub mod error;
pub mod execute;
pub mod instantiate;
pub mod leb128;
pub mod memory;
pub mod module;
pub mod types;
pub mod validator;
pub mod value;

// Debug macro that only prints when the wasm_debug feature is enabled
#[cfg(feature = "wasm_debug")]
macro_rules! debug_println {
    ($($arg:tt)*) => {
        eprintln!($($arg)*);
    };
}

#[cfg(not(feature = "wasm_debug"))]
macro_rules! debug_println {
    ($($arg:tt)*) => {
        { let _ = format_args!($($arg)*); }
    };
}

pub(crate) use debug_println;

pub use error::Error;
pub use execute::{execute, ExecutionResult, CALL_STACK_LIMIT};
pub use instantiate::{
    exported_function, exported_global, exported_memory, exported_table, instantiate,
    resolve_imported_functions, resolve_instantiate, wrap_function, ExternalFunction,
    ExternalGlobal, ExternalMemory, ExternalTable, GlobalCell, HostFn, ImportedFunction, Instance,
    Table, DEFAULT_MEMORY_PAGES_LIMIT,
};
pub use memory::Memory;
pub use module::{find_exported_function, parse, validate, Module};
pub use types::{ExternKind, FuncIdx, FuncType, GlobalType, Limits, TypeIdx, ValType};
pub use value::Value;
