#![warn(clippy::missing_docs_in_private_items)]
#![warn(rustdoc::missing_crate_level_docs)]
//! # hotslot
//!
//! Runtime code manipulation for x86-64 System V targets:
//!
//! - **Hotpatching**: functions defined with [`patchable!`] start with an 8-byte slot that
//!   [`hotpatch`] overwrites with a jump to a replacement, and restores later. [`hotpatch_fn`]
//!   does the same with the signatures checked at compile time.
//! - **Closures**: [`closure_create`] generates a tiny thunk that calls an existing function with
//!   an extra, bound last argument.
//! - **Injection**: [`inject`](inject::inject) runs a function between an injectable frame and its
//!   caller, and [`bypass_injection`](inject::bypass_injection) leaves such frames early.

#[cfg(not(all(target_arch = "x86_64", target_os = "linux")))]
compile_error!("hotslot only supports x86_64 Linux");

mod macros;

pub mod alloc;
pub mod closure;
pub mod code;
pub mod function;
pub mod hook;
pub mod inject;
pub mod patcher;

pub use closure::{
    closure_bind, closure_create, closure_destroy, live_closures, BindWord, Closure, ClosureError,
};
pub use function::SysvFn;
pub use hook::inspect::{is_patchable, is_patched, original, original_function, patched};
pub use hook::{hotpatch, hotpatch_fn, unhotpatch, unhotpatch_fn, Hook, HotpatchError, SlotHook};
pub use inject::{
    bypass_injection, bypass_injections, call_injectable, call_injectable_within, inject,
    injection_trampoline, InjectionError, InjectionFrame,
};
