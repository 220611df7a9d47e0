//! # Inject
//!
//! Return injection: a function running inside an injectable frame can arrange for another
//! function to run *between* itself and its caller, or bail out of the frame altogether.
//!
//! [`call_injectable`] sets up a frame of known layout below the real return address:
//!
//! ```text
//! caller       : real return address, pushed by the call into the frame
//! return slot  : where the frame returns through; a plain `ret` unless injected
//! callback     : pending injected callback
//! resume       : address of the plain `ret`
//! outer        : enclosing injectable frame, if any
//! ```
//!
//! Injecting points the return slot at [`injection_trampoline`], which calls the callback with the
//! frame's return value. Bypassing resets the stack pointer to the frame and returns straight to
//! the caller, skipping everything still running inside it.
//!
//! Bypassing skips Rust frames without running their destructors and is incompatible with
//! unwinding. Only bypass over frames that own nothing needing a drop.

use std::cell::Cell;
use std::convert::Infallible;
use std::ptr;

use log::debug;
use thiserror::Error;

/// Function run inside an injectable frame
pub type InjectableFn = extern "sysv64" fn(usize, &InjectionFrame) -> usize;

/// Function injected between an injectable frame and its caller.
///
/// It receives the frame's return value and its own return value goes to the caller.
pub type InjectionCallback = extern "sysv64" fn(usize) -> usize;

/// Errors when injecting into or bypassing frames
#[derive(Debug, Error)]
pub enum InjectionError {
    /// The frame already has an injection that hasn't been consumed
    #[error("frame already has an active injection")]
    AlreadyInjected,
    /// Asked to bypass zero frames
    #[error("nothing to bypass")]
    NothingToBypass,
    /// Fewer enclosing frames exist than were asked to be bypassed
    #[error("asked to bypass {requested} frames but only {available} are active")]
    TooFewFrames {
        /// Frames asked to be bypassed
        requested: usize,
        /// Frames actually reachable
        available: usize,
    },
}

/// Record living inside an injectable frame.
///
/// Only ever reached through the reference handed to an [`InjectableFn`].
#[repr(C)]
pub struct InjectionFrame {
    /// Enclosing frame, or null
    outer: *const InjectionFrame,
    /// Address of the plain `ret` the frame returns through when not injected
    resume: usize,
    /// Callback the trampoline jumps to
    callback: Cell<usize>,
    /// Address the frame returns through
    return_slot: Cell<usize>,
    /// Real return address into the caller of the frame
    caller: usize,
}

impl InjectionFrame {
    /// Whether a callback is waiting to run when the frame returns
    pub fn is_injected(&self) -> bool {
        self.return_slot.get() != self.resume
    }

    /// Address the frame would return to without injection
    pub fn caller_return_address(&self) -> usize {
        self.caller
    }

    /// Enclosing frame, if this frame was entered with [`call_injectable_within`]
    pub fn outer(&self) -> Option<&InjectionFrame> {
        // Safety: an outer frame is still running while any frame it encloses is
        unsafe { self.outer.as_ref() }
    }

    /// Number of frames from this one out to the outermost, inclusive
    pub fn depth(&self) -> usize {
        let mut depth = 1;
        let mut frame = self;
        while let Some(outer) = frame.outer() {
            depth += 1;
            frame = outer;
        }
        depth
    }
}

/// Calls `f(arg, frame)` inside a fresh injectable frame and returns what the frame returns.
///
/// Without injection that's the return value of `f`; with one it's the callback's return value.
pub fn call_injectable(f: InjectableFn, arg: usize) -> usize {
    // Safety: `injectable_entry` preserves every callee-saved register and the stack
    unsafe { injectable_entry(f, arg, ptr::null()) }
}

/// Like [`call_injectable`], linking the new frame to `outer` so [`bypass_injections`] can reach it
pub fn call_injectable_within(outer: &InjectionFrame, f: InjectableFn, arg: usize) -> usize {
    // Safety: see `call_injectable`
    unsafe { injectable_entry(f, arg, outer) }
}

/// Injects `callback` between the frame and its caller.
///
/// Once the function running in `frame` returns a value `v`, `callback(v)` runs and its return value
/// goes to the caller instead. Returns the caller's original return address.
pub fn inject(
    frame: &InjectionFrame,
    callback: InjectionCallback,
) -> Result<usize, InjectionError> {
    if frame.is_injected() {
        return Err(InjectionError::AlreadyInjected);
    }

    let callback = callback as *const () as usize;
    debug!(
        "injecting {callback:#x} before return to {:#x}",
        frame.caller
    );
    frame.callback.set(callback);
    frame.return_slot.set(injection_trampoline as *const () as usize);
    Ok(frame.caller)
}

/// Leaves `frame` immediately, returning `value` to its caller.
///
/// Anything pending in the frame, the rest of the running function and any injected callback, is skipped.
///
/// # Safety
///
/// - must be called from within the dynamic extent of the function running in `frame`
/// - every Rust frame between here and `frame` is discarded without running destructors
pub unsafe fn bypass_injection(frame: &InjectionFrame, value: usize) -> ! {
    debug!(
        "bypassing frame, returning {value:#x} to {:#x}",
        frame.caller
    );
    bypass_entry(frame, value)
}

/// Leaves `count` nested frames at once, starting with `frame`, returning `value` to the caller of the outermost.
///
/// Fails without leaving anything if `count` is zero or larger than the number of nested frames.
///
/// # Safety
///
/// See [`bypass_injection`]
pub unsafe fn bypass_injections(
    frame: &InjectionFrame,
    value: usize,
    count: usize,
) -> Result<Infallible, InjectionError> {
    if count == 0 {
        return Err(InjectionError::NothingToBypass);
    }

    let mut target = frame;
    for _ in 1..count {
        target = target.outer().ok_or(InjectionError::TooFewFrames {
            requested: count,
            available: frame.depth(),
        })?;
    }
    bypass_injection(target, value)
}

/// Frame setup behind [`call_injectable`]; `rdi` = f, `rsi` = arg, `rdx` = outer.
///
/// Reserves five words below the return address (four for the [`InjectionFrame`] plus one to keep
/// the stack aligned), saves the callee-saved registers, then calls `f`. On the way out it loads
/// the pending callback into `rdi` for [`injection_trampoline`] and returns through the return slot.
#[unsafe(naked)]
unsafe extern "sysv64" fn injectable_entry(
    f: InjectableFn,
    arg: usize,
    outer: *const InjectionFrame,
) -> usize {
    core::arch::naked_asm!(
        "sub rsp, 40",
        "push rbx",
        "push rbp",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        // the InjectionFrame starts at rsp + 56 and ends with the real return address at rsp + 88
        "mov [rsp + 56], rdx",
        "lea rax, [rip + 2f]",
        "mov [rsp + 64], rax",
        "mov qword ptr [rsp + 72], 0",
        "mov [rsp + 80], rax",
        "mov rax, rdi",
        "mov rdi, rsi",
        "lea rsi, [rsp + 56]",
        "call rax",
        "mov rdi, [rsp + 72]",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbp",
        "pop rbx",
        "add rsp, 32",
        "ret",
        "2:",
        "ret",
    )
}

/// Unwinds to the frame at `rdi` and returns `rsi` to its caller
#[unsafe(naked)]
unsafe extern "sysv64" fn bypass_entry(frame: *const InjectionFrame, value: usize) -> ! {
    core::arch::naked_asm!(
        "lea rsp, [rdi - 56]",
        "mov rax, rsi",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbp",
        "pop rbx",
        "add rsp, 40",
        "ret",
    )
}

/// Calls `callback` with the return value left in `rax` by whatever returned here.
///
/// Injected frames return through this trampoline with their pending callback in `rdi`.
///
/// # Safety
///
/// Only meaningful when entered from assembly with a return value in `rax`; calling it from Rust
/// passes an unspecified value to `callback`.
#[unsafe(naked)]
pub unsafe extern "sysv64" fn injection_trampoline(callback: InjectionCallback) -> usize {
    core::arch::naked_asm!("xchg rax, rdi", "jmp rax")
}
