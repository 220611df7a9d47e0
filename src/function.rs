//! # Function pointers
//!
//! Typed view of the `extern "sysv64"` function pointers hotpatching and closures operate on.
//! Going through [`SysvFn`] keeps a replacement's signature tied to its target's at compile time.

use std::mem;

/// An `extern "sysv64"` function pointer taking up to six arguments
///
/// # Safety
///
/// Implementors must be plain function pointers: [`SysvFn::address`] and [`SysvFn::from_address`]
/// convert without changing the bits.
pub unsafe trait SysvFn: Copy {
    /// Number of arguments the function takes
    const ARITY: usize;

    /// Entry address of the function
    fn address(self) -> *const u8;

    /// Reinterprets `address` as a function of this type
    ///
    /// # Safety
    ///
    /// `address` must be the entry of a function with exactly this signature
    unsafe fn from_address(address: *const u8) -> Self;
}

/// Implements [`SysvFn`] for one arity
macro_rules! impl_sysv_fn {
    ($arity:expr; $($arg:ident),*) => {
        unsafe impl<R, $($arg),*> SysvFn for extern "sysv64" fn($($arg),*) -> R {
            const ARITY: usize = $arity;

            fn address(self) -> *const u8 {
                self as *const u8
            }

            unsafe fn from_address(address: *const u8) -> Self {
                mem::transmute_copy(&address)
            }
        }
    };
}

impl_sysv_fn!(0;);
impl_sysv_fn!(1; A);
impl_sysv_fn!(2; A, B);
impl_sysv_fn!(3; A, B, C);
impl_sysv_fn!(4; A, B, C, D);
impl_sysv_fn!(5; A, B, C, D, E);
impl_sysv_fn!(6; A, B, C, D, E, F);
