//! # Closure
//!
//! Closures bind one machine word to the last argument of an existing function and hand back a
//! new function pointer taking one argument fewer.
//!
//! Bound functions must use the System V calling convention (`extern "sysv64"`), the thunks
//! load the bound word straight into the matching argument register.

use std::{mem, ptr};

use log::debug;
use thiserror::Error;

use crate::alloc::{self, RegionError, ThunkRegion};
use crate::code::x64::thunk::{
    thunk_for, DATA_WORD_OFFSET, FUNCTION_WORD_OFFSET, MAX_BOUND_ARITY, THUNK_LEN,
};
use crate::function::SysvFn;

/// Values that can be bound to a closure argument, passed as one machine word
pub trait BindWord: Copy {
    /// Bits passed in the argument register
    fn to_word(self) -> usize;
}

/// Implements [`BindWord`] for integer-like types that widen with `as`
macro_rules! impl_bind_word {
    ($($ty:ty),*) => {
        $(
            impl BindWord for $ty {
                fn to_word(self) -> usize {
                    self as usize
                }
            }
        )*
    };
}

impl_bind_word!(u8, u16, u32, u64, usize, i8, i16, i32, i64, isize, bool);

impl<T> BindWord for *const T {
    fn to_word(self) -> usize {
        self as usize
    }
}

impl<T> BindWord for *mut T {
    fn to_word(self) -> usize {
        self as usize
    }
}

impl<T> BindWord for &'static T {
    fn to_word(self) -> usize {
        self as *const T as usize
    }
}

/// Errors when creating a closure
#[derive(Debug, Error)]
pub enum ClosureError {
    /// No thunk exists for this number of arguments
    #[error("closures bind 1 to {MAX_BOUND_ARITY} arguments, not {0}")]
    UnsupportedArity(usize),
    /// The function pointer was null
    #[error("closure function pointer is null")]
    NullFunction,
    /// Mapping or sealing the thunk region failed
    #[error(transparent)]
    Region(#[from] RegionError),
}

/// A function pointer with one argument bound to a fixed word.
///
/// The thunk stays callable for as long as the `Closure` is alive; dropping it unmaps the thunk.
pub struct Closure {
    /// Mapping holding the thunk and its words
    region: ThunkRegion,
    /// Number of arguments of the bound function
    nargs: usize,
}

impl Closure {
    /// Creates a closure around `function`, which takes `nargs` arguments, binding `userdata` to the last one.
    ///
    /// Calling the closure with `nargs - 1` arguments calls `function` with those arguments followed by `userdata`.
    pub fn new(function: *const (), nargs: usize, userdata: usize) -> Result<Self, ClosureError> {
        let template = thunk_for(nargs).ok_or(ClosureError::UnsupportedArity(nargs))?;
        if function.is_null() {
            return Err(ClosureError::NullFunction);
        }

        let region = alloc::allocate_thunk(|region| {
            let thunk = region.thunk();
            // Safety: the region is freshly mapped read/write, the thunk page is sealed after we return
            // and both words sit at the end of the data page
            unsafe {
                ptr::copy_nonoverlapping(template.code.as_ptr(), thunk, THUNK_LEN);
                thunk
                    .offset(FUNCTION_WORD_OFFSET)
                    .cast::<usize>()
                    .write(function as usize);
                thunk
                    .offset(DATA_WORD_OFFSET)
                    .cast::<usize>()
                    .write(userdata);
            }
        })?;

        debug!(
            "closure at {:#x} binds {userdata:#x} to {} of {:#x}",
            region.thunk() as usize,
            template.register,
            function as usize
        );
        Ok(Self { region, nargs })
    }

    /// Typed [`Closure::new`]: binds `userdata` to the last argument of `function`
    pub fn bind<F: SysvFn, T: BindWord>(function: F, userdata: T) -> Result<Self, ClosureError> {
        Self::new(function.address().cast(), F::ARITY, userdata.to_word())
    }

    /// Address of the thunk
    pub fn as_ptr(&self) -> *const () {
        self.region.thunk() as *const ()
    }

    /// Number of arguments of the bound function, including the bound one
    pub fn nargs(&self) -> usize {
        self.nargs
    }

    /// Function bound by this closure
    pub fn function(&self) -> *const () {
        self.word(FUNCTION_WORD_OFFSET) as *const ()
    }

    /// Word bound to the last argument
    pub fn userdata(&self) -> usize {
        self.word(DATA_WORD_OFFSET)
    }

    /// Reads one of the words stored below the thunk
    fn word(&self, offset: isize) -> usize {
        // Safety: both offsets point at the end of the data page, which lives as long as `self`
        unsafe { self.region.thunk().offset(offset).cast::<usize>().read() }
    }

    /// Returns the thunk as a function pointer of type `F`.
    ///
    /// # Safety
    ///
    /// - `F` must be an `extern "sysv64" fn` taking the first `nargs - 1` arguments of the bound function
    /// - the returned pointer must not be called after the closure is dropped
    pub unsafe fn as_fn<F: Copy>(&self) -> F {
        assert_eq!(mem::size_of::<F>(), mem::size_of::<usize>());
        mem::transmute_copy(&self.as_ptr())
    }
}

/// Creates a closure around `function`, which takes `nargs` arguments, binding `userdata` to the last one
///
/// See [`Closure::new`]
pub fn closure_create(
    function: *const (),
    nargs: usize,
    userdata: usize,
) -> Result<Closure, ClosureError> {
    Closure::new(function, nargs, userdata)
}

/// Creates a closure binding `userdata` to the last argument of `function`
///
/// See [`Closure::bind`]
pub fn closure_bind<F: SysvFn, T: BindWord>(
    function: F,
    userdata: T,
) -> Result<Closure, ClosureError> {
    Closure::bind(function, userdata)
}

/// Destroys a closure, unmapping its thunk
pub fn closure_destroy(closure: Closure) {
    debug!("destroying closure at {:#x}", closure.as_ptr() as usize);
    drop(closure);
}

/// Number of closures that haven't been destroyed yet
pub fn live_closures() -> usize {
    alloc::live_regions()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serial_test::serial;

    use crate::closure::{
        closure_bind, closure_create, closure_destroy, live_closures, ClosureError,
    };
    use crate::code::x64::thunk::MAX_BOUND_ARITY;

    extern "sysv64" fn one(a: usize) -> usize {
        a
    }

    extern "sysv64" fn two(a: usize, b: usize) -> usize {
        a * 10 + b
    }

    extern "sysv64" fn three(a: usize, b: usize, c: usize) -> usize {
        (a * 10 + b) * 10 + c
    }

    extern "sysv64" fn four(a: usize, b: usize, c: usize, d: usize) -> usize {
        ((a * 10 + b) * 10 + c) * 10 + d
    }

    extern "sysv64" fn five(a: usize, b: usize, c: usize, d: usize, e: usize) -> usize {
        (((a * 10 + b) * 10 + c) * 10 + d) * 10 + e
    }

    extern "sysv64" fn six(a: usize, b: usize, c: usize, d: usize, e: usize, f: usize) -> usize {
        ((((a * 10 + b) * 10 + c) * 10 + d) * 10 + e) * 10 + f
    }

    #[test]
    #[serial(maps)]
    /// Every arity passes the bound word as the last argument
    fn test_every_arity() {
        let data = 9;

        let c1 = closure_create(one as *const (), 1, data).unwrap();
        let f1: extern "sysv64" fn() -> usize = unsafe { c1.as_fn() };
        assert_eq!(f1(), one(data));

        let c2 = closure_create(two as *const (), 2, data).unwrap();
        let f2: extern "sysv64" fn(usize) -> usize = unsafe { c2.as_fn() };
        assert_eq!(f2(1), two(1, data));

        let c3 = closure_create(three as *const (), 3, data).unwrap();
        let f3: extern "sysv64" fn(usize, usize) -> usize = unsafe { c3.as_fn() };
        assert_eq!(f3(1, 2), three(1, 2, data));

        let c4 = closure_create(four as *const (), 4, data).unwrap();
        let f4: extern "sysv64" fn(usize, usize, usize) -> usize = unsafe { c4.as_fn() };
        assert_eq!(f4(1, 2, 3), four(1, 2, 3, data));

        let c5 = closure_create(five as *const (), 5, data).unwrap();
        let f5: extern "sysv64" fn(usize, usize, usize, usize) -> usize = unsafe { c5.as_fn() };
        assert_eq!(f5(1, 2, 3, 4), five(1, 2, 3, 4, data));

        let c6 = closure_create(six as *const (), 6, data).unwrap();
        let f6: extern "sysv64" fn(usize, usize, usize, usize, usize) -> usize =
            unsafe { c6.as_fn() };
        assert_eq!(f6(1, 2, 3, 4, 5), six(1, 2, 3, 4, 5, data));
        assert_eq!(f6(1, 2, 3, 4, 5), 123459);
    }

    #[test]
    #[serial(maps)]
    /// Closures over the same function never see each other's data
    fn test_independent() {
        let first = closure_create(two as *const (), 2, 1).unwrap();
        let second = closure_create(two as *const (), 2, 2).unwrap();
        let f: extern "sysv64" fn(usize) -> usize = unsafe { first.as_fn() };
        let g: extern "sysv64" fn(usize) -> usize = unsafe { second.as_fn() };

        assert_ne!(first.as_ptr(), second.as_ptr());
        for i in 0..4 {
            assert_eq!(f(i), i * 10 + 1);
            assert_eq!(g(i), i * 10 + 2);
        }

        closure_destroy(first);
        // destroying one doesn't disturb the other
        assert_eq!(g(7), 72);
    }

    #[test]
    #[serial(maps)]
    /// The bound words can be read back
    fn test_words() {
        let closure = closure_create(three as *const (), 3, 0xdead).unwrap();

        assert_eq!(closure.function(), three as *const ());
        assert_eq!(closure.userdata(), 0xdead);
        assert_eq!(closure.nargs(), 3);
    }

    #[test]
    #[serial(maps)]
    /// Accumulating through a closure that binds the increment
    fn test_accumulator() {
        static STATE: AtomicUsize = AtomicUsize::new(0);
        extern "sysv64" fn accumulate(increment: usize) -> usize {
            STATE.fetch_add(increment, Ordering::SeqCst) + increment
        }

        let closure = closure_create(accumulate as *const (), 1, 5).unwrap();
        let next: extern "sysv64" fn() -> usize = unsafe { closure.as_fn() };

        assert_eq!([next(), next(), next()], [5, 10, 15]);
    }

    #[test]
    #[serial(maps)]
    /// Bad arguments fail before anything is mapped
    fn test_rejections() {
        let before = live_closures();

        for nargs in [0, MAX_BOUND_ARITY + 1] {
            assert!(matches!(
                closure_create(one as *const (), nargs, 0),
                Err(ClosureError::UnsupportedArity(n)) if n == nargs
            ));
        }
        assert!(matches!(
            closure_create(std::ptr::null(), 1, 0),
            Err(ClosureError::NullFunction)
        ));
        let nothing: extern "sysv64" fn() = none;
        assert!(matches!(
            closure_bind(nothing, 0u8),
            Err(ClosureError::UnsupportedArity(0))
        ));

        assert_eq!(live_closures(), before);
    }

    extern "sysv64" fn none() {}

    #[test]
    #[serial(maps)]
    /// Typed closures bind any word-like value, widened to a full register
    fn test_bind() {
        let f: extern "sysv64" fn(usize, i32) -> usize = two_signed;
        let closure = closure_bind(f, -4i32).unwrap();
        let g: extern "sysv64" fn(usize) -> usize = unsafe { closure.as_fn() };

        assert_eq!(closure.nargs(), 2);
        assert_eq!(closure.function(), two_signed as *const ());
        assert_eq!(g(10), 6);
    }

    extern "sysv64" fn two_signed(a: usize, b: i32) -> usize {
        (a as isize + b as isize) as usize
    }

    #[test]
    #[serial(maps)]
    /// Destroying a closure leaves nothing mapped
    fn test_destroy_unmaps() {
        let closure = closure_create(one as *const (), 1, 0).unwrap();
        let thunk = closure.as_ptr();
        let data = (thunk as usize - region::page::size()) as *const u8;

        let code = region::query(thunk).unwrap().protection();
        assert!(code.contains(region::Protection::EXECUTE));
        let words = region::query(data).unwrap().protection();
        assert!(!words.contains(region::Protection::EXECUTE));

        closure_destroy(closure);

        assert!(matches!(
            region::query(thunk),
            Err(region::Error::UnmappedRegion)
        ));
        assert!(matches!(
            region::query(data),
            Err(region::Error::UnmappedRegion)
        ));
    }
}
