//! # Macros

/// Defines a function that can be hotpatched.
///
/// The function is emitted as a global symbol aligned to 16 bytes whose first 8 bytes are
/// [`SLOT_MARKER`](crate::code::x64::SLOT_MARKER), followed by a jump into the body. The body
/// itself uses the System V calling convention.
///
/// ```ignore
/// hotslot::patchable! {
///     pub fn greeting() -> u8 {
///         b'A'
///     }
/// }
/// ```
///
/// The name becomes a linker symbol, so it must be unique across the final link just like a
/// `#[no_mangle]` function. The body lives in a private module of the same name, which imports
/// everything from the enclosing module.
#[macro_export]
macro_rules! patchable {
    (
        $(#[$meta:meta])*
        $vis:vis fn $name:ident($($arg:ident: $ty:ty),* $(,)?) $(-> $ret:ty)? $body:block
    ) => {
        #[doc(hidden)]
        #[allow(non_snake_case)]
        mod $name {
            #[allow(unused_imports)]
            use super::*;

            pub(super) extern "sysv64" fn body($($arg: $ty),*) $(-> $ret)? $body
        }

        ::core::arch::global_asm!(
            concat!(".pushsection .text.hotslot.", stringify!($name), ",\"ax\",@progbits"),
            ".p2align 4",
            concat!(".globl ", stringify!($name)),
            concat!(".type ", stringify!($name), ",@function"),
            concat!(stringify!($name), ":"),
            // keep in sync with SLOT_MARKER
            ".byte 0x0f, 0x1f, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00",
            "jmp {body}",
            concat!(".size ", stringify!($name), ", . - ", stringify!($name)),
            ".popsection",
            body = sym $name::body,
        );

        unsafe extern "sysv64" {
            $(#[$meta])*
            $vis safe fn $name($($arg: $ty),*) $(-> $ret)?;
        }
    };
}
