//! # Code
//!
//! Hand-encoded machine code used by the patch slot and the closure thunks

pub mod x64;
