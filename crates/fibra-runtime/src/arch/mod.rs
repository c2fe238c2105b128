//! Architecture-specific context switching
//!
//! Each backend provides the same surface:
//! - `SavedContext`: callee-saved register block
//! - `init_context`: prime a context so the first switch enters `entry(arg)`
//!   on a fresh stack
//! - `switch_context`: save the current registers, load another block

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        mod x86_64;
        pub use self::x86_64::*;
    } else if #[cfg(target_arch = "aarch64")] {
        mod aarch64;
        pub use self::aarch64::*;
    } else {
        compile_error!("fibra supports x86_64 and aarch64 only");
    }
}

/// Fiber entry point. Never returns: a finished fiber switches away for
/// good.
pub type EntryFn = unsafe extern "C" fn(usize) -> !;
