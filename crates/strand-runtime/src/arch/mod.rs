//! Architecture-specific context switching
//!
//! Each backend exposes the same surface: `SavedContext`, `init_context`
//! and `context_switch`.

#[cfg(target_arch = "x86_64")]
pub mod x86_64;

#[cfg(target_arch = "aarch64")]
pub mod aarch64;
