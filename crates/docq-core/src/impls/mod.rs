//! Impls - port implementations.
//!
//! # Included
//! - **MemoryCollection**: in-process document collection for tests and demos
//!
//! Production stores live in their own crates and only need to implement
//! [`crate::ports::Collection`].

pub mod memory;

pub use self::memory::MemoryCollection;
