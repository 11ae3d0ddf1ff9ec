//! Container packaging.

pub mod assembler;
pub mod upgrade;

pub use assembler::{ContainerAssembler, EpubVersion, ExtraEntry};
