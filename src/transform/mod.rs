//! Structural transforms applied to the book model before assembly.
//!
//! Order matters: the inline TOC is generated first so it gets split and
//! quirk-fixed like any other flow; filename rewrites come next so every
//! later stage sees final hrefs; quirks run before splitting so split-size
//! estimates reflect the cleaned markup.

pub mod flatten;
pub mod inline_toc;
pub mod quirks;
pub mod split;
