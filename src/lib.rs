//! # bindery
//!
//! A packaging pipeline that turns an in-memory book model into a valid
//! EPUB: renderer-quirk cleanup, size- and page-break-based flow
//! splitting with link preservation, font obfuscation, and atomic
//! container assembly with an optional EPUB 3 upgrade.
//!
//! ## Quick Start
//!
//! ```no_run
//! use bindery::{Book, ConvertOptions, Metadata, convert};
//! use std::path::Path;
//!
//! let mut book = Book::new();
//! book.metadata = Metadata::new("My Book")
//!     .with_author("Author Name")
//!     .with_language("en");
//! let doc = bindery::dom::Document::parse(
//!     "<html><head><title>One</title></head><body><p>Hello</p></body></html>",
//! )?;
//! book.add_flow("ch1", "ch1.xhtml", doc);
//!
//! let report = convert(&mut book, Path::new("out.epub"), &ConvertOptions::default())?;
//! for warning in &report.warnings {
//!     eprintln!("{warning}");
//! }
//! # Ok::<(), bindery::Error>(())
//! ```
//!
//! The [`Book`] struct is the pipeline's input: an ordered spine of
//! parsed XHTML flows, a manifest of binary resources, a table of
//! contents, and packaging metadata. [`convert`] runs the fixed stage
//! sequence and writes the archive; the individual stages are public for
//! callers that need finer control.

pub mod book;
pub mod convert;
pub mod cover;
pub mod dom;
pub mod epub;
pub mod error;
pub mod fonts;
pub mod links;
pub mod transform;

pub use book::{Book, Flow, Metadata, Resource, TocEntry, TocTree};
pub use convert::{ConvertOptions, DEFAULT_FLOW_SIZE_KB, Report, convert};
pub use epub::{ContainerAssembler, EpubVersion, ExtraEntry};
pub use error::{Error, Result, Stage, Warning};
pub use fonts::FontObfuscator;
pub use links::{Anchor, LinkRegistry};
pub use transform::inline_toc::TocPlacement;
pub use transform::split::Splitter;
