//! The conversion pipeline.
//!
//! [`convert`] runs the fixed stage sequence over a [`Book`] and writes
//! the finished archive. Stages either mutate the book in place or stage
//! the container; nothing is written to the output path until every
//! earlier stage has succeeded, and the archive itself lands atomically.

use std::fs;
use std::path::{Path, PathBuf};

use log::{error, info};

use crate::book::Book;
use crate::cover::{ensure_cover, ensure_toc, simplify_toc_anchors};
use crate::epub::{ContainerAssembler, EpubVersion, ExtraEntry};
use crate::error::{Error, Result, Stage, Warning};
use crate::fonts::{FontObfuscator, ensure_uuid_identifier, protect_fonts};
use crate::links::{LinkRegistry, qualify_links, rewrite_links};
use crate::transform::flatten::{flatten_filenames, uniquify_filenames};
use crate::transform::inline_toc::{TocPlacement, insert_inline_toc};
use crate::transform::quirks::QuirksTransformer;
use crate::transform::split::Splitter;

/// Default split threshold in kilobytes.
pub const DEFAULT_FLOW_SIZE_KB: u32 = 260;

/// Everything the pipeline can be told to do.
#[derive(Debug, Clone)]
pub struct ConvertOptions {
    /// Split threshold in KB; 0 disables size-based splitting.
    pub flow_size_kb: u32,
    pub split_on_page_breaks: bool,
    pub epub_version: EpubVersion,
    /// Strip internal file structure down to one directory level.
    pub flatten_filenames: bool,
    /// Insert a generated in-book TOC at the given position.
    pub inline_toc: Option<TocPlacement>,
    pub toc_title: Option<String>,
    pub default_cover: bool,
    /// Additionally expand the finished archive into this directory,
    /// clearing it first.
    pub extract_to: Option<PathBuf>,
    pub extra_entries: Vec<ExtraEntry>,
}

impl Default for ConvertOptions {
    fn default() -> Self {
        Self {
            flow_size_kb: DEFAULT_FLOW_SIZE_KB,
            split_on_page_breaks: true,
            epub_version: EpubVersion::V2,
            flatten_filenames: false,
            inline_toc: None,
            toc_title: None,
            default_cover: true,
            extract_to: None,
            extra_entries: Vec::new(),
        }
    }
}

/// The outcome of a successful conversion.
#[derive(Debug, Default)]
pub struct Report {
    pub warnings: Vec<Warning>,
}

/// Run the full pipeline and write the archive to `output`.
pub fn convert(book: &mut Book, output: &Path, options: &ConvertOptions) -> Result<Report> {
    let mut warnings: Vec<Warning> = Vec::new();

    stage(Stage::Options, || validate(book, &mut warnings))?;

    stage(Stage::InlineToc, || {
        if let Some(placement) = options.inline_toc {
            insert_inline_toc(book, placement, options.toc_title.as_deref());
        }
        Ok(())
    })?;

    stage(Stage::Filenames, || {
        if options.flatten_filenames {
            flatten_filenames(book)
        } else {
            uniquify_filenames(book)
        }
    })?;

    stage(Stage::Quirks, || {
        QuirksTransformer::apply(book, &mut warnings);
        Ok(())
    })?;

    stage(Stage::Split, || {
        qualify_links(book);
        let splitter = Splitter::new(
            options.flow_size_kb as usize * 1024,
            options.split_on_page_breaks,
        );
        let mut registry = LinkRegistry::new();
        splitter.split_book(book, &mut registry)?;
        rewrite_links(book, &registry)
    })?;

    stage(Stage::Cover, || {
        ensure_cover(book, options.default_cover);
        ensure_toc(book, &mut warnings);
        simplify_toc_anchors(book);
        Ok(())
    })?;

    let records = stage(Stage::Fonts, || protect_fonts(book, &mut warnings))?;

    stage(Stage::Assembly, || {
        let mut assembler = ContainerAssembler::from_book(book, options.epub_version)?;
        assembler.set_encryption(records)?;
        for extra in &options.extra_entries {
            assembler.add_extra_entry(extra.clone())?;
        }
        assembler.commit(output)
    })?;

    if let Some(dir) = &options.extract_to {
        stage(Stage::Extract, || extract_archive(output, dir))?;
    }

    info!(
        "converted {:?} -> {} ({} warnings)",
        book.metadata.title,
        output.display(),
        warnings.len()
    );
    Ok(Report { warnings })
}

fn stage<T>(stage: Stage, f: impl FnOnce() -> Result<T>) -> Result<T> {
    f().inspect_err(|e| error!("{stage} stage failed: {e}"))
}

fn validate(book: &mut Book, warnings: &mut Vec<Warning>) -> Result<()> {
    if book.spine.is_empty() {
        return Err(Error::Configuration(
            "cannot package a book with an empty spine".to_string(),
        ));
    }
    if !book.protected_fonts.is_empty() {
        // Fail on an underivable key before any other stage runs.
        ensure_uuid_identifier(book, warnings);
        FontObfuscator::new(&book.metadata.identifier)?;
    }
    Ok(())
}

/// Expand the finished archive into `dir`, clearing it first.
fn extract_archive(archive_path: &Path, dir: &Path) -> Result<()> {
    if dir.exists() {
        fs::remove_dir_all(dir)?;
    }
    fs::create_dir_all(dir)?;
    let file = fs::File::open(archive_path)?;
    let mut archive = zip::ZipArchive::new(file)?;
    archive.extract(dir)?;
    Ok(())
}
