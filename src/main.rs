//! bindery - EPUB packaging tool

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use serde::Deserialize;

use bindery::dom::Document;
use bindery::{
    Anchor, Book, ConvertOptions, EpubVersion, Metadata, TocEntry, TocPlacement, convert,
};

#[derive(Parser)]
#[command(name = "bindery")]
#[command(version, about = "Package a book description into an EPUB", long_about = None)]
#[command(after_help = "EXAMPLES:
    bindery book.json book.epub                 Package with defaults
    bindery book.json book.epub --epub-version 3
    bindery book.json book.epub --flatten-filenames --inline-toc start")]
struct Cli {
    /// Book description (JSON)
    #[arg(value_name = "INPUT")]
    input: PathBuf,

    /// Output EPUB file
    #[arg(value_name = "OUTPUT")]
    output: PathBuf,

    /// Split threshold in KB (0 disables size-based splitting)
    #[arg(long, default_value_t = bindery::DEFAULT_FLOW_SIZE_KB)]
    flow_size_kb: u32,

    /// Do not split flows at page-break markers
    #[arg(long)]
    no_split_on_page_breaks: bool,

    /// Target EPUB version
    #[arg(long, value_enum, default_value_t = VersionArg::V2)]
    epub_version: VersionArg,

    /// Flatten all container paths to a single directory level
    #[arg(long)]
    flatten_filenames: bool,

    /// Insert a generated in-book table of contents
    #[arg(long, value_enum)]
    inline_toc: Option<PlacementArg>,

    /// Title for the generated table of contents
    #[arg(long)]
    toc_title: Option<String>,

    /// Do not generate a default cover page
    #[arg(long)]
    no_default_cover: bool,

    /// Also expand the finished archive into this directory (cleared first)
    #[arg(long, value_name = "DIR")]
    extract_to: Option<PathBuf>,
}

#[derive(Clone, Copy, ValueEnum)]
enum VersionArg {
    #[value(name = "2")]
    V2,
    #[value(name = "3")]
    V3,
}

#[derive(Clone, Copy, ValueEnum)]
enum PlacementArg {
    Start,
    End,
}

/// The JSON book description the CLI consumes. File paths are relative
/// to the description file.
#[derive(Deserialize)]
struct BookDesc {
    title: String,
    #[serde(default)]
    authors: Vec<String>,
    #[serde(default)]
    language: String,
    #[serde(default)]
    identifier: String,
    spine: Vec<FlowDesc>,
    #[serde(default)]
    resources: Vec<ResourceDesc>,
    #[serde(default)]
    toc: Vec<TocDesc>,
    #[serde(default)]
    cover_image: Option<String>,
    #[serde(default)]
    protected_fonts: Vec<String>,
}

#[derive(Deserialize)]
struct FlowDesc {
    id: String,
    href: String,
    path: PathBuf,
}

#[derive(Deserialize)]
struct ResourceDesc {
    href: String,
    path: PathBuf,
    media_type: String,
}

#[derive(Deserialize)]
struct TocDesc {
    title: String,
    #[serde(default)]
    anchor: Option<String>,
    #[serde(default)]
    children: Vec<TocDesc>,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();
    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<(), String> {
    let mut book = load_book(&cli.input).map_err(|e| format!("{}: {e}", cli.input.display()))?;

    let options = ConvertOptions {
        flow_size_kb: cli.flow_size_kb,
        split_on_page_breaks: !cli.no_split_on_page_breaks,
        epub_version: match cli.epub_version {
            VersionArg::V2 => EpubVersion::V2,
            VersionArg::V3 => EpubVersion::V3,
        },
        flatten_filenames: cli.flatten_filenames,
        inline_toc: cli.inline_toc.map(|p| match p {
            PlacementArg::Start => TocPlacement::Start,
            PlacementArg::End => TocPlacement::End,
        }),
        toc_title: cli.toc_title.clone(),
        default_cover: !cli.no_default_cover,
        extract_to: cli.extract_to.clone(),
        extra_entries: Vec::new(),
    };

    let report = convert(&mut book, &cli.output, &options).map_err(|e| e.to_string())?;
    for warning in &report.warnings {
        eprintln!("warning: {warning}");
    }
    Ok(())
}

fn load_book(path: &Path) -> Result<Book, String> {
    let json = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    let desc: BookDesc = serde_json::from_str(&json).map_err(|e| e.to_string())?;
    let base = path.parent().unwrap_or(Path::new("."));

    let mut book = Book::new();
    book.metadata = Metadata {
        title: desc.title,
        authors: desc.authors,
        language: desc.language,
        identifier: desc.identifier,
    };

    for flow in desc.spine {
        let source = std::fs::read_to_string(base.join(&flow.path))
            .map_err(|e| format!("{}: {e}", flow.path.display()))?;
        let document = Document::parse(&source)
            .map_err(|e| format!("{}: {e}", flow.path.display()))?;
        book.add_flow(flow.id, flow.href, document);
    }
    for resource in desc.resources {
        let data = std::fs::read(base.join(&resource.path))
            .map_err(|e| format!("{}: {e}", resource.path.display()))?;
        book.add_resource(resource.href, data, resource.media_type);
    }
    for entry in desc.toc {
        book.toc.push(toc_entry(entry));
    }
    book.cover_image = desc.cover_image;
    book.protected_fonts = desc.protected_fonts;
    Ok(book)
}

fn toc_entry(desc: TocDesc) -> TocEntry {
    let mut entry = match desc.anchor {
        Some(raw) => TocEntry::new(desc.title, Anchor::parse(&raw)),
        None => TocEntry {
            title: desc.title,
            anchor: None,
            children: Vec::new(),
        },
    };
    entry.children = desc.children.into_iter().map(toc_entry).collect();
    entry
}
