//! End-to-end conversion tests: build a book model, run the full
//! pipeline, and inspect the produced archive.

use std::io::Read;

use bindery::dom::Document;
use bindery::{
    Anchor, Book, ConvertOptions, EpubVersion, Metadata, TocEntry, TocPlacement, convert,
};

const UUID_ID: &str = "urn:uuid:12345678-1234-4234-8234-123456789abc";

fn flow_doc(body: &str) -> Document {
    Document::parse(&format!(
        "<html xmlns=\"http://www.w3.org/1999/xhtml\"><head><title>t</title></head><body>{body}</body></html>"
    ))
    .expect("fixture should parse")
}

fn read_entry(archive_path: &std::path::Path, name: &str) -> Vec<u8> {
    let file = std::fs::File::open(archive_path).expect("archive should exist");
    let mut archive = zip::ZipArchive::new(file).expect("archive should open");
    let mut entry = archive.by_name(name).expect("entry should exist");
    let mut data = Vec::new();
    entry.read_to_end(&mut data).expect("entry should read");
    data
}

fn entry_names(archive_path: &std::path::Path) -> Vec<String> {
    let file = std::fs::File::open(archive_path).expect("archive should exist");
    let mut archive = zip::ZipArchive::new(file).expect("archive should open");
    (0..archive.len())
        .map(|i| archive.by_index(i).unwrap().name().to_string())
        .collect()
}

fn sample_book() -> Book {
    let mut book = Book::new();
    book.metadata = Metadata::new("Sample")
        .with_author("Author")
        .with_language("en")
        .with_identifier(UUID_ID);
    book.add_flow(
        "ch1",
        "ch1.html",
        flow_doc(r#"<h1 id="top">One</h1><p>text</p><a href="ch2.html#sec">link</a>"#),
    );
    book.add_flow(
        "ch2",
        "ch2.html",
        flow_doc(r#"<h1>Two</h1><p id="sec">target</p>"#),
    );
    book.toc.push(TocEntry::new(
        "Chapter 1",
        Anchor::with_fragment("ch1.html", "top"),
    ));
    book.toc
        .push(TocEntry::new("Chapter 2", Anchor::new("ch2.html")));
    book
}

#[test]
fn test_basic_conversion_produces_valid_container() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("sample.epub");

    let mut book = sample_book();
    let report = convert(&mut book, &out, &ConvertOptions::default()).unwrap();
    assert!(report.warnings.is_empty(), "{:?}", report.warnings);

    let names = entry_names(&out);
    assert_eq!(names[0], "mimetype");
    assert!(names.contains(&"META-INF/container.xml".to_string()));
    assert!(names.contains(&"OEBPS/content.opf".to_string()));
    assert!(names.contains(&"OEBPS/toc.ncx".to_string()));
    assert!(names.contains(&"OEBPS/ch1.html".to_string()));
    assert!(names.contains(&"OEBPS/ch2.html".to_string()));

    // Default cover page was generated and listed first in the spine.
    let opf = String::from_utf8(read_entry(&out, "OEBPS/content.opf")).unwrap();
    let ch1_pos = opf.find("idref=\"ch1_html\"").unwrap();
    let titlepage_pos = opf.find("idref=\"titlepage_xhtml\"").unwrap();
    assert!(titlepage_pos < ch1_pos);
}

#[test]
fn test_manifest_and_entries_correspond() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("sample.epub");

    let mut book = sample_book();
    book.add_resource("style.css", b"p { color: black }".to_vec(), "text/css");
    book.add_resource("pic.png", vec![0x89, 0x50, 0x4e, 0x47], "image/png");
    convert(&mut book, &out, &ConvertOptions::default()).unwrap();

    let opf = String::from_utf8(read_entry(&out, "OEBPS/content.opf")).unwrap();
    let names = entry_names(&out);

    // Every archive entry under the content directory is in the manifest.
    for name in &names {
        if let Some(href) = name.strip_prefix("OEBPS/") {
            if href == "content.opf" || href == "toc.ncx" {
                continue;
            }
            assert!(opf.contains(&format!("href=\"{href}\"")), "orphan {href}");
        }
    }
    // And every manifest href has bytes in the archive.
    for part in opf.split("href=\"").skip(1) {
        let href = part.split('"').next().unwrap();
        if href == "toc.ncx" {
            continue;
        }
        assert!(
            names.contains(&format!("OEBPS/{href}")),
            "manifest entry {href} has no bytes"
        );
    }
}

#[test]
fn test_split_book_keeps_toc_anchor_valid() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("big.epub");

    // 1000 blocks of ~1KB each; threshold 260KB gives 4 fragments.
    let mut body = String::new();
    for i in 0..1000 {
        body.push_str(&format!(r#"<p id="block{i}">{}</p>"#, "y".repeat(990)));
    }
    let mut book = Book::new();
    book.metadata = Metadata::new("Big").with_identifier(UUID_ID);
    book.add_flow("doc", "doc.html", flow_doc(&body));
    book.toc.push(TocEntry::new(
        "Middle",
        Anchor::with_fragment("doc.html", "block500"),
    ));

    convert(&mut book, &out, &ConvertOptions::default()).unwrap();

    let names = entry_names(&out);
    let fragments: Vec<&String> = names
        .iter()
        .filter(|n| n.starts_with("OEBPS/doc") && n.ends_with(".html"))
        .collect();
    assert_eq!(fragments.len(), 4, "{fragments:?}");
    assert!(names.contains(&"OEBPS/doc.html".to_string()));
    assert!(names.contains(&"OEBPS/doc_split_001.html".to_string()));

    // The NCX anchor follows block500 into its fragment, which still
    // carries the id.
    let ncx = String::from_utf8(read_entry(&out, "OEBPS/toc.ncx")).unwrap();
    let src = ncx
        .split("src=\"")
        .nth(1)
        .and_then(|s| s.split('"').next())
        .unwrap();
    let (href, frag) = src.split_once('#').expect("anchor keeps its fragment");
    assert_eq!(frag, "block500");
    let target = String::from_utf8(read_entry(&out, &format!("OEBPS/{href}"))).unwrap();
    assert!(target.contains("id=\"block500\""));

    // Spine order: fragments are contiguous and ordered.
    let opf = String::from_utf8(read_entry(&out, "OEBPS/content.opf")).unwrap();
    let spine: Vec<&str> = opf
        .split("idref=\"")
        .skip(1)
        .map(|s| s.split('"').next().unwrap())
        .collect();
    let doc_refs: Vec<&&str> = spine.iter().filter(|s| s.starts_with("doc")).collect();
    assert_eq!(
        doc_refs,
        vec![
            &"doc_html",
            &"doc_split_001_html",
            &"doc_split_002_html",
            &"doc_split_003_html"
        ]
    );
}

#[test]
fn test_font_obfuscation_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("fonts.epub");

    let font: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
    let mut book = sample_book();
    book.add_resource("fonts/serif.ttf", font.clone(), "font/ttf");
    book.protected_fonts = vec!["fonts/serif.ttf".to_string()];

    convert(&mut book, &out, &ConvertOptions::default()).unwrap();

    let enc = String::from_utf8(read_entry(&out, "META-INF/encryption.xml")).unwrap();
    assert!(enc.contains("http://ns.adobe.com/pdf/enc#RC"));
    assert!(enc.contains(r#"URI="OEBPS/fonts/serif.ttf""#));

    let written = read_entry(&out, "OEBPS/fonts/serif.ttf");
    assert_ne!(written[..1024], font[..1024]);
    assert_eq!(written[1024..], font[1024..]);

    // Applying the key again restores the original bytes.
    let obfuscator = bindery::FontObfuscator::new(UUID_ID).unwrap();
    let mut restored = written;
    obfuscator.obfuscate(&mut restored);
    assert_eq!(restored, font);
}

#[test]
fn test_epub3_upgrade_emits_nav_document() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("v3.epub");

    let mut book = sample_book();
    let options = ConvertOptions {
        epub_version: EpubVersion::V3,
        ..Default::default()
    };
    convert(&mut book, &out, &options).unwrap();

    let opf = String::from_utf8(read_entry(&out, "OEBPS/content.opf")).unwrap();
    assert!(opf.contains("version=\"3.0\""));
    assert!(opf.contains("dcterms:modified"));
    assert!(opf.contains("properties=\"nav\""));

    let nav = String::from_utf8(read_entry(&out, "OEBPS/nav.xhtml")).unwrap();
    assert!(nav.contains("epub:type=\"toc\""));
    assert!(nav.contains(">Chapter 2</a>"));
    // Legacy NCX stays alongside the nav document.
    assert!(entry_names(&out).contains(&"OEBPS/toc.ncx".to_string()));
}

#[test]
fn test_inline_toc_and_flatten() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("flat.epub");

    let mut book = Book::new();
    book.metadata = Metadata::new("Nested").with_identifier(UUID_ID);
    book.add_flow(
        "ch1",
        "text/part1/ch1.html",
        flow_doc(r#"<h1 id="top">One</h1><img src="images/pic.png"/>"#),
    );
    book.add_resource("images/pic.png", vec![1, 2, 3], "image/png");
    book.toc.push(TocEntry::new(
        "Chapter 1",
        Anchor::with_fragment("text/part1/ch1.html", "top"),
    ));

    let options = ConvertOptions {
        flatten_filenames: true,
        inline_toc: Some(TocPlacement::Start),
        toc_title: Some("Contents".to_string()),
        default_cover: false,
        ..Default::default()
    };
    convert(&mut book, &out, &options).unwrap();

    let names = entry_names(&out);
    assert!(names.contains(&"OEBPS/ch1.html".to_string()));
    assert!(names.contains(&"OEBPS/pic.png".to_string()));
    assert!(names.contains(&"OEBPS/inline_toc.html".to_string()));
    assert!(!names.iter().any(|n| n.contains("text/part1")));

    // The generated TOC page links through the flattened names, and its
    // anchor to the top-of-file heading was simplified away.
    let toc_page = String::from_utf8(read_entry(&out, "OEBPS/inline_toc.html")).unwrap();
    assert!(toc_page.contains(">Contents</h1>"));
    assert!(toc_page.contains("href=\"ch1.html"));

    let flow = String::from_utf8(read_entry(&out, "OEBPS/ch1.html")).unwrap();
    assert!(flow.contains("src=\"pic.png\""));
}

#[test]
fn test_quirk_cleanup_reaches_the_archive() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("quirks.epub");

    let mut book = Book::new();
    book.metadata = Metadata::new("Quirky").with_identifier(UUID_ID);
    book.add_flow(
        "ch1",
        "ch1.html",
        flow_doc(
            r#"<a id="x">one</a><a id="x">two</a><center>mid</center><u>under</u><script>alert(1)</script>"#,
        ),
    );

    let options = ConvertOptions {
        default_cover: false,
        ..Default::default()
    };
    convert(&mut book, &out, &options).unwrap();

    let flow = String::from_utf8(read_entry(&out, "OEBPS/ch1.html")).unwrap();
    assert_eq!(flow.matches("id=\"x\"").count(), 1);
    assert!(flow.contains("<div style=\"text-align:center\">mid</div>"));
    assert!(flow.contains("<span>under</span>"));
    assert!(!flow.contains("script"));
}
