//! Writes the finished container.
//!
//! The assembler collects declared manifest entries and their bytes while
//! `Building`, optionally restructures itself for a newer format version
//! while `Upgrading`, and writes the archive exactly once at commit. The
//! zip goes to a sibling temporary path and is renamed into place only
//! when every entry has been written, so a failed commit leaves nothing
//! behind.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::Path;

use log::{debug, info};
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

use crate::book::{Book, Metadata, TocEntry, TocTree};
use crate::error::{Error, Result};
use crate::fonts::{EncryptionRecord, encryption_xml};

/// Target container format version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EpubVersion {
    #[default]
    V2,
    V3,
}

/// A caller-supplied entry written at the archive root (e.g. an auxiliary
/// metadata document under `META-INF/`).
#[derive(Debug, Clone)]
pub struct ExtraEntry {
    /// Archive-root-relative name.
    pub name: String,
    pub media_type: String,
    pub data: Vec<u8>,
}

/// One declared package resource.
#[derive(Debug, Clone)]
pub struct ManifestEntry {
    pub href: String,
    pub media_type: String,
    /// Byte length once supplied.
    pub length: Option<usize>,
    pub encrypted: bool,
    pub(super) properties: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Building,
    Upgrading,
    Committed,
}

/// Stages a package and writes it to disk atomically.
#[derive(Debug)]
pub struct ContainerAssembler {
    state: State,
    version: EpubVersion,
    pub(super) metadata: Metadata,
    /// Reading order as (manifest id, href) pairs.
    pub(super) spine: Vec<(String, String)>,
    pub(super) toc: TocTree,
    pub(super) cover_image: Option<String>,
    pub(super) titlepage: Option<String>,
    pub(super) manifest: Vec<ManifestEntry>,
    pub(super) contents: HashMap<String, Vec<u8>>,
    encryption: Vec<EncryptionRecord>,
    extras: Vec<ExtraEntry>,
}

const CONTAINER_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<container version="1.0" xmlns="urn:oasis:names:tc:opendocument:xmlns:container">
  <rootfiles>
    <rootfile full-path="OEBPS/content.opf" media-type="application/oebps-package+xml"/>
  </rootfiles>
</container>"#;

impl ContainerAssembler {
    pub fn new(version: EpubVersion, metadata: Metadata) -> Self {
        Self {
            state: State::Building,
            version,
            metadata,
            spine: Vec::new(),
            toc: TocTree::default(),
            cover_image: None,
            titlepage: None,
            manifest: Vec::new(),
            contents: HashMap::new(),
            encryption: Vec::new(),
            extras: Vec::new(),
        }
    }

    /// Stage an entire book: every flow is serialized and every resource
    /// declared and supplied.
    pub fn from_book(book: &Book, version: EpubVersion) -> Result<Self> {
        let mut assembler = Self::new(version, book.metadata.clone());
        assembler.toc = book.toc.clone();
        assembler.cover_image = book.cover_image.clone();
        assembler.titlepage = book.titlepage.clone();

        for flow in &book.spine {
            assembler.declare(&flow.href, "application/xhtml+xml")?;
            assembler.supply(&flow.href, flow.document.to_xhtml().into_bytes())?;
            assembler.spine.push((flow.id.clone(), flow.href.clone()));
        }
        let mut hrefs: Vec<&String> = book.resources.keys().collect();
        hrefs.sort();
        for href in hrefs {
            let resource = &book.resources[href];
            assembler.declare(href, &resource.media_type)?;
            assembler.supply(href, resource.data.clone())?;
        }
        Ok(assembler)
    }

    fn check_writable(&self) -> Result<()> {
        if self.state == State::Committed {
            return Err(Error::FatalInternal(
                "write into an already committed container".to_string(),
            ));
        }
        Ok(())
    }

    /// Declare a manifest entry. Bytes must follow via [`supply`] before
    /// commit.
    ///
    /// [`supply`]: ContainerAssembler::supply
    pub fn declare(&mut self, href: &str, media_type: &str) -> Result<()> {
        self.check_writable()?;
        if self.manifest.iter().any(|e| e.href == href) {
            return Err(Error::FatalInternal(format!(
                "manifest entry {href} declared twice"
            )));
        }
        self.manifest.push(ManifestEntry {
            href: href.to_string(),
            media_type: media_type.to_string(),
            length: None,
            encrypted: false,
            properties: None,
        });
        Ok(())
    }

    /// Supply the bytes for a declared entry.
    pub fn supply(&mut self, href: &str, data: Vec<u8>) -> Result<()> {
        self.check_writable()?;
        let Some(entry) = self.manifest.iter_mut().find(|e| e.href == href) else {
            return Err(Error::FatalInternal(format!(
                "bytes supplied for undeclared entry {href}"
            )));
        };
        entry.length = Some(data.len());
        self.contents.insert(href.to_string(), data);
        Ok(())
    }

    /// Record the obfuscated-font entries for `META-INF/encryption.xml`.
    pub fn set_encryption(&mut self, records: Vec<EncryptionRecord>) -> Result<()> {
        self.check_writable()?;
        for record in &records {
            if let Some(entry) = self.manifest.iter_mut().find(|e| e.href == record.href) {
                entry.encrypted = true;
            }
        }
        self.encryption = records;
        Ok(())
    }

    pub fn add_extra_entry(&mut self, entry: ExtraEntry) -> Result<()> {
        self.check_writable()?;
        self.extras.push(entry);
        Ok(())
    }

    pub fn manifest(&self) -> &[ManifestEntry] {
        &self.manifest
    }

    /// Write the archive. Consumes the building state: after a successful
    /// commit the assembler accepts no further writes.
    pub fn commit(&mut self, path: &Path) -> Result<()> {
        self.check_writable()?;

        // Every declared entry needs bytes, and every byte-stream a
        // declaration, before anything touches the filesystem.
        for entry in &self.manifest {
            if entry.length.is_none() || !self.contents.contains_key(&entry.href) {
                return Err(Error::ResourceMissing(entry.href.clone()));
            }
        }
        if let Some(orphan) = self
            .contents
            .keys()
            .find(|href| !self.manifest.iter().any(|e| &e.href == *href))
        {
            return Err(Error::FatalInternal(format!(
                "content {orphan} has no manifest entry"
            )));
        }

        if self.version == EpubVersion::V3 {
            self.state = State::Upgrading;
            debug!("upgrading container to EPUB 3 before commit");
            super::upgrade::apply(self)?;
        }

        let tmp = temp_path(path);
        let result = self.write_archive(&tmp).and_then(|()| {
            fs::rename(&tmp, path)?;
            Ok(())
        });
        if result.is_err() {
            let _ = fs::remove_file(&tmp);
            return result;
        }

        self.state = State::Committed;
        info!("wrote {} ({} entries)", path.display(), self.manifest.len());
        Ok(())
    }

    fn write_archive(&self, path: &Path) -> Result<()> {
        let file = fs::File::create(path)?;
        let mut zip = ZipWriter::new(file);

        let stored =
            SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
        let deflated =
            SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

        // The format-identifying entry must be first and uncompressed.
        zip.start_file("mimetype", stored)?;
        zip.write_all(b"application/epub+zip")?;

        zip.start_file("META-INF/container.xml", deflated)?;
        zip.write_all(CONTAINER_XML.as_bytes())?;

        if !self.encryption.is_empty() {
            // CipherReference URIs resolve against the container root,
            // not the package document.
            let records: Vec<EncryptionRecord> = self
                .encryption
                .iter()
                .map(|record| EncryptionRecord {
                    href: format!("OEBPS/{}", record.href),
                    algorithm: record.algorithm.clone(),
                })
                .collect();
            zip.start_file("META-INF/encryption.xml", deflated)?;
            zip.write_all(encryption_xml(&records).as_bytes())?;
        }
        for extra in &self.extras {
            zip.start_file(&extra.name, deflated)?;
            zip.write_all(&extra.data)?;
        }

        zip.start_file("OEBPS/content.opf", deflated)?;
        zip.write_all(self.generate_opf().as_bytes())?;

        zip.start_file("OEBPS/toc.ncx", deflated)?;
        zip.write_all(self.generate_ncx().as_bytes())?;

        let mut hrefs: Vec<&String> = self.contents.keys().collect();
        hrefs.sort();
        for href in hrefs {
            zip.start_file(format!("OEBPS/{href}"), deflated)?;
            zip.write_all(&self.contents[href])?;
        }

        zip.finish()?;
        Ok(())
    }

    fn generate_opf(&self) -> String {
        let version = match self.version {
            EpubVersion::V2 => "2.0",
            EpubVersion::V3 => "3.0",
        };
        let mut opf = format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
             <package xmlns=\"http://www.idpf.org/2007/opf\" version=\"{version}\" unique-identifier=\"BookId\">\n\
             \x20 <metadata xmlns:dc=\"http://purl.org/dc/elements/1.1/\" xmlns:opf=\"http://www.idpf.org/2007/opf\">\n"
        );

        opf.push_str(&format!(
            "    <dc:title>{}</dc:title>\n",
            escape_xml(&self.metadata.title)
        ));
        opf.push_str(&format!(
            "    <dc:identifier id=\"BookId\">{}</dc:identifier>\n",
            escape_xml(&self.metadata.identifier)
        ));
        let language = if self.metadata.language.is_empty() {
            "en"
        } else {
            &self.metadata.language
        };
        opf.push_str(&format!("    <dc:language>{language}</dc:language>\n"));
        for author in &self.metadata.authors {
            opf.push_str(&format!(
                "    <dc:creator>{}</dc:creator>\n",
                escape_xml(author)
            ));
        }
        if self.cover_image.is_some() {
            opf.push_str("    <meta name=\"cover\" content=\"cover-image\"/>\n");
        }
        if self.version == EpubVersion::V3 {
            let modified = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
            opf.push_str(&format!(
                "    <meta property=\"dcterms:modified\">{modified}</meta>\n"
            ));
        }

        opf.push_str("  </metadata>\n  <manifest>\n");
        opf.push_str(
            "    <item id=\"ncx\" href=\"toc.ncx\" media-type=\"application/x-dtbncx+xml\"/>\n",
        );
        for entry in &self.manifest {
            let id = self.item_id(&entry.href);
            let properties = match &entry.properties {
                Some(p) => format!(" properties=\"{p}\""),
                None => String::new(),
            };
            opf.push_str(&format!(
                "    <item id=\"{}\" href=\"{}\" media-type=\"{}\"{}/>\n",
                id,
                escape_xml(&entry.href),
                escape_xml(&entry.media_type),
                properties
            ));
        }
        opf.push_str("  </manifest>\n  <spine toc=\"ncx\">\n");
        for (_, href) in &self.spine {
            opf.push_str(&format!(
                "    <itemref idref=\"{}\"/>\n",
                self.item_id(href)
            ));
        }
        opf.push_str("  </spine>\n");

        if let Some(titlepage) = &self.titlepage {
            opf.push_str(&format!(
                "  <guide>\n    <reference type=\"cover\" title=\"Cover\" href=\"{}\"/>\n  </guide>\n",
                escape_xml(titlepage)
            ));
        }
        opf.push_str("</package>\n");
        opf
    }

    fn item_id(&self, href: &str) -> String {
        if self.cover_image.as_deref() == Some(href) {
            "cover-image".to_string()
        } else {
            href_to_id(href)
        }
    }

    fn generate_ncx(&self) -> String {
        let mut ncx = format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
             <!DOCTYPE ncx PUBLIC \"-//NISO//DTD ncx 2005-1//EN\" \"http://www.daisy.org/z3986/2005/ncx-2005-1.dtd\">\n\
             <ncx xmlns=\"http://www.daisy.org/z3986/2005/ncx/\" version=\"2005-1\">\n\
             \x20 <head>\n\
             \x20   <meta name=\"dtb:uid\" content=\"{}\"/>\n\
             \x20   <meta name=\"dtb:depth\" content=\"1\"/>\n\
             \x20   <meta name=\"dtb:totalPageCount\" content=\"0\"/>\n\
             \x20   <meta name=\"dtb:maxPageNumber\" content=\"0\"/>\n\
             \x20 </head>\n\
             \x20 <docTitle>\n\
             \x20   <text>{}</text>\n\
             \x20 </docTitle>\n\
             \x20 <navMap>\n",
            escape_xml(&self.metadata.identifier),
            escape_xml(&self.metadata.title)
        );

        let mut play_order = 1;
        for entry in &self.toc.entries {
            write_nav_point(&mut ncx, entry, &mut play_order, 2);
        }

        ncx.push_str("  </navMap>\n</ncx>\n");
        ncx
    }
}

fn write_nav_point(ncx: &mut String, entry: &TocEntry, play_order: &mut usize, indent: usize) {
    let pad = "  ".repeat(indent);
    ncx.push_str(&format!(
        "{pad}<navPoint id=\"navpoint-{0}\" playOrder=\"{0}\">\n",
        play_order
    ));
    ncx.push_str(&format!(
        "{pad}  <navLabel>\n{pad}    <text>{}</text>\n{pad}  </navLabel>\n",
        escape_xml(&entry.title)
    ));
    let src = entry
        .anchor
        .as_ref()
        .map(|a| a.to_string())
        .unwrap_or_default();
    ncx.push_str(&format!("{pad}  <content src=\"{}\"/>\n", escape_xml(&src)));
    *play_order += 1;
    for child in &entry.children {
        write_nav_point(ncx, child, play_order, indent + 1);
    }
    ncx.push_str(&format!("{pad}</navPoint>\n"));
}

fn temp_path(path: &Path) -> std::path::PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output.epub".to_string());
    path.with_file_name(format!(".{name}.partial"))
}

pub(super) fn escape_xml(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

pub(super) fn href_to_id(href: &str) -> String {
    let id = href.replace(['/', '.', ' ', '-'], "_");
    if id.starts_with(|c: char| c.is_ascii_digit()) {
        format!("id_{id}")
    } else {
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::book::TocEntry;
    use crate::links::Anchor;
    use std::io::Read;

    fn metadata() -> Metadata {
        Metadata::new("A Book")
            .with_author("Author")
            .with_identifier("urn:uuid:12345678-1234-4234-8234-123456789abc")
    }

    fn staged() -> ContainerAssembler {
        let mut assembler = ContainerAssembler::new(EpubVersion::V2, metadata());
        assembler.declare("ch1.html", "application/xhtml+xml").unwrap();
        assembler
            .supply("ch1.html", b"<html><body><p>x</p></body></html>".to_vec())
            .unwrap();
        assembler.spine.push(("ch1".to_string(), "ch1.html".to_string()));
        assembler
            .toc
            .push(TocEntry::new("Start", Anchor::new("ch1.html")));
        assembler
    }

    #[test]
    fn test_missing_bytes_abort_with_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("book.epub");

        let mut assembler = staged();
        assembler.declare("img.png", "image/png").unwrap();

        let err = assembler.commit(&out).unwrap_err();
        assert!(matches!(err, Error::ResourceMissing(ref href) if href == "img.png"));
        assert!(!out.exists());
        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
    }

    #[test]
    fn test_no_writes_after_commit() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("book.epub");

        let mut assembler = staged();
        assembler.commit(&out).unwrap();

        assert!(matches!(
            assembler.declare("late.png", "image/png"),
            Err(Error::FatalInternal(_))
        ));
        assert!(matches!(
            assembler.supply("ch1.html", vec![]),
            Err(Error::FatalInternal(_))
        ));
        assert!(matches!(
            assembler.commit(&out),
            Err(Error::FatalInternal(_))
        ));
    }

    #[test]
    fn test_mimetype_is_first_and_stored() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("book.epub");
        staged().commit(&out).unwrap();

        let mut archive = zip::ZipArchive::new(std::fs::File::open(&out).unwrap()).unwrap();
        let first = archive.by_index(0).unwrap();
        assert_eq!(first.name(), "mimetype");
        assert_eq!(first.compression(), zip::CompressionMethod::Stored);
        drop(first);

        let mut mimetype = String::new();
        archive
            .by_name("mimetype")
            .unwrap()
            .read_to_string(&mut mimetype)
            .unwrap();
        assert_eq!(mimetype, "application/epub+zip");
    }

    #[test]
    fn test_manifest_matches_written_entries() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("book.epub");

        let mut assembler = staged();
        assembler.declare("style.css", "text/css").unwrap();
        assembler.supply("style.css", b"p{}".to_vec()).unwrap();
        assembler.commit(&out).unwrap();

        let mut archive = zip::ZipArchive::new(std::fs::File::open(&out).unwrap()).unwrap();
        let mut opf = String::new();
        archive
            .by_name("OEBPS/content.opf")
            .unwrap()
            .read_to_string(&mut opf)
            .unwrap();

        for entry in assembler.manifest() {
            assert!(opf.contains(&format!("href=\"{}\"", entry.href)));
            assert!(archive.by_name(&format!("OEBPS/{}", entry.href)).is_ok());
        }
        // And nothing under OEBPS/ that the manifest does not list.
        let names: Vec<String> = (0..archive.len())
            .map(|i| archive.by_index(i).unwrap().name().to_string())
            .collect();
        for name in names {
            if let Some(href) = name.strip_prefix("OEBPS/") {
                if href == "content.opf" || href == "toc.ncx" {
                    continue;
                }
                assert!(
                    assembler.manifest().iter().any(|e| e.href == href),
                    "unlisted entry {href}"
                );
            }
        }
    }

    #[test]
    fn test_encryption_and_extras_written() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("book.epub");

        let mut assembler = staged();
        assembler.declare("fonts/serif.ttf", "font/ttf").unwrap();
        assembler.supply("fonts/serif.ttf", vec![1u8; 2048]).unwrap();
        assembler
            .set_encryption(vec![EncryptionRecord {
                href: "fonts/serif.ttf".to_string(),
                algorithm: crate::fonts::ADOBE_OBFUSCATION.to_string(),
            }])
            .unwrap();
        assembler
            .add_extra_entry(ExtraEntry {
                name: "META-INF/metadata.xml".to_string(),
                media_type: "application/xml".to_string(),
                data: b"<meta/>".to_vec(),
            })
            .unwrap();
        assembler.commit(&out).unwrap();

        assert!(
            assembler
                .manifest()
                .iter()
                .any(|e| e.href == "fonts/serif.ttf" && e.encrypted)
        );

        let mut archive = zip::ZipArchive::new(std::fs::File::open(&out).unwrap()).unwrap();
        let mut enc = String::new();
        archive
            .by_name("META-INF/encryption.xml")
            .unwrap()
            .read_to_string(&mut enc)
            .unwrap();
        // The URI must name the entry's actual container path.
        assert!(enc.contains(r#"URI="OEBPS/fonts/serif.ttf""#));
        assert!(archive.by_name("OEBPS/fonts/serif.ttf").is_ok());
        assert!(archive.by_name("META-INF/metadata.xml").is_ok());
    }

    #[test]
    fn test_opf_guide_references_titlepage() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("book.epub");

        let mut assembler = staged();
        assembler.titlepage = Some("ch1.html".to_string());
        assembler.commit(&out).unwrap();

        let mut archive = zip::ZipArchive::new(std::fs::File::open(&out).unwrap()).unwrap();
        let mut opf = String::new();
        archive
            .by_name("OEBPS/content.opf")
            .unwrap()
            .read_to_string(&mut opf)
            .unwrap();
        assert!(opf.contains(r#"<reference type="cover" title="Cover" href="ch1.html"/>"#));
        assert!(opf.contains(r#"version="2.0""#));
    }

    #[test]
    fn test_href_to_id() {
        assert_eq!(href_to_id("text/ch 1.html"), "text_ch_1_html");
        assert_eq!(href_to_id("01-intro.html"), "id_01_intro_html");
    }
}
