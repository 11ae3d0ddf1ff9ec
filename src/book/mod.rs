//! The format-neutral book model the pipeline consumes.
//!
//! A [`Book`] owns an ordered spine of markup [`Flow`]s, a manifest of
//! non-flow [`Resource`]s (images, fonts, stylesheets), a table of
//! contents, and packaging metadata. The conversion pipeline mutates this
//! model in place before handing it to the container assembler.

use std::collections::HashMap;

use crate::dom::Document;
use crate::links::Anchor;

/// An in-memory book ready for packaging.
#[derive(Debug, Default)]
pub struct Book {
    pub metadata: Metadata,
    /// Reading order. Split fragments are inserted contiguously in place
    /// of the flow they came from.
    pub spine: Vec<Flow>,
    /// Non-flow resources keyed by container-relative href.
    pub resources: HashMap<String, Resource>,
    pub toc: TocTree,
    /// Href of the cover image resource, if one is marked.
    pub cover_image: Option<String>,
    /// Href of the titlepage flow, referenced from the package guide.
    pub titlepage: Option<String>,
    /// Hrefs of font resources to obfuscate at packaging time.
    pub protected_fonts: Vec<String>,
}

/// Book metadata (the Dublin Core subset the package document needs).
#[derive(Debug, Clone, Default)]
pub struct Metadata {
    pub title: String,
    pub authors: Vec<String>,
    pub language: String,
    pub identifier: String,
}

/// One markup document in the spine.
#[derive(Debug, Clone)]
pub struct Flow {
    /// Stable manifest id.
    pub id: String,
    /// Path within the container; unique across the package.
    pub href: String,
    pub language: Option<String>,
    pub document: Document,
}

/// A non-flow resource (image, font, stylesheet).
#[derive(Debug, Clone)]
pub struct Resource {
    pub data: Vec<u8>,
    pub media_type: String,
}

/// Table of contents: a tree of titled anchors.
#[derive(Debug, Clone, Default)]
pub struct TocTree {
    pub entries: Vec<TocEntry>,
}

/// A table of contents node.
#[derive(Debug, Clone)]
pub struct TocEntry {
    pub title: String,
    pub anchor: Option<Anchor>,
    pub children: Vec<TocEntry>,
}

impl Book {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a flow to the spine.
    pub fn add_flow(&mut self, id: impl Into<String>, href: impl Into<String>, document: Document) {
        self.spine.push(Flow {
            id: id.into(),
            href: href.into(),
            language: None,
            document,
        });
    }

    /// Add a non-flow resource to the manifest.
    pub fn add_resource(
        &mut self,
        href: impl Into<String>,
        data: Vec<u8>,
        media_type: impl Into<String>,
    ) {
        self.resources.insert(
            href.into(),
            Resource {
                data,
                media_type: media_type.into(),
            },
        );
    }

    pub fn flow(&self, href: &str) -> Option<&Flow> {
        self.spine.iter().find(|f| f.href == href)
    }

    pub fn flow_mut(&mut self, href: &str) -> Option<&mut Flow> {
        self.spine.iter_mut().find(|f| f.href == href)
    }

    /// Position of a flow in the reading order.
    pub fn flow_index(&self, href: &str) -> Option<usize> {
        self.spine.iter().position(|f| f.href == href)
    }

    /// The first `text/css` resource, treated as the main stylesheet for
    /// stylesheet-level quirk rewrites.
    pub fn main_stylesheet(&self) -> Option<&str> {
        let mut hrefs: Vec<&String> = self
            .resources
            .iter()
            .filter(|(_, r)| r.media_type == "text/css")
            .map(|(href, _)| href)
            .collect();
        hrefs.sort();
        hrefs.into_iter().next().map(|s| s.as_str())
    }
}

impl Metadata {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.authors.push(author.into());
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = identifier.into();
        self
    }
}

impl TocTree {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total number of nodes in the tree.
    pub fn count(&self) -> usize {
        fn walk(entries: &[TocEntry]) -> usize {
            entries.len() + entries.iter().map(|e| walk(&e.children)).sum::<usize>()
        }
        walk(&self.entries)
    }

    pub fn push(&mut self, entry: TocEntry) {
        self.entries.push(entry);
    }

    /// Visit every node, depth-first.
    pub fn for_each(&self, f: &mut impl FnMut(&TocEntry)) {
        fn walk(entries: &[TocEntry], f: &mut impl FnMut(&TocEntry)) {
            for entry in entries {
                f(entry);
                walk(&entry.children, f);
            }
        }
        walk(&self.entries, f);
    }

    /// Visit every node mutably, depth-first, stopping at the first error.
    pub fn try_for_each_mut<E>(
        &mut self,
        f: &mut impl FnMut(&mut TocEntry) -> Result<(), E>,
    ) -> Result<(), E> {
        fn walk<E>(
            entries: &mut [TocEntry],
            f: &mut impl FnMut(&mut TocEntry) -> Result<(), E>,
        ) -> Result<(), E> {
            for entry in entries {
                f(entry)?;
                walk(&mut entry.children, f)?;
            }
            Ok(())
        }
        walk(&mut self.entries, f)
    }
}

impl TocEntry {
    pub fn new(title: impl Into<String>, anchor: Anchor) -> Self {
        Self {
            title: title.into(),
            anchor: Some(anchor),
            children: Vec::new(),
        }
    }

    pub fn with_child(mut self, child: TocEntry) -> Self {
        self.children.push(child);
        self
    }
}
