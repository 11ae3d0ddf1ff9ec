//! Anchors and the link registry.
//!
//! Every structural rewrite that moves content between files or renames a
//! fragment id records the change here. [`LinkRegistry::resolve`] follows
//! rename chains to a fixed point, so a reference recorded against the
//! original layout always lands on the element's current location. This is
//! the core correctness property of the pipeline: after splitting or
//! flattening, every previously valid anchor must still resolve.

use std::collections::{HashMap, HashSet};

use crate::book::Book;
use crate::dom::Document;
use crate::error::{Error, Result};

/// A reference into the package: an href plus an optional fragment id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Anchor {
    pub href: String,
    pub fragment: Option<String>,
}

impl Anchor {
    pub fn new(href: impl Into<String>) -> Self {
        Self {
            href: href.into(),
            fragment: None,
        }
    }

    pub fn with_fragment(href: impl Into<String>, fragment: impl Into<String>) -> Self {
        Self {
            href: href.into(),
            fragment: Some(fragment.into()),
        }
    }

    /// Split a raw href on `#`. An empty fragment is treated as absent.
    pub fn parse(raw: &str) -> Anchor {
        match raw.split_once('#') {
            Some((href, frag)) if !frag.is_empty() => Anchor::with_fragment(href, frag),
            Some((href, _)) => Anchor::new(href),
            None => Anchor::new(raw),
        }
    }
}

impl std::fmt::Display for Anchor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.fragment {
            Some(frag) => write!(f, "{}#{}", self.href, frag),
            None => f.write_str(&self.href),
        }
    }
}

/// Check if an href points outside the package (http://, mailto:, etc.).
pub fn is_external(href: &str) -> bool {
    href.starts_with("http://")
        || href.starts_with("https://")
        || href.starts_with("mailto:")
        || href.starts_with("tel:")
        || href.starts_with("ftp://")
        || href.starts_with("data:")
}

/// Tracks href moves and fragment renames, and resolves anchors recorded
/// against an older layout to their current location.
#[derive(Debug, Default)]
pub struct LinkRegistry {
    moves: HashMap<String, String>,
    fragment_renames: HashMap<Anchor, Anchor>,
}

impl LinkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that every reference to `old_href` now points at `new_href`.
    pub fn record_move(&mut self, old_href: impl Into<String>, new_href: impl Into<String>) {
        let (old, new) = (old_href.into(), new_href.into());
        if old != new {
            self.moves.insert(old, new);
        }
    }

    /// Record that one specific anchor now resolves to another, e.g. when a
    /// fragment id ends up in a different split fragment than its file.
    pub fn record_fragment_rename(&mut self, old: Anchor, new: Anchor) {
        if old != new {
            self.fragment_renames.insert(old, new);
        }
    }

    /// Follow rename chains to a fixed point.
    ///
    /// Resolution is idempotent: resolving an already resolved anchor
    /// returns it unchanged. A cycle in the recorded renames is a pipeline
    /// bug and fails fast.
    pub fn resolve(&self, anchor: &Anchor) -> Result<Anchor> {
        let mut current = anchor.clone();
        let mut seen: HashSet<Anchor> = HashSet::new();

        loop {
            if !seen.insert(current.clone()) {
                return Err(Error::FatalInternal(format!(
                    "link resolution cycle at {current}"
                )));
            }
            if let Some(next) = self.fragment_renames.get(&current) {
                current = next.clone();
                continue;
            }
            if let Some(new_href) = self.moves.get(&current.href) {
                current = Anchor {
                    href: new_href.clone(),
                    fragment: current.fragment,
                };
                continue;
            }
            return Ok(current);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.moves.is_empty() && self.fragment_renames.is_empty()
    }
}

/// Attributes that may carry package-internal references.
const LINK_ATTRS: &[&str] = &["href", "src", "xlink:href"];

/// Expand fragment-only links (`#id`) in every flow to their full
/// `href#id` form, so later href moves apply to them uniformly.
pub fn qualify_links(book: &mut Book) {
    for flow in &mut book.spine {
        let own_href = flow.href.clone();
        qualify_document_links(&mut flow.document, &own_href);
    }
}

fn qualify_document_links(doc: &mut Document, own_href: &str) {
    let nodes: Vec<_> = doc.descendants(doc.root()).collect();
    for node in nodes {
        for attr in LINK_ATTRS {
            if let Some(value) = doc.attr(node, attr)
                && let Some(frag) = value.strip_prefix('#')
            {
                let full = format!("{own_href}#{frag}");
                doc.set_attr(node, attr, &full);
            }
        }
    }
}

/// Rewrite every internal reference in the book (flow link attributes, TOC
/// anchors, cover href, protected-font hrefs) through the registry.
pub fn rewrite_links(book: &mut Book, registry: &LinkRegistry) -> Result<()> {
    if registry.is_empty() {
        return Ok(());
    }

    for flow in &mut book.spine {
        let nodes: Vec<_> = flow.document.descendants(flow.document.root()).collect();
        for node in nodes {
            for attr in LINK_ATTRS {
                let Some(value) = flow.document.attr(node, attr) else {
                    continue;
                };
                if value.is_empty() || is_external(value) {
                    continue;
                }
                let resolved = registry.resolve(&Anchor::parse(value))?;
                flow.document.set_attr(node, attr, &resolved.to_string());
            }
        }
    }

    book.toc.try_for_each_mut(&mut |node| {
        if let Some(anchor) = &node.anchor {
            node.anchor = Some(registry.resolve(anchor)?);
        }
        Ok::<(), Error>(())
    })?;

    if let Some(cover) = &book.cover_image {
        book.cover_image = Some(registry.resolve(&Anchor::new(cover.clone()))?.href);
    }
    for font in &mut book.protected_fonts {
        *font = registry.resolve(&Anchor::new(font.clone()))?.href;
    }

    Ok(())
}
