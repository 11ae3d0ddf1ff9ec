//! Cover and TOC finalization.
//!
//! Runs after splitting, immediately before packaging: every book that
//! reaches the assembler has a cover page (when default covers are
//! enabled) and a non-empty table of contents. Also home to the TOC anchor
//! simplification some dedicated readers need.

use log::debug;

use crate::book::{Book, Flow, TocEntry};
use crate::dom::{Document, NodeId, xhtml_skeleton};
use crate::error::{Stage, Warning};
use crate::links::Anchor;

const TITLEPAGE_HREF: &str = "titlepage.xhtml";
const TITLEPAGE_ID: &str = "titlepage";

/// Ensure the book opens on a cover page. When a cover image is marked it
/// is wrapped in a scalable SVG viewport; otherwise a plain title/author
/// page is generated. No-op if a titlepage already exists or default
/// covers are disabled.
pub fn ensure_cover(book: &mut Book, default_cover: bool) {
    if !default_cover || book.titlepage.is_some() {
        return;
    }

    let (mut doc, body) = xhtml_skeleton(&book.metadata.title);
    match &book.cover_image {
        Some(image_href) => build_svg_cover(&mut doc, body, image_href),
        None => build_text_cover(&mut doc, body, book),
    }

    book.spine.insert(
        0,
        Flow {
            id: TITLEPAGE_ID.to_string(),
            href: TITLEPAGE_HREF.to_string(),
            language: None,
            document: doc,
        },
    );
    book.titlepage = Some(TITLEPAGE_HREF.to_string());
}

fn build_svg_cover(doc: &mut Document, body: NodeId, image_href: &str) {
    doc.set_attr(body, "style", "margin:0; padding:0; text-align:center");
    let svg = doc.create_element("svg");
    doc.set_attr(svg, "xmlns", "http://www.w3.org/2000/svg");
    doc.set_attr(svg, "xmlns:xlink", "http://www.w3.org/1999/xlink");
    doc.set_attr(svg, "version", "1.1");
    doc.set_attr(svg, "width", "100%");
    doc.set_attr(svg, "height", "100%");
    doc.set_attr(svg, "viewBox", "0 0 600 800");
    doc.set_attr(svg, "preserveAspectRatio", "xMidYMid meet");
    let image = doc.create_element("image");
    doc.set_attr(image, "width", "600");
    doc.set_attr(image, "height", "800");
    doc.set_attr(image, "xlink:href", image_href);
    doc.append(svg, image);
    doc.append(body, svg);
}

fn build_text_cover(doc: &mut Document, body: NodeId, book: &Book) {
    doc.set_attr(body, "style", "text-align:center");
    let h1 = doc.create_element("h1");
    let title = doc.create_text(&book.metadata.title);
    doc.append(h1, title);
    doc.append(body, h1);
    for author in &book.metadata.authors {
        let h2 = doc.create_element("h2");
        let name = doc.create_text(author);
        doc.append(h2, name);
        doc.append(body, h2);
    }
}

/// Ensure the TOC has at least one node, defaulting to a `Start` entry on
/// the first spine item. Defaulting is a recoverable condition the caller
/// should hear about.
pub fn ensure_toc(book: &mut Book, warnings: &mut Vec<Warning>) {
    if !book.toc.is_empty() {
        return;
    }
    let Some(first) = book.spine.first() else {
        return;
    };
    warnings.push(Warning::new(
        Stage::Cover,
        "no table of contents found, adding a default Start entry",
    ));
    let href = first.href.clone();
    book.toc.push(TocEntry::new("Start", Anchor::new(href)));
}

/// Drop the fragment from TOC anchors whose target sits at the very top
/// of its flow, so readers that scan for anchors can open the file
/// directly.
pub fn simplify_toc_anchors(book: &mut Book) {
    let mut simplified: Vec<(String, String)> = Vec::new();
    let spine = &book.spine;
    let _ = book.toc.try_for_each_mut(&mut |entry| {
        if let Some(anchor) = &mut entry.anchor
            && let Some(frag) = anchor.fragment.clone()
            && let Some(flow) = spine.iter().find(|f| f.href == anchor.href)
            && target_is_at_top(&flow.document, &frag)
        {
            simplified.push((anchor.href.clone(), frag));
            anchor.fragment = None;
        }
        Ok::<(), std::convert::Infallible>(())
    });
    for (href, frag) in simplified {
        debug!("simplified TOC anchor {href}#{frag} to whole-file link");
    }
}

/// True when no content (non-whitespace text or a non-ancestor element)
/// precedes the element with `id` in the body.
fn target_is_at_top(doc: &Document, id: &str) -> bool {
    let Some(target) = doc.find_by_id(id) else {
        return false;
    };
    let Some(body) = doc.body() else {
        return false;
    };
    let ancestors = doc.ancestors(target);
    for node in doc.descendants(body).skip(1) {
        if node == target {
            return true;
        }
        if let Some(text) = doc.text(node) {
            if !text.trim().is_empty() {
                return false;
            }
        } else if !ancestors.contains(&node) {
            return false;
        }
    }
    false
}
