//! Generated in-book table of contents.
//!
//! Builds an XHTML flow mirroring the TOC tree as nested lists and inserts
//! it at the start or end of the spine. It runs before filename rewrites,
//! quirks, and splitting, so the generated flow is cleaned and split like
//! any authored content.

use crate::book::{Book, Flow, TocEntry};
use crate::dom::{Document, NodeId, xhtml_skeleton};
use crate::links::Anchor;

/// Where the generated TOC flow goes in the reading order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TocPlacement {
    Start,
    End,
}

pub const DEFAULT_TOC_TITLE: &str = "Table of Contents";

const TOC_HREF: &str = "inline_toc.html";
const TOC_ID: &str = "inline-toc";

/// Insert a generated TOC flow. No-op when the TOC tree is empty.
pub fn insert_inline_toc(book: &mut Book, placement: TocPlacement, title: Option<&str>) {
    if book.toc.is_empty() {
        return;
    }
    let title = title.unwrap_or(DEFAULT_TOC_TITLE);

    let (mut doc, body) = xhtml_skeleton(title);
    let heading = doc.create_element("h1");
    doc.set_attr(heading, "class", "toc-title");
    let text = doc.create_text(title);
    doc.append(heading, text);
    doc.append(body, heading);

    let list = build_list(&mut doc, &book.toc.entries);
    doc.append(body, list);

    let flow = Flow {
        id: TOC_ID.to_string(),
        href: TOC_HREF.to_string(),
        language: None,
        document: doc,
    };
    match placement {
        TocPlacement::Start => book.spine.insert(0, flow),
        TocPlacement::End => book.spine.push(flow),
    }

    // The generated page is itself reachable from the TOC.
    let entry = TocEntry::new(title, Anchor::new(TOC_HREF));
    match placement {
        TocPlacement::Start => book.toc.entries.insert(0, entry),
        TocPlacement::End => book.toc.entries.push(entry),
    }
}

fn build_list(doc: &mut Document, entries: &[TocEntry]) -> NodeId {
    let ul = doc.create_element("ul");
    doc.set_attr(ul, "class", "toc-level");
    for entry in entries {
        let li = doc.create_element("li");
        match &entry.anchor {
            Some(anchor) => {
                let a = doc.create_element("a");
                doc.set_attr(a, "href", &anchor.to_string());
                let text = doc.create_text(&entry.title);
                doc.append(a, text);
                doc.append(li, a);
            }
            None => {
                let span = doc.create_element("span");
                let text = doc.create_text(&entry.title);
                doc.append(span, text);
                doc.append(li, span);
            }
        }
        if !entry.children.is_empty() {
            let child_list = build_list(doc, &entry.children);
            doc.append(li, child_list);
        }
        doc.append(ul, li);
    }
    ul
}
