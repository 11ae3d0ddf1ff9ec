//! Flow splitting.
//!
//! Most reflow renderers choke on large content documents, so any flow over
//! a configured byte budget is partitioned into multiple physical files.
//! Splits happen only at block-level boundaries so each fragment stands
//! alone as a well-formed document; page-break markers force a split
//! regardless of size and take precedence over the size accumulator at the
//! same boundary. Every id that lands in a continuation fragment is
//! recorded in the [`LinkRegistry`] so existing references keep resolving.

use log::debug;

use crate::book::{Book, Flow};
use crate::dom::{Document, NodeId};
use crate::error::{Error, Result};
use crate::links::{Anchor, LinkRegistry};

/// Elements a split may occur at (and whose ancestors permit splitting
/// through them). Content inside anything else, e.g. a table row, is only
/// split as a last resort.
pub const BLOCK_LEVEL_TAGS: &[&str] = &[
    "address",
    "body",
    "blockquote",
    "center",
    "dir",
    "div",
    "dl",
    "fieldset",
    "form",
    "h1",
    "h2",
    "h3",
    "h4",
    "h5",
    "h6",
    "hr",
    "isindex",
    "menu",
    "noframes",
    "noscript",
    "ol",
    "p",
    "pre",
    "table",
    "ul",
];

fn is_block_level(name: &str) -> bool {
    BLOCK_LEVEL_TAGS.contains(&name)
}

/// Splits oversized flows at block boundaries and page-break markers.
pub struct Splitter {
    /// Maximum serialized size per fragment in bytes; 0 disables
    /// size-based splitting.
    max_size: usize,
    /// Whether page-break markers force splits.
    on_page_breaks: bool,
}

impl Splitter {
    pub fn new(max_size: usize, on_page_breaks: bool) -> Self {
        Self {
            max_size,
            on_page_breaks,
        }
    }

    /// Split every spine flow in place, keeping reading order: fragments
    /// replace their source flow contiguously.
    pub fn split_book(&self, book: &mut Book, registry: &mut LinkRegistry) -> Result<()> {
        if self.max_size == 0 && !self.on_page_breaks {
            return Ok(());
        }
        let spine = std::mem::take(&mut book.spine);
        let mut new_spine = Vec::with_capacity(spine.len());
        for flow in spine {
            new_spine.extend(self.split_flow(flow, registry)?);
        }
        book.spine = new_spine;
        Ok(())
    }

    /// Split one flow. A flow under the threshold with no forced page
    /// breaks comes back untouched as a single fragment with its original
    /// href.
    pub fn split_flow(&self, mut flow: Flow, registry: &mut LinkRegistry) -> Result<Vec<Flow>> {
        let original_href = flow.href.clone();
        let document = std::mem::replace(&mut flow.document, Document::new("html"));
        let mut docs = self.split_document(document)?;
        if docs.len() == 1 {
            if let Some(document) = docs.pop() {
                flow.document = document;
            }
            return Ok(vec![flow]);
        }

        debug!("split {original_href} into {} fragments", docs.len());

        let (stem, ext) = match original_href.rsplit_once('.') {
            Some((stem, ext)) => (stem.to_string(), ext.to_string()),
            None => (original_href.clone(), "html".to_string()),
        };

        let mut flows = Vec::with_capacity(docs.len());
        for (i, document) in docs.into_iter().enumerate() {
            let (id, href) = if i == 0 {
                (flow.id.clone(), original_href.clone())
            } else {
                (
                    format!("{}_split_{:03}", flow.id, i),
                    format!("{stem}_split_{i:03}.{ext}"),
                )
            };

            // Fragment ids that moved out of the original file must keep
            // resolving; fragment 0 retains the original href, so only
            // continuations need rename records.
            if i > 0 {
                for (id_value, _) in document.collect_ids() {
                    registry.record_fragment_rename(
                        Anchor::with_fragment(original_href.clone(), id_value.clone()),
                        Anchor::with_fragment(href.clone(), id_value),
                    );
                }
            }

            flows.push(Flow {
                id,
                href,
                language: flow.language.clone(),
                document,
            });
        }
        Ok(flows)
    }

    fn split_document(&self, doc: Document) -> Result<Vec<Document>> {
        let mut fragments = Vec::new();
        let mut work = doc;
        loop {
            if fragments.len() > 10_000 {
                return Err(Error::FatalInternal(
                    "runaway split: over 10000 fragments from one flow".into(),
                ));
            }
            match self.find_split_point(&mut work) {
                Some(point) => {
                    let (front, back) = split_tree(&work, point)?;
                    fragments.push(front);
                    work = back;
                }
                None => {
                    fragments.push(work);
                    break;
                }
            }
        }
        Ok(fragments)
    }

    /// Locate the next split point in document order, or `None` if the
    /// document fits. Page-break markers win over the size accumulator;
    /// size overflow splits at the nearest preceding permitted boundary,
    /// falling back to an interior element boundary inside a single giant
    /// block. A giant text run with no boundary at all is cut in two and
    /// the split lands on the new second half. Points that would leave an
    /// empty front fragment are never returned.
    fn find_split_point(&self, doc: &mut Document) -> Option<NodeId> {
        let body = doc.body()?;

        // Fixed overhead: everything outside the body content (head,
        // html/body tags) is duplicated into each fragment.
        let mut size = doc.size_estimate() - doc.subtree_size(body) + doc.node_size(body);
        let mut last_boundary: Option<NodeId> = None;
        let mut seen_content = false;

        let nodes: Vec<NodeId> = doc.descendants(body).skip(1).collect();
        for node in nodes {
            let permitted = self.is_permitted_boundary(doc, node, body);

            if self.on_page_breaks && seen_content && permitted && doc.has_page_break(node) {
                return Some(node);
            }

            if seen_content && permitted {
                last_boundary = Some(node);
            }

            size += doc.node_size(node);

            if self.max_size > 0 && size > self.max_size {
                if let Some(boundary) = last_boundary {
                    return Some(boundary);
                }
                // Single giant block: permit an interior split, cloning
                // the ancestor chain, rather than producing an oversized
                // fragment.
                if seen_content && doc.is_element(node) {
                    return Some(node);
                }
                if seen_content
                    && let Some(rest) = split_text_run(doc, node, size - self.max_size)
                {
                    return Some(rest);
                }
            }

            if doc.is_element(node) || doc.text(node).is_some_and(|t| !t.trim().is_empty()) {
                seen_content = true;
            }
        }
        None
    }

    /// A split is permitted at block-level elements whose ancestry up to
    /// the body is all block-level; splitting elsewhere would orphan
    /// required context (e.g. a table row).
    fn is_permitted_boundary(&self, doc: &Document, node: NodeId, body: NodeId) -> bool {
        let Some(name) = doc.name(node) else {
            return false;
        };
        if !is_block_level(name) {
            return false;
        }
        let mut cur = doc.parent(node);
        while cur.is_some() && cur != body {
            match doc.name(cur) {
                Some(parent_name) if is_block_level(parent_name) => {}
                _ => return false,
            }
            cur = doc.parent(cur);
        }
        true
    }
}

/// Partition a document at `point`: the front keeps everything strictly
/// before it in document order, the back starts with it. The ancestor
/// chain of `point` is cloned into both halves; continuation copies of
/// ancestors drop their `id`/`name` attributes so no identifier exists in
/// two fragments.
fn split_tree(doc: &Document, point: NodeId) -> Result<(Document, Document)> {
    // Path from the root down to the split point.
    let mut path = doc.ancestors(point);
    path.reverse();
    path.push(point);
    if path.len() < 2 {
        return Err(Error::FatalInternal("cannot split at the root".into()));
    }

    let mut front = doc.clone();
    let mut back = doc.clone();

    // Front: drop every sibling after the path at each level, then the
    // point itself.
    for &n in &path[1..] {
        let mut sib = front.next_sibling(n);
        while sib.is_some() {
            let next = front.next_sibling(sib);
            front.detach(sib);
            sib = next;
        }
    }
    front.detach(point);

    // Back: drop every sibling before the path at each level; the point
    // and everything after it remain.
    for &n in &path[1..] {
        let mut sib = back.prev_sibling(n);
        while sib.is_some() {
            let prev = back.prev_sibling(sib);
            back.detach(sib);
            sib = prev;
        }
    }

    // Cloned ancestor context in the continuation must not duplicate
    // identifiers; the front copy keeps them.
    for &n in &path[1..path.len() - 1] {
        back.remove_attr(n, "id");
        back.remove_attr(n, "name");
    }

    let front_has_content = front
        .body()
        .map(|b| front.children(b).next().is_some())
        .unwrap_or(false);
    if !front_has_content {
        return Err(Error::FatalInternal(
            "split produced an empty front fragment".into(),
        ));
    }

    Ok((front, back))
}

/// Cut an oversized text node so roughly `overshoot` bytes move into a new
/// sibling text node, which becomes the split point. Returns `None` when
/// the text is too short to cut.
fn split_text_run(doc: &mut Document, node: NodeId, overshoot: usize) -> Option<NodeId> {
    let text = doc.text(node)?;
    if text.len() < 2 {
        return None;
    }
    let mut keep = text.len().saturating_sub(overshoot).clamp(1, text.len() - 1);
    while !text.is_char_boundary(keep) {
        keep -= 1;
    }
    if keep == 0 {
        return None;
    }
    let head = text[..keep].to_string();
    let tail = text[keep..].to_string();

    doc.set_text(node, &head);
    let rest = doc.create_text(&tail);
    let next = doc.next_sibling(node);
    if next.is_some() {
        doc.insert_before(next, rest);
    } else {
        let parent = doc.parent(node);
        doc.append(parent, rest);
    }
    Some(rest)
}
