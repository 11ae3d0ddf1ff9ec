//! Filename flattening and uniquification.
//!
//! Some readers mishandle nested container paths, so the pipeline can
//! strip the internal file structure down to a single directory level.
//! Every rename goes through the [`LinkRegistry`] and is applied with one
//! [`rewrite_links`] pass at the end, the same mechanism splitting uses.

use std::collections::HashSet;

use log::debug;

use crate::book::Book;
use crate::error::Result;
use crate::links::{LinkRegistry, rewrite_links};

/// Move every flow and resource to the container root, renaming on
/// collision, and rewrite all references.
pub fn flatten_filenames(book: &mut Book) -> Result<()> {
    let mut registry = LinkRegistry::new();
    let mut taken: HashSet<String> = HashSet::new();

    let flow_hrefs: Vec<String> = book.spine.iter().map(|f| f.href.clone()).collect();
    for href in flow_hrefs {
        let new = claim(&mut taken, &sanitize(basename(&href)));
        if new != href {
            debug!("flattening {href} -> {new}");
            registry.record_move(&href, &new);
            if let Some(flow) = book.flow_mut(&href) {
                flow.href = new;
            }
        }
    }

    rename_resources(book, &mut registry, &mut taken, |href| {
        sanitize(basename(href))
    });

    rewrite_links(book, &registry)
}

/// Ensure every href in the package is unique without moving files,
/// renaming later duplicates. Flow hrefs are claimed first, in spine
/// order, so reading-order content keeps its name.
pub fn uniquify_filenames(book: &mut Book) -> Result<()> {
    let mut registry = LinkRegistry::new();
    let mut taken: HashSet<String> = HashSet::new();

    let flow_hrefs: Vec<String> = book.spine.iter().map(|f| f.href.clone()).collect();
    for href in flow_hrefs {
        let new = claim(&mut taken, &href);
        if new != href {
            registry.record_move(&href, &new);
            if let Some(flow) = book.flow_mut(&href) {
                flow.href = new;
            }
        }
    }

    rename_resources(book, &mut registry, &mut taken, |href| href.to_string());

    rewrite_links(book, &registry)
}

fn rename_resources(
    book: &mut Book,
    registry: &mut LinkRegistry,
    taken: &mut HashSet<String>,
    target: impl Fn(&str) -> String,
) {
    let mut hrefs: Vec<String> = book.resources.keys().cloned().collect();
    hrefs.sort();
    for href in hrefs {
        let new = claim(taken, &target(&href));
        if new != href {
            debug!("renaming resource {href} -> {new}");
            registry.record_move(&href, &new);
            if let Some(resource) = book.resources.remove(&href) {
                book.resources.insert(new, resource);
            }
        }
    }
}

fn basename(href: &str) -> &str {
    href.rsplit('/').next().unwrap_or(href)
}

/// Replace characters that are unsafe in container paths or URLs.
fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.trim_matches(['_', '.']).is_empty() {
        "file".to_string()
    } else {
        cleaned
    }
}

/// Claim `want` in `taken`, appending `_N` before the extension until the
/// name is free.
fn claim(taken: &mut HashSet<String>, want: &str) -> String {
    if taken.insert(want.to_string()) {
        return want.to_string();
    }
    let (stem, ext) = match want.rsplit_once('.') {
        Some((s, e)) if !s.is_empty() => (s, Some(e)),
        _ => (want, None),
    };
    for n in 1u32.. {
        let candidate = match ext {
            Some(ext) => format!("{stem}_{n}.{ext}"),
            None => format!("{stem}_{n}"),
        };
        if taken.insert(candidate.clone()) {
            return candidate;
        }
    }
    unreachable!()
}
