//! Renderer-compatibility rewrites.
//!
//! A fixed, ordered list of idempotent tree rewrites that normalize markup
//! for constrained reflow renderers (Adobe Digital Editions being the
//! worst offender). Each rule is self-contained and unit-tested on its
//! own, but the documented order is mandatory: later rules assume earlier
//! cleanup (duplicate-id removal must precede name-to-id promotion, for
//! example).

use std::collections::HashSet;

use log::warn;
use percent_encoding::percent_decode_str;

use crate::book::Book;
use crate::dom::{Document, NodeId};
use crate::error::{Stage, Warning};
use crate::transform::split::BLOCK_LEVEL_TAGS;

/// Applies the full rewrite sequence to every spine flow, the TOC, and
/// the main stylesheet.
pub struct QuirksTransformer;

impl QuirksTransformer {
    pub fn apply(book: &mut Book, warnings: &mut Vec<Warning>) {
        for flow in &mut book.spine {
            let doc = &mut flow.document;
            retag_empty_pre(doc);
            normalize_lang(doc);
            dedupe_identifiers(doc);
            retag_underline(doc);
        }

        sanitize_toc_fragments(book, warnings);

        for flow in &mut book.spine {
            let doc = &mut flow.document;
            remove_bad_images(doc);
            promote_name_anchors(doc);
            replace_body_breaks(doc);
            remove_embeds(doc);
            remove_empty_head_elements(doc);
            remove_body_scripts(doc);
            fix_forms(doc);
            retag_center(doc);
            strip_img_ampersands(doc);
            fix_stray_table_cells(doc);
            strip_special_characters(doc);
        }

        fix_stylesheet(book);
    }
}

fn is_block_level(name: &str) -> bool {
    BLOCK_LEVEL_TAGS.contains(&name)
}

fn elements_named(doc: &Document, name: &str) -> Vec<NodeId> {
    doc.descendants(doc.root())
        .filter(|&id| doc.name(id) == Some(name))
        .collect()
}

/// A `pre` with no text and no children renders as a stray box in webkit
/// based readers; retag it to a `div`.
pub fn retag_empty_pre(doc: &mut Document) {
    for pre in elements_named(doc, "pre") {
        if doc.children(pre).next().is_none() {
            doc.set_name(pre, "div");
        }
    }
}

/// Rule 1: copy a legacy `lang` attribute on the root to the canonical
/// `xml:lang`, only when the canonical one is absent.
pub fn normalize_lang(doc: &mut Document) {
    let root = doc.root();
    if doc.attr(root, "xml:lang").is_none()
        && let Some(lang) = doc.attr(root, "lang").map(|s| s.to_string())
    {
        doc.set_attr(root, "xml:lang", &lang);
    }
}

/// Rule 2: de-duplicate `id` and `name` attributes document-wide; the
/// first occurrence wins.
pub fn dedupe_identifiers(doc: &mut Document) {
    let mut seen_ids: HashSet<String> = HashSet::new();
    let mut seen_names: HashSet<String> = HashSet::new();
    let nodes: Vec<_> = doc.descendants(doc.root()).collect();
    for node in nodes {
        if let Some(id) = doc.attr(node, "id").map(|s| s.to_string()) {
            if !seen_ids.insert(id) {
                doc.remove_attr(node, "id");
            }
        }
        if let Some(name) = doc.attr(node, "name").map(|s| s.to_string()) {
            if !seen_names.insert(name) {
                doc.remove_attr(node, "name");
            }
        }
    }
}

/// Rule 3: retag the legacy underline element to a neutral `span`.
/// Pixel-perfect underline styling is deliberately not preserved.
pub fn retag_underline(doc: &mut Document) {
    for u in elements_named(doc, "u") {
        doc.set_name(u, "span");
    }
}

fn fragment_is_token_safe(frag: &str) -> bool {
    !frag.is_empty()
        && frag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'))
}

/// Rule 4: drop TOC fragment identifiers that fail the strict token
/// pattern, falling back to the whole-document anchor. Non-fatal.
pub fn sanitize_toc_fragments(book: &mut Book, warnings: &mut Vec<Warning>) {
    let mut dropped: Vec<String> = Vec::new();
    let _ = book.toc.try_for_each_mut(&mut |entry| {
        if let Some(anchor) = &mut entry.anchor
            && let Some(frag) = &anchor.fragment
        {
            let decoded = percent_decode_str(frag).decode_utf8_lossy().into_owned();
            if !fragment_is_token_safe(&decoded) {
                dropped.push(format!("{}#{}", anchor.href, frag));
                anchor.fragment = None;
            }
        }
        Ok::<(), std::convert::Infallible>(())
    });
    for link in dropped {
        warn!("removing fragment identifier from TOC entry {link}");
        warnings.push(Warning::new(
            Stage::Quirks,
            format!("removed unsafe fragment identifier from TOC entry {link}"),
        ));
    }
}

/// Rule 5: remove images whose source is empty, `#`, or an insecure
/// absolute URL.
pub fn remove_bad_images(doc: &mut Document) {
    for img in elements_named(doc, "img") {
        let src = doc.attr(img, "src").unwrap_or("").trim().to_string();
        if src.is_empty() || src == "#" || src.starts_with("http:") {
            doc.detach(img);
        }
    }
}

/// Rule 6: promote `name`-only anchor targets to carry an `id`, then drop
/// the legacy `name` attribute. Validators reject `name` on anchors.
pub fn promote_name_anchors(doc: &mut Document) {
    for a in elements_named(doc, "a") {
        if let Some(name) = doc.attr(a, "name").map(|s| s.to_string()) {
            if doc.attr(a, "id").is_none() {
                doc.set_attr(a, "id", &name);
            }
            doc.remove_attr(a, "name");
        }
    }
}

/// Rule 7: replace `br` elements that are direct children of `body` with
/// an empty nbsp paragraph. Height is one line when the preceding sibling
/// is a block with no trailing text (a genuine blank line), otherwise
/// zero, so renderers that ignore body-level breaks still show the
/// intended spacing.
pub fn replace_body_breaks(doc: &mut Document) {
    let Some(body) = doc.body() else {
        return;
    };
    let breaks: Vec<NodeId> = doc
        .children(body)
        .filter(|&id| doc.name(id) == Some("br"))
        .collect();

    for br in breaks {
        // Text between the previous element and the break counts as that
        // element's trailing text.
        let mut prior_text = String::new();
        let mut prior_tag: Option<String> = None;
        let mut cur = doc.prev_sibling(br);
        while cur.is_some() {
            if let Some(t) = doc.text(cur) {
                prior_text.push_str(t);
            } else if doc.is_element(cur) {
                prior_tag = doc.name(cur).map(|s| s.to_string());
                break;
            }
            cur = doc.prev_sibling(cur);
        }
        let prior_tag = prior_tag.unwrap_or_else(|| "body".to_string());

        doc.set_name(br, "p");
        let nbsp = doc.create_text("\u{a0}");
        doc.append(br, nbsp);

        let mut style: Vec<String> = doc
            .attr(br, "style")
            .unwrap_or("")
            .split(';')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        style.push("margin:0pt".to_string());
        style.push("border:0pt".to_string());
        if prior_text.trim().is_empty() && is_block_level(&prior_tag) {
            style.push("height:1em".to_string());
        } else {
            style.push("height:0pt".to_string());
        }
        doc.set_attr(br, "style", &style.join("; "));
    }
}

/// Rule 8: plugin content is unsupported; drop `embed` entirely and
/// `object` unless it declares an image/svg media type.
pub fn remove_embeds(doc: &mut Document) {
    for embed in elements_named(doc, "embed") {
        doc.detach(embed);
    }
    for object in elements_named(doc, "object") {
        let media_type = doc
            .attr(object, "type")
            .unwrap_or("")
            .trim()
            .to_ascii_lowercase();
        if media_type != "image/svg+xml" && media_type != "application/svg+xml" {
            doc.detach(object);
        }
    }
}

/// Rule 9: remove empty `title`/`style` elements, and `script` elements
/// with neither text nor a source, except the mathjax config type which
/// readers with script support still need.
pub fn remove_empty_head_elements(doc: &mut Document) {
    for tag in ["title", "style"] {
        for node in elements_named(doc, tag) {
            if doc.text_content(node).is_empty() {
                doc.detach(node);
            }
        }
    }
    for script in elements_named(doc, "script") {
        let has_text = !doc.text_content(script).is_empty();
        let has_src = doc.attr(script, "src").is_some();
        let is_config = doc.attr(script, "type") == Some("text/x-mathjax-config");
        if !has_text && !has_src && !is_config {
            doc.detach(script);
        }
    }
}

/// Rule 10: no scripts anywhere under `body`.
pub fn remove_body_scripts(doc: &mut Document) {
    let Some(body) = doc.body() else {
        return;
    };
    let scripts: Vec<NodeId> = doc
        .descendants(body)
        .skip(1)
        .filter(|&id| doc.name(id) == Some("script"))
        .collect();
    for script in scripts {
        doc.detach(script);
    }
}

const FORM_CONTROLS: &[&str] = &["input", "button", "textarea", "label", "fieldset", "legend"];

/// Rule 11: drop genuinely interactive forms; retag decorative ones
/// (no form controls among direct children) to a neutral `div`.
pub fn fix_forms(doc: &mut Document) {
    for form in elements_named(doc, "form") {
        let interactive = doc.children(form).any(|child| {
            doc.name(child)
                .is_some_and(|name| FORM_CONTROLS.contains(&name))
        });
        if interactive {
            doc.detach(form);
        } else {
            doc.set_name(form, "div");
        }
    }
}

/// Rule 12: `center` becomes a `div` with equivalent text centering.
pub fn retag_center(doc: &mut Document) {
    for center in elements_named(doc, "center") {
        doc.set_name(center, "div");
        doc.set_attr(center, "style", "text-align:center");
    }
}

/// Rule 13: ampersands in image URLs are unparseable for some renderers.
pub fn strip_img_ampersands(doc: &mut Document) {
    for img in elements_named(doc, "img") {
        if let Some(src) = doc.attr(img, "src").map(|s| s.to_string())
            && src.contains('&')
        {
            doc.set_attr(img, "src", &src.replace('&', ""));
        }
    }
}

/// Rule 14: table cells and rows outside any table confuse renderers;
/// repair the malformed markup by retagging them to `div`.
pub fn fix_stray_table_cells(doc: &mut Document) {
    for tag in ["td", "tr", "th"] {
        for node in elements_named(doc, tag) {
            let in_table = doc
                .ancestors(node)
                .iter()
                .any(|&a| doc.name(a) == Some("table"));
            if !in_table {
                doc.set_name(node, "div");
            }
        }
    }
}

/// Rule 15: strip zero-width spaces and soft hyphens, and replace the
/// non-breaking hyphen with a plain one, in all text content.
pub fn strip_special_characters(doc: &mut Document) {
    let nodes: Vec<_> = doc.descendants(doc.root()).collect();
    for node in nodes {
        let Some(text) = doc.text(node) else {
            continue;
        };
        if text.contains(['\u{200b}', '\u{ad}', '\u{2011}']) {
            let cleaned: String = text
                .chars()
                .filter(|c| !matches!(c, '\u{200b}' | '\u{ad}'))
                .map(|c| if c == '\u{2011}' { '-' } else { c })
                .collect();
            doc.set_text(node, &cleaned);
        }
    }
}

/// Rule 16: stylesheet-level fixes. Left margins/padding break list
/// rendering, so rules whose selector matches a list element's class lose
/// them; `white-space: pre` becomes `pre-wrap` so readers that cannot
/// scroll horizontally still show all the text.
pub fn fix_stylesheet(book: &mut Book) {
    let Some(href) = book.main_stylesheet().map(|s| s.to_string()) else {
        return;
    };

    let mut list_selectors: HashSet<String> = HashSet::new();
    for flow in &book.spine {
        let doc = &flow.document;
        for tag in ["ul", "ol"] {
            for node in elements_named(doc, tag) {
                if let Some(class) = doc.attr(node, "class") {
                    list_selectors.insert(format!(".{class}"));
                }
            }
        }
    }

    if let Some(resource) = book.resources.get_mut(&href) {
        let css = String::from_utf8_lossy(&resource.data).into_owned();
        let rewritten = rewrite_stylesheet(&css, &list_selectors);
        resource.data = rewritten.into_bytes();
    }
}

/// Rewrite a stylesheet rule-by-rule. Only flat `selector { decls }`
/// blocks are handled; anything else passes through untouched.
fn rewrite_stylesheet(css: &str, list_selectors: &HashSet<String>) -> String {
    let mut out = String::with_capacity(css.len());
    let mut rest = css;

    while let Some(open) = rest.find('{') {
        let Some(close_rel) = rest[open..].find('}') else {
            break;
        };
        let close = open + close_rel;
        let selector = rest[..open].trim();
        let body = &rest[open + 1..close];

        let is_list_rule = list_selectors.contains(selector);
        let decls: Vec<String> = body
            .split(';')
            .map(|d| d.trim())
            .filter(|d| !d.is_empty())
            .filter(|d| {
                if !is_list_rule {
                    return true;
                }
                let prop = d.split(':').next().unwrap_or("").trim().to_ascii_lowercase();
                prop != "margin-left" && prop != "padding-left"
            })
            .map(|d| {
                let (prop, value) = match d.split_once(':') {
                    Some((p, v)) => (p.trim(), v.trim()),
                    None => return d.to_string(),
                };
                if prop.eq_ignore_ascii_case("white-space") && value == "pre" {
                    format!("{prop}: pre-wrap")
                } else {
                    d.to_string()
                }
            })
            .collect();

        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(selector);
        out.push_str("{ ");
        out.push_str(&decls.join("; "));
        out.push_str(" }");
        rest = &rest[close + 1..];
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::book::{TocEntry, TocTree};
    use crate::links::Anchor;

    fn doc(body: &str) -> Document {
        Document::parse(&format!(
            "<html><head><title>t</title></head><body>{body}</body></html>"
        ))
        .unwrap()
    }

    #[test]
    fn test_retag_empty_pre() {
        let mut d = doc("<pre/><pre>keep</pre>");
        retag_empty_pre(&mut d);
        let out = d.to_xhtml();
        assert!(out.contains("<div/>"));
        assert!(out.contains("<pre>keep</pre>"));
    }

    #[test]
    fn test_normalize_lang() {
        let mut d = Document::parse(r#"<html lang="de"><body/></html>"#).unwrap();
        normalize_lang(&mut d);
        assert_eq!(d.attr(d.root(), "xml:lang"), Some("de"));

        // Canonical attribute is never overwritten.
        let mut d = Document::parse(r#"<html lang="de" xml:lang="fr"><body/></html>"#).unwrap();
        normalize_lang(&mut d);
        assert_eq!(d.attr(d.root(), "xml:lang"), Some("fr"));
    }

    #[test]
    fn test_dedupe_identifiers_first_wins() {
        let mut d = doc(r#"<a id="x">one</a><a id="x">two</a><p id="x">three</p>"#);
        dedupe_identifiers(&mut d);
        let with_id: Vec<_> = d
            .descendants(d.root())
            .filter(|&n| d.attr(n, "id") == Some("x"))
            .collect();
        assert_eq!(with_id.len(), 1);
        assert_eq!(d.text_content(with_id[0]), "one");
    }

    #[test]
    fn test_dedupe_identifiers_is_confluent() {
        let make = || doc(r#"<a id="x"/><a id="x"/><p name="n"/><p name="n"/>"#);
        let mut once = make();
        dedupe_identifiers(&mut once);
        let mut twice = make();
        dedupe_identifiers(&mut twice);
        dedupe_identifiers(&mut twice);
        assert_eq!(once.to_xhtml(), twice.to_xhtml());
    }

    #[test]
    fn test_retag_underline() {
        let mut d = doc("<u>under</u>");
        retag_underline(&mut d);
        assert!(d.to_xhtml().contains("<span>under</span>"));
    }

    #[test]
    fn test_sanitize_toc_fragments() {
        let mut book = Book::new();
        let mut toc = TocTree::default();
        toc.push(TocEntry::new("ok", Anchor::with_fragment("a.html", "ch-1.2")));
        toc.push(TocEntry::new("bad", Anchor::with_fragment("a.html", "no spaces!")));
        book.toc = toc;

        let mut warnings = Vec::new();
        sanitize_toc_fragments(&mut book, &mut warnings);

        assert_eq!(
            book.toc.entries[0].anchor.as_ref().unwrap().fragment.as_deref(),
            Some("ch-1.2")
        );
        assert_eq!(book.toc.entries[1].anchor.as_ref().unwrap().fragment, None);
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn test_remove_bad_images() {
        let mut d = doc(
            r##"<img src=""/><img src="#"/><img src="http://x.com/a.png"/><img src="ok.png"/>"##,
        );
        remove_bad_images(&mut d);
        let imgs: Vec<_> = d
            .descendants(d.root())
            .filter(|&n| d.name(n) == Some("img"))
            .collect();
        assert_eq!(imgs.len(), 1);
        assert_eq!(d.attr(imgs[0], "src"), Some("ok.png"));
    }

    #[test]
    fn test_promote_name_anchors() {
        let mut d = doc(r#"<a name="target">x</a><a name="other" id="kept">y</a>"#);
        promote_name_anchors(&mut d);
        let out = d.to_xhtml();
        assert!(out.contains(r#"id="target""#));
        assert!(out.contains(r#"id="kept""#));
        assert!(!out.contains("name="));
    }

    #[test]
    fn test_replace_body_breaks_heights() {
        // After a block with no trailing text: one line of height.
        let mut d = doc("<p>para</p><br/>");
        replace_body_breaks(&mut d);
        let out = d.to_xhtml();
        assert!(!out.contains("<br"));
        assert!(out.contains("height:1em"));
        assert!(out.contains("margin:0pt"));
        assert!(out.contains("\u{a0}") || out.contains("&#160;"));

        // After trailing text: no height.
        let mut d = doc("<p>para</p>tail text<br/>");
        replace_body_breaks(&mut d);
        assert!(d.to_xhtml().contains("height:0pt"));

        // After an inline element: no height.
        let mut d = doc("<span>inline</span><br/>");
        replace_body_breaks(&mut d);
        assert!(d.to_xhtml().contains("height:0pt"));
    }

    #[test]
    fn test_remove_embeds_and_objects() {
        let mut d = doc(
            r#"<embed src="x.swf"/><object type="image/svg+xml">svg</object><object type="application/x-shockwave-flash">f</object>"#,
        );
        remove_embeds(&mut d);
        let out = d.to_xhtml();
        assert!(!out.contains("embed"));
        assert!(out.contains(r#"<object type="image/svg+xml">svg</object>"#));
        assert!(!out.contains("shockwave"));
    }

    #[test]
    fn test_remove_empty_head_elements() {
        let mut d = Document::parse(
            r#"<html><head><title/><style/><script type="text/x-mathjax-config"/><script/></head><body><p>x</p></body></html>"#,
        )
        .unwrap();
        remove_empty_head_elements(&mut d);
        let out = d.to_xhtml();
        assert!(!out.contains("<title"));
        assert!(!out.contains("<style"));
        assert!(out.contains("text/x-mathjax-config"));
        assert_eq!(out.matches("<script").count(), 1);
    }

    #[test]
    fn test_remove_body_scripts() {
        let mut d = doc(r#"<div><script src="app.js">code</script></div><p>keep</p>"#);
        remove_body_scripts(&mut d);
        let out = d.to_xhtml();
        assert!(!out.contains("script"));
        assert!(out.contains("<p>keep</p>"));
    }

    #[test]
    fn test_fix_forms() {
        let mut d = doc(r#"<form><input type="text"/></form><form><p>decorative</p></form>"#);
        fix_forms(&mut d);
        let out = d.to_xhtml();
        assert!(!out.contains("<form"));
        assert!(!out.contains("input"));
        assert!(out.contains("<div><p>decorative</p></div>"));
    }

    #[test]
    fn test_retag_center() {
        let mut d = doc("<center>mid</center>");
        retag_center(&mut d);
        assert!(d
            .to_xhtml()
            .contains(r#"<div style="text-align:center">mid</div>"#));
    }

    #[test]
    fn test_strip_img_ampersands() {
        let mut d = doc(r#"<img src="a.png?x=1&amp;y=2"/>"#);
        strip_img_ampersands(&mut d);
        let img = d.find_by_tag("img").unwrap();
        assert_eq!(d.attr(img, "src"), Some("a.png?x=1y=2"));
    }

    #[test]
    fn test_fix_stray_table_cells() {
        let mut d = doc("<td>loose</td><table><tr><td>ok</td></tr></table>");
        fix_stray_table_cells(&mut d);
        let out = d.to_xhtml();
        assert!(out.contains("<div>loose</div>"));
        assert!(out.contains("<td>ok</td>"));
    }

    #[test]
    fn test_strip_special_characters() {
        let mut d = doc("<p>a\u{200b}b\u{ad}c\u{2011}d</p>");
        strip_special_characters(&mut d);
        let p = d.find_by_tag("p").unwrap();
        assert_eq!(d.text_content(p), "abc-d");
    }

    #[test]
    fn test_rewrite_stylesheet() {
        let css = ".list { margin-left: 2em; color: red }\np.pre { white-space: pre; }";
        let mut selectors = HashSet::new();
        selectors.insert(".list".to_string());
        let out = rewrite_stylesheet(css, &selectors);
        assert!(!out.contains("margin-left"));
        assert!(out.contains("color: red"));
        assert!(out.contains("white-space: pre-wrap"));
    }

    #[test]
    fn test_fix_stylesheet_targets_list_classes() {
        let mut book = Book::new();
        book.add_flow("ch1", "ch1.html", doc(r#"<ul class="list"><li>x</li></ul>"#));
        book.add_resource(
            "style.css",
            b".list { padding-left: 1em }\n.other { padding-left: 1em }".to_vec(),
            "text/css",
        );

        fix_stylesheet(&mut book);

        let css = String::from_utf8(book.resources["style.css"].data.clone()).unwrap();
        let list_rule = css.split('}').next().unwrap();
        assert!(!list_rule.contains("padding-left"));
        assert!(css.contains(".other{ padding-left: 1em }"));
    }

    #[test]
    fn test_full_pass_duplicate_anchor_scenario() {
        let mut book = Book::new();
        book.add_flow(
            "ch1",
            "ch1.html",
            doc(r#"<a id="x">one</a><a id="x">two</a>"#),
        );
        let mut warnings = Vec::new();
        QuirksTransformer::apply(&mut book, &mut warnings);

        let d = &book.spine[0].document;
        let with_id = d
            .descendants(d.root())
            .filter(|&n| d.attr(n, "id") == Some("x"))
            .count();
        assert_eq!(with_id, 1);
    }
}
