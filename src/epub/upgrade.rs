//! EPUB 3 upgrade step.
//!
//! Runs inside the assembler between building and commit: generates a
//! navigation document from the staged TOC, declares it with the `nav`
//! property, and leaves the NCX in place for backwards-compatible
//! readers. The package version and `dcterms:modified` metadata are
//! handled by the package-document serializer.

use crate::book::TocEntry;
use crate::error::Result;

use super::assembler::{ContainerAssembler, escape_xml};

pub(super) fn apply(assembler: &mut ContainerAssembler) -> Result<()> {
    let href = nav_href(assembler);
    let nav = generate_nav(assembler);

    assembler.declare(&href, "application/xhtml+xml")?;
    assembler.supply(&href, nav.into_bytes())?;
    if let Some(entry) = assembler.manifest.iter_mut().find(|e| e.href == href) {
        entry.properties = Some("nav".to_string());
    }
    Ok(())
}

fn nav_href(assembler: &ContainerAssembler) -> String {
    if !assembler.contents.contains_key("nav.xhtml") {
        return "nav.xhtml".to_string();
    }
    let mut n = 1u32;
    loop {
        let candidate = format!("nav_{n}.xhtml");
        if !assembler.contents.contains_key(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

fn generate_nav(assembler: &ContainerAssembler) -> String {
    let title = escape_xml(&assembler.metadata.title);
    let mut nav = format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
         <html xmlns=\"http://www.w3.org/1999/xhtml\" xmlns:epub=\"http://www.idpf.org/2007/ops\">\n\
         <head><title>{title}</title></head>\n\
         <body>\n\
         \x20 <nav epub:type=\"toc\" id=\"toc\">\n\
         \x20   <h1>{title}</h1>\n"
    );
    write_list(&mut nav, &assembler.toc.entries, 2);
    nav.push_str("  </nav>\n");

    if let Some(titlepage) = &assembler.titlepage {
        nav.push_str(&format!(
            "  <nav epub:type=\"landmarks\" hidden=\"hidden\">\n\
             \x20   <ol>\n\
             \x20     <li><a epub:type=\"cover\" href=\"{}\">Cover</a></li>\n\
             \x20   </ol>\n\
             \x20 </nav>\n",
            escape_xml(titlepage)
        ));
    }
    nav.push_str("</body>\n</html>\n");
    nav
}

fn write_list(nav: &mut String, entries: &[TocEntry], indent: usize) {
    if entries.is_empty() {
        return;
    }
    let pad = "  ".repeat(indent);
    nav.push_str(&format!("{pad}<ol>\n"));
    for entry in entries {
        let label = match &entry.anchor {
            Some(anchor) => format!(
                "<a href=\"{}\">{}</a>",
                escape_xml(&anchor.to_string()),
                escape_xml(&entry.title)
            ),
            None => format!("<span>{}</span>", escape_xml(&entry.title)),
        };
        if entry.children.is_empty() {
            nav.push_str(&format!("{pad}  <li>{label}</li>\n"));
        } else {
            nav.push_str(&format!("{pad}  <li>{label}\n"));
            write_list(nav, &entry.children, indent + 2);
            nav.push_str(&format!("{pad}  </li>\n"));
        }
    }
    nav.push_str(&format!("{pad}</ol>\n"));
}
