//! Font obfuscation (the Adobe scheme).
//!
//! Fonts flagged for protection are XORed over their first 1024 bytes
//! with a 16-byte key derived from the package identifier, and declared
//! in `META-INF/encryption.xml`. The transform is its own inverse given
//! the same identifier, which is exactly how reading systems undo it.

use std::collections::HashSet;
use std::time::{SystemTime, UNIX_EPOCH};

use log::warn;

use crate::book::Book;
use crate::error::{Error, Result, Stage, Warning};

/// Adobe's font-mangling algorithm identifier.
pub const ADOBE_OBFUSCATION: &str = "http://ns.adobe.com/pdf/enc#RC";

const OBFUSCATED_PREFIX_LEN: usize = 1024;

/// One obfuscated resource, serialized into `encryption.xml` at assembly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptionRecord {
    pub href: String,
    pub algorithm: String,
}

/// Derives the obfuscation key from a package identifier and applies it.
#[derive(Debug, Clone)]
pub struct FontObfuscator {
    key: [u8; 16],
}

impl FontObfuscator {
    /// Derive the 16-byte key from the package identifier.
    ///
    /// The segment after the last `:` (the value without its `urn:uuid:`
    /// scheme, which reading systems also discard) has its non-hex
    /// characters stripped; the survivors are doubled and the first 32
    /// hex digits decoded. Fewer than 16 hex characters cannot key the
    /// scheme and is a configuration error.
    pub fn new(identifier: &str) -> Result<Self> {
        let value = identifier.rsplit(':').next().unwrap_or(identifier);
        let hex: String = value.chars().filter(char::is_ascii_hexdigit).collect();
        if hex.len() < 16 {
            return Err(Error::Configuration(format!(
                "identifier {identifier:?} has fewer than 16 hex characters, cannot derive a font obfuscation key"
            )));
        }
        let doubled = format!("{hex}{hex}");
        let mut key = [0u8; 16];
        for (i, byte) in key.iter_mut().enumerate() {
            let pair = &doubled[i * 2..i * 2 + 2];
            // The slice is two ascii hex digits by construction.
            *byte = u8::from_str_radix(pair, 16).map_err(|e| {
                Error::FatalInternal(format!("font key derivation produced non-hex {pair:?}: {e}"))
            })?;
        }
        Ok(Self { key })
    }

    /// XOR the first kilobyte in place. Self-inverse.
    pub fn obfuscate(&self, data: &mut [u8]) {
        let len = data.len().min(OBFUSCATED_PREFIX_LEN);
        for (i, byte) in data[..len].iter_mut().enumerate() {
            *byte ^= self.key[i % self.key.len()];
        }
    }
}

/// Obfuscate every font the book flags for protection.
///
/// Fonts too small to cover the full XOR prefix are skipped with a
/// warning rather than half-mangled, as are flagged hrefs with no bytes
/// in the manifest. Returns the records for `encryption.xml`.
pub fn protect_fonts(book: &mut Book, warnings: &mut Vec<Warning>) -> Result<Vec<EncryptionRecord>> {
    if book.protected_fonts.is_empty() {
        return Ok(Vec::new());
    }
    let obfuscator = FontObfuscator::new(&book.metadata.identifier)?;

    let mut records = Vec::new();
    let mut done: HashSet<&str> = HashSet::new();
    for href in &book.protected_fonts {
        if !done.insert(href) {
            continue;
        }
        let Some(resource) = book.resources.get_mut(href) else {
            warn!("font {href} flagged for obfuscation but not in the manifest");
            warnings.push(Warning::new(
                Stage::Fonts,
                format!("skipped obfuscation of missing font {href}"),
            ));
            continue;
        };
        if resource.data.len() < OBFUSCATED_PREFIX_LEN {
            warnings.push(Warning::new(
                Stage::Fonts,
                format!(
                    "font {href} is only {} bytes, too small to obfuscate safely",
                    resource.data.len()
                ),
            ));
            continue;
        }
        obfuscator.obfuscate(&mut resource.data);
        records.push(EncryptionRecord {
            href: href.clone(),
            algorithm: ADOBE_OBFUSCATION.to_string(),
        });
    }
    Ok(records)
}

/// Serialize `META-INF/encryption.xml` for the given records. Record
/// hrefs are emitted verbatim and must be container-root paths.
pub fn encryption_xml(records: &[EncryptionRecord]) -> String {
    let mut xml = String::from(
        "<?xml version=\"1.0\" encoding=\"utf-8\"?>\n\
         <encryption xmlns=\"urn:oasis:names:tc:opendocument:xmlns:container\" \
         xmlns:enc=\"http://www.w3.org/2001/04/xmlenc#\">\n",
    );
    for record in records {
        xml.push_str("  <enc:EncryptedData>\n");
        xml.push_str(&format!(
            "    <enc:EncryptionMethod Algorithm=\"{}\"/>\n",
            record.algorithm
        ));
        xml.push_str("    <enc:CipherData>\n");
        xml.push_str(&format!(
            "      <enc:CipherReference URI=\"{}\"/>\n",
            record.href
        ));
        xml.push_str("    </enc:CipherData>\n");
        xml.push_str("  </enc:EncryptedData>\n");
    }
    xml.push_str("</encryption>\n");
    xml
}

/// Reading systems derive the deobfuscation key from the package
/// identifier, so when fonts are protected the identifier must be a
/// proper `urn:uuid:`. Synthesizes one if the current identifier is
/// missing or not uuid-shaped.
pub fn ensure_uuid_identifier(book: &mut Book, warnings: &mut Vec<Warning>) {
    let id = book.metadata.identifier.trim();
    if id.starts_with("urn:uuid:") {
        return;
    }
    if looks_like_uuid(id) {
        book.metadata.identifier = format!("urn:uuid:{id}");
        return;
    }
    if id.is_empty() {
        warn!("no package identifier found; generating a UUID for the font key");
        warnings.push(Warning::new(
            Stage::Options,
            "book has no identifier; generated a UUID",
        ));
        book.metadata.identifier = format!("urn:uuid:{}", uuid_v4());
    }
}

fn looks_like_uuid(s: &str) -> bool {
    let parts: Vec<&str> = s.split('-').collect();
    parts.len() == 5
        && parts
            .iter()
            .zip([8usize, 4, 4, 4, 12])
            .all(|(p, len)| p.len() == len && p.chars().all(|c| c.is_ascii_hexdigit()))
}

/// Generate a simple UUID v4 (random)
pub fn uuid_v4() -> String {
    let seed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0x9e37_79b9_7f4a_7c15);

    // Simple PRNG (not cryptographically secure, but fine for identifiers)
    let mut state = seed;
    let mut bytes = [0u8; 16];
    for byte in &mut bytes {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
        *byte = (state >> 33) as u8;
    }

    // Set version (4) and variant (2)
    bytes[6] = (bytes[6] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;

    format!(
        "{:02x}{:02x}{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
        bytes[0],
        bytes[1],
        bytes[2],
        bytes[3],
        bytes[4],
        bytes[5],
        bytes[6],
        bytes[7],
        bytes[8],
        bytes[9],
        bytes[10],
        bytes[11],
        bytes[12],
        bytes[13],
        bytes[14],
        bytes[15]
    )
}
