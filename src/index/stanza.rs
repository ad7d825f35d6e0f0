//! Deb822 control stanzas as they appear in `Packages` files.

use std::cmp::Ordering;

use crate::pool::compare_versions;

/// One paragraph of `Key: value` fields, in emission order.
///
/// Multi-line values keep their continuation lines (leading space) verbatim.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stanza {
    fields: Vec<(String, String)>,
}

impl Stanza {
    pub fn push(&mut self, key: &str, value: &str) {
        self.fields.push((key.to_string(), value.to_string()));
    }

    /// First value of `key`, matched case-insensitively.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Split tool output into stanzas on blank lines.
    pub fn parse_all(text: &str) -> Vec<Stanza> {
        let mut out = Vec::new();
        let mut current = Stanza::default();
        for line in text.lines() {
            if line.trim().is_empty() {
                if !current.is_empty() {
                    out.push(std::mem::take(&mut current));
                }
                continue;
            }
            if line.starts_with(' ') || line.starts_with('\t') {
                if let Some((_, value)) = current.fields.last_mut() {
                    value.push('\n');
                    value.push_str(line);
                }
                continue;
            }
            match line.split_once(':') {
                Some((key, value)) => current.push(key.trim(), value.trim()),
                None => current.push(line.trim(), ""),
            }
        }
        if !current.is_empty() {
            out.push(current);
        }
        out
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for (key, value) in &self.fields {
            out.push_str(key);
            out.push(':');
            if !value.is_empty() && !value.starts_with('\n') {
                out.push(' ');
            }
            out.push_str(value);
            out.push('\n');
        }
        out
    }
}

/// Listing order: package name, then version, then filename.
pub fn listing_order(a: &Stanza, b: &Stanza) -> Ordering {
    let field = |s: &Stanza, k: &str| s.get(k).unwrap_or("").to_string();
    field(a, "Package")
        .cmp(&field(b, "Package"))
        .then_with(|| compare_versions(&field(a, "Version"), &field(b, "Version")))
        .then_with(|| field(a, "Filename").cmp(&field(b, "Filename")))
}

/// Sort and render a complete `Packages` file. Empty input renders empty.
pub fn render_listing(stanzas: &mut [Stanza]) -> String {
    stanzas.sort_by(listing_order);
    stanzas
        .iter()
        .map(|s| format!("{}\n", s.render()))
        .collect::<String>()
}
