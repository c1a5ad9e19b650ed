//! Deterministic boilerplate stripping and text normalization.
//!
//! Text blocks are kept when they carry at least a few words and are not
//! dominated by link text; navigation, chrome and script subtrees are
//! ignored entirely. Identical input bytes always yield identical output.

use once_cell::sync::Lazy;
use scraper::{ElementRef, Html, Node, Selector};
use sha2::{Digest, Sha256};

const BOILERPLATE: &[&str] = &[
    "script", "style", "noscript", "nav", "header", "footer", "aside", "form", "iframe", "svg",
    "button", "select", "template",
];
const BLOCKS: &[&str] = &[
    "p", "li", "h1", "h2", "h3", "h4", "h5", "h6", "pre", "blockquote", "td",
];
const MIN_BLOCK_WORDS: usize = 4;
const MAX_LINK_DENSITY: f32 = 0.5;

static BLOCK_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse(&BLOCKS.join(", ")).expect("valid block selector"));
static BODY_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("body").expect("valid body selector"));

/// Collapse whitespace runs to single spaces and trim.
pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Normalized form used for hashing and similarity: collapsed and lower-cased.
pub fn normalize_text(text: &str) -> String {
    collapse_whitespace(text).to_lowercase()
}

/// SHA-256 hex digest of the normalized text.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_text(text).as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Cut to at most `max_chars` characters without splitting a code point.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => text[..byte_idx].trim_end().to_string(),
        None => text.to_string(),
    }
}

/// Reduce an HTML document to its main text.
pub fn extract_html(html: &str, max_chars: usize) -> String {
    let document = Html::parse_document(html);

    let blocks: Vec<String> = document
        .select(&BLOCK_SELECTOR)
        .filter(|el| {
            !has_ancestor(el.ancestors().map(|a| a.value()), BOILERPLATE)
                && !has_ancestor(el.ancestors().map(|a| a.value()), BLOCKS)
        })
        .filter_map(|el| {
            let text = collapse_whitespace(&visible_text(el));
            let words = text.split_whitespace().count();
            if words < MIN_BLOCK_WORDS || link_density(el, &text) >= MAX_LINK_DENSITY {
                return None;
            }
            Some(text)
        })
        .collect();

    let text = if blocks.is_empty() {
        document
            .select(&BODY_SELECTOR)
            .next()
            .map(|body| collapse_whitespace(&visible_text(body)))
            .unwrap_or_default()
    } else {
        blocks.join("\n")
    };

    truncate_chars(&text, max_chars)
}

/// Plain-text bodies only need whitespace normalization per line.
pub fn extract_plain(text: &str, max_chars: usize) -> String {
    let lines: Vec<String> = text
        .lines()
        .map(collapse_whitespace)
        .filter(|line| !line.is_empty())
        .collect();
    truncate_chars(&lines.join("\n"), max_chars)
}

fn has_ancestor<'a>(mut ancestors: impl Iterator<Item = &'a Node>, names: &[&str]) -> bool {
    ancestors.any(|node| {
        node.as_element()
            .is_some_and(|el| names.contains(&el.name()))
    })
}

fn visible_text(root: ElementRef<'_>) -> String {
    let mut out = String::new();
    for node in root.descendants() {
        if let Node::Text(text) = node.value() {
            if has_ancestor(node.ancestors().map(|a| a.value()), BOILERPLATE) {
                continue;
            }
            out.push_str(text);
            out.push(' ');
        }
    }
    out
}

fn link_density(block: ElementRef<'_>, block_text: &str) -> f32 {
    let total = block_text.chars().filter(|c| !c.is_whitespace()).count();
    if total == 0 {
        return 1.0;
    }
    let linked: usize = block
        .descendants()
        .filter_map(|node| match node.value() {
            Node::Text(text) if has_ancestor(node.ancestors().map(|a| a.value()), &["a"]) => {
                Some(text.chars().filter(|c| !c.is_whitespace()).count())
            }
            _ => None,
        })
        .sum();
    linked as f32 / total as f32
}
