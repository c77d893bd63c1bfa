//! Positional DOM accessors.
//!
//! All lookups count only direct children and are 1-indexed. A miss is `None`;
//! callers decide whether that is an error.

use scraper::ElementRef;

/// The `n`-th direct child element named `tag`.
pub fn nth_child_by_tag<'a>(node: ElementRef<'a>, tag: &str, n: usize) -> Option<ElementRef<'a>> {
    node.children()
        .filter_map(ElementRef::wrap)
        .filter(|el| el.value().name() == tag)
        .nth(n.checked_sub(1)?)
}

/// The `n`-th non-blank text node directly below `node`, trimmed.
pub fn nth_text<'a>(node: ElementRef<'a>, n: usize) -> Option<&'a str> {
    node.children()
        .filter_map(|child| child.value().as_text())
        .map(|text| text.trim())
        .filter(|text| !text.is_empty())
        .nth(n.checked_sub(1)?)
}

/// First text node of the `n`-th child named `tag`.
pub fn nth_text_of_child<'a>(node: ElementRef<'a>, tag: &str, n: usize) -> Option<&'a str> {
    nth_child_by_tag(node, tag, n).and_then(|child| nth_text(child, 1))
}

/// All text below `node` with whitespace runs collapsed.
pub fn text_content(node: ElementRef<'_>) -> String {
    node.text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Rows of `table`, whether they sit directly below it or inside row groups.
///
/// The HTML parser inserts a `tbody` around bare rows, so both shapes occur.
pub fn table_rows<'a>(table: ElementRef<'a>) -> Vec<ElementRef<'a>> {
    let mut rows = Vec::new();
    for child in table.children().filter_map(ElementRef::wrap) {
        match child.value().name() {
            "tr" => rows.push(child),
            "thead" | "tbody" | "tfoot" => rows.extend(
                child
                    .children()
                    .filter_map(ElementRef::wrap)
                    .filter(|el| el.value().name() == "tr"),
            ),
            _ => {}
        }
    }
    rows
}

/// Numeric id in the last path segment of `href`, e.g. `/system/180183` -> 180183.
///
/// Only this trailing-segment shape is recognized; a trailing slash or a query
/// string yields `None`.
pub fn trailing_id(href: &str) -> Option<u64> {
    let (_, last) = href.trim().rsplit_once('/')?;
    last.parse().ok()
}
