//! Extraction of records from cached source pages.
//!
//! The source pages are located by fixed structural position rather than by
//! CSS selectors: `html > body > div[2] > div[1] > div[1]` holds the content
//! of every page kind, and the records live in the first `table` below it.
//!
//! # Page kinds
//!
//! | Page | Module | Produces |
//! |------|--------|----------|
//! | List page (100 rows) | [`list`] | [`RankEntry`](crate::models::RankEntry) rows |
//! | Site page | [`site`] | [`Site`](crate::models::Site) |
//! | System page | [`item`] | [`Item`](crate::models::Item), through the attribute dispatch table |
//!
//! Missing containers are a [`StructuralParse`](crate::error::HarvestError::StructuralParse)
//! error for the page. Missing optional fields are left `None`.

pub mod dom;
pub mod item;
pub mod list;
pub mod site;

use scraper::{ElementRef, Html};

use crate::error::{HarvestError, Result};
use dom::nth_child_by_tag;

/// Walk the fixed path from the document root down to the content container.
pub(crate) fn content_root<'a>(document: &'a Html, what: &str) -> Result<ElementRef<'a>> {
    let root = document.root_element();
    if root.value().name() != "html" {
        return Err(HarvestError::structural(format!("{what}: no document root")));
    }

    let mut current = root;
    for (tag, n) in [("body", 1), ("div", 2), ("div", 1), ("div", 1)] {
        current = nth_child_by_tag(current, tag, n).ok_or_else(|| {
            HarvestError::structural(format!(
                "{what}: missing {tag}[{n}] below <{}>",
                current.value().name()
            ))
        })?;
    }
    Ok(current)
}

/// First `table` of the content container.
pub(crate) fn content_table<'a>(document: &'a Html, what: &str) -> Result<ElementRef<'a>> {
    let container = content_root(document, what)?;
    nth_child_by_tag(container, "table", 1)
        .ok_or_else(|| HarvestError::structural(format!("{what}: missing table[1]")))
}

/// Wrap `rows` of table markup into a page with the structure the source uses.
#[cfg(test)]
pub(crate) fn page_fixture(heading: &str, table_rows: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head><title>fixture</title></head>
<body>
  <div class="navbar">nav</div>
  <div class="container">
    <div class="row">
      <div class="col">
        {heading}
        <table class="table">
          {table_rows}
        </table>
      </div>
    </div>
  </div>
</body>
</html>"#
    )
}
