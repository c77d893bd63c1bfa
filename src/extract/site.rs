//! Site pages.
//!
//! The heading's second text node is the site name. The first table holds,
//! row by row: the site's web address (`a` text), segment, city, country.

use scraper::Html;
use tracing::instrument;

use super::dom::{nth_child_by_tag, nth_text, nth_text_of_child, table_rows};
use super::{content_root, content_table};
use crate::error::Result;
use crate::models::Site;

#[instrument(level = "debug", skip(html))]
pub fn parse_site(html: &str, id: u64) -> Result<Site> {
    let what = format!("site {id}");
    let document = Html::parse_document(html);
    let container = content_root(&document, &what)?;
    let table = content_table(&document, &what)?;
    let rows = table_rows(table);

    let owned = |s: Option<&str>| s.map(str::to_string);
    let first_cell_text = |row: usize| {
        rows.get(row)
            .and_then(|tr| nth_text_of_child(*tr, "td", 1))
            .map(str::to_string)
    };

    let mut site = Site::new(id);
    site.name = owned(nth_child_by_tag(container, "h1", 1).and_then(|h1| nth_text(h1, 2)));
    site.url = owned(
        rows.first()
            .and_then(|tr| nth_child_by_tag(*tr, "td", 1))
            .and_then(|td| nth_text_of_child(td, "a", 1)),
    );
    site.segment = first_cell_text(1);
    site.city = first_cell_text(2);
    site.country = first_cell_text(3);
    Ok(site)
}

#[cfg(test)]
pub(crate) fn site_page_fixture(id: u64) -> String {
    super::page_fixture(
        &format!("<h1>Site<br>Laboratory {id}</h1>"),
        &format!(
            "<tr><th>URL:</th><td><a href=\"https://lab{id}.example.org\">\
             https://lab{id}.example.org</a></td></tr>\
             <tr><th>Segment:</th><td>Research</td></tr>\
             <tr><th>City:</th><td>Oak Ridge</td></tr>\
             <tr><th>Country:</th><td>United States</td></tr>"
        ),
    )
}
