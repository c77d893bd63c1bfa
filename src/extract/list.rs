//! List pages: one table of [`ROWS_PER_PAGE`] ranked rows per page.
//!
//! Columns used, by position: `td[1] > span[1]` rank, `td[2] > a[1]@href`
//! site link, `td[3] > a[1]@href` system link. Rows without any `td` (header
//! rows) are skipped; a data row missing one of these pieces fails the page.

use scraper::{ElementRef, Html};
use tracing::{debug, instrument};

use super::content_table;
use super::dom::{nth_child_by_tag, nth_text_of_child, table_rows, text_content, trailing_id};
use crate::error::{HarvestError, Result};
use crate::models::{List, ListId, PAGES_PER_LIST, RankEntry, ROWS_PER_PAGE};

/// Parse one page of list `id` into its rank entries.
#[instrument(level = "debug", skip(html), fields(list = %id))]
pub fn parse_list_page(html: &str, id: ListId, page: u8) -> Result<Vec<RankEntry>> {
    let what = format!("list {id} page {page}");
    let document = Html::parse_document(html);
    let table = content_table(&document, &what)?;

    let data_rows: Vec<ElementRef<'_>> = table_rows(table)
        .into_iter()
        .filter(|tr| nth_child_by_tag(*tr, "td", 1).is_some())
        .take(ROWS_PER_PAGE)
        .collect();

    if data_rows.len() < ROWS_PER_PAGE {
        return Err(HarvestError::structural(format!(
            "{what}: expected {ROWS_PER_PAGE} rows, found {}",
            data_rows.len()
        )));
    }

    let entries = data_rows
        .into_iter()
        .enumerate()
        .map(|(i, tr)| {
            parse_row(tr)
                .map_err(|e| HarvestError::structural(format!("{what} row {}: {e}", i + 1)))
        })
        .collect::<Result<Vec<_>>>()?;

    debug!(page, rows = entries.len(), "Parsed list page");
    Ok(entries)
}

/// Parse all pages of a list and check that every rank is present once.
pub fn parse_list(id: ListId, pages: &[String]) -> Result<List> {
    if pages.len() != PAGES_PER_LIST as usize {
        return Err(HarvestError::structural(format!(
            "list {id}: expected {PAGES_PER_LIST} pages, got {}",
            pages.len()
        )));
    }

    let mut list = List::new(id);
    for (page, html) in (1..=PAGES_PER_LIST).zip(pages) {
        for entry in parse_list_page(html, id, page)? {
            list.place(entry)?;
        }
    }
    list.validate()?;
    Ok(list)
}

fn parse_row(tr: ElementRef<'_>) -> std::result::Result<RankEntry, String> {
    let cell = |n: usize| nth_child_by_tag(tr, "td", n).ok_or_else(|| format!("missing td[{n}]"));

    let rank_td = cell(1)?;
    let rank_text = nth_text_of_child(rank_td, "span", 1).ok_or("missing rank span")?;
    let rank = rank_text
        .parse::<u32>()
        .map_err(|_| format!("rank {rank_text:?} is not a number"))?;

    let (site_id, _) = linked_id(cell(2)?, "site")?;
    let (item_id, anchor) = linked_id(cell(3)?, "system")?;
    let display_name = Some(text_content(anchor)).filter(|name| !name.is_empty());

    Ok(RankEntry {
        rank,
        site_id,
        item_id,
        display_name,
    })
}

fn linked_id<'a>(
    td: ElementRef<'a>,
    what: &str,
) -> std::result::Result<(u64, ElementRef<'a>), String> {
    let anchor = nth_child_by_tag(td, "a", 1).ok_or_else(|| format!("missing {what} link"))?;
    let href = anchor
        .value()
        .attr("href")
        .ok_or_else(|| format!("{what} link without href"))?;
    let id = trailing_id(href).ok_or_else(|| format!("no {what} id in {href:?}"))?;
    Ok((id, anchor))
}

/// Synthetic list page: rows `first..first + count`, ids derived from rank.
#[cfg(test)]
pub(crate) fn list_page_fixture(
    first_rank: u32,
    count: usize,
    site_of: impl Fn(u32) -> u64,
    item_of: impl Fn(u32) -> u64,
) -> String {
    let mut rows = String::from(
        "<thead><tr><th>Rank</th><th>Site</th><th>System</th></tr></thead><tbody>",
    );
    for rank in first_rank..first_rank + count as u32 {
        rows.push_str(&format!(
            "<tr><td><span class=\"badge\">{rank}</span></td>\
             <td><a href=\"https://www.top500.org/site/{site}\">Site {site}</a></td>\
             <td><a href=\"https://www.top500.org/system/{item}\">\
             <b>System {item}</b> - cluster</a></td>\
             <td>1,000</td></tr>",
            site = site_of(rank),
            item = item_of(rank),
        ));
    }
    rows.push_str("</tbody>");
    super::page_fixture("<h1>TOP500 List</h1>", &rows)
}

#[cfg(test)]
pub(crate) fn list_fixture_pages(
    site_of: impl Fn(u32) -> u64 + Copy,
    item_of: impl Fn(u32) -> u64 + Copy,
) -> Vec<String> {
    (0..PAGES_PER_LIST as u32)
        .map(|p| list_page_fixture(p * ROWS_PER_PAGE as u32 + 1, ROWS_PER_PAGE, site_of, item_of))
        .collect()
}
