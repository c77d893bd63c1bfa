//! System pages and the attribute dispatch table.
//!
//! The heading's first text node is `"<name> - <summary>"`. Below it, each
//! table row pairs a `th` label with a `td` value. Labels are normalized
//! ([`normalize_label`]) and looked up in [`DISPATCH`], which maps every
//! known label to the setter for one [`Item`] field.
//!
//! An unknown label fails the whole item with
//! [`SchemaDrift`](HarvestError::SchemaDrift): the source changed its page
//! format and the table needs an update. A numeric value that does not convert
//! only skips that attribute.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use scraper::{ElementRef, Html};
use tracing::{debug, instrument, warn};

use super::content_table;
use super::dom::{nth_child_by_tag, nth_text_of_child, table_rows, text_content, trailing_id};
use crate::error::{HarvestError, Result};
use crate::models::Item;

type TextField = fn(&mut Item) -> &mut Option<String>;
type FloatField = fn(&mut Item) -> &mut Option<f64>;
type IntegerField = fn(&mut Item) -> &mut Option<i64>;

/// How the value cell of one attribute row is read into an [`Item`].
#[derive(Clone, Copy)]
pub enum Setter {
    /// Cell text as is.
    Text(TextField),
    /// Leading number of the cell text, thousands separators removed.
    Float(FloatField),
    Integer(IntegerField),
    /// Id at the end of the cell's link, stored as `site_id`.
    SiteRef,
    /// Target of the cell's link, stored as `url`.
    Link,
}

/// One dispatch table entry.
#[derive(Clone, Copy)]
pub struct Attribute {
    /// Item field name, used in logs and errors.
    pub field: &'static str,
    pub setter: Setter,
}

/// Normalized label -> attribute.
pub static DISPATCH: Lazy<HashMap<&'static str, Attribute>> = Lazy::new(|| {
    let table: [(&'static str, &'static str, Setter); 19] = [
        ("site", "site_id", Setter::SiteRef),
        ("system url", "url", Setter::Link),
        ("manufacturer", "manufacturer", Setter::Text(|i| &mut i.manufacturer)),
        ("cores", "cores", Setter::Integer(|i| &mut i.cores)),
        ("memory", "memory", Setter::Float(|i| &mut i.memory)),
        ("processor", "processor", Setter::Text(|i| &mut i.processor)),
        ("interconnect", "interconnect", Setter::Text(|i| &mut i.interconnect)),
        ("linpack performance (rmax)", "linpack", Setter::Float(|i| &mut i.linpack)),
        (
            "theoretical peak (rpeak)",
            "theoretical_peak",
            Setter::Float(|i| &mut i.theoretical_peak),
        ),
        ("nmax", "nmax", Setter::Float(|i| &mut i.nmax)),
        ("nhalf", "nhalf", Setter::Float(|i| &mut i.nhalf)),
        ("hpcg [tflop/s]", "hpcg", Setter::Float(|i| &mut i.hpcg)),
        ("power", "power", Setter::Float(|i| &mut i.power)),
        (
            "power measurement level",
            "power_measurement_level",
            Setter::Float(|i| &mut i.power_measurement_level),
        ),
        ("measured cores", "measured_cores", Setter::Integer(|i| &mut i.measured_cores)),
        ("operating system", "os", Setter::Text(|i| &mut i.os)),
        ("compiler", "compiler", Setter::Text(|i| &mut i.compiler)),
        ("math library", "mathlib", Setter::Text(|i| &mut i.mathlib)),
        ("mpi", "mpi", Setter::Text(|i| &mut i.mpi)),
    ];
    table
        .into_iter()
        .map(|(label, field, setter)| (label, Attribute { field, setter }))
        .collect()
});

/// Lower-case `raw`, cut it at its last colon and trim it.
pub fn normalize_label(raw: &str) -> String {
    let lower = raw.to_lowercase();
    let head = match lower.rfind(':') {
        Some(pos) => &lower[..pos],
        None => lower.as_str(),
    };
    head.trim().to_string()
}

pub fn lookup(label: &str) -> Result<Attribute> {
    DISPATCH
        .get(label)
        .copied()
        .ok_or_else(|| HarvestError::SchemaDrift {
            label: label.to_string(),
        })
}

/// Leading number of `raw` after dropping `,` separators: `"1,234.5 GB"` -> 1234.5.
pub fn parse_number(field: &'static str, raw: &str) -> Result<f64> {
    let cleaned: String = raw.chars().filter(|&c| c != ',').collect();
    let cleaned = cleaned.trim();
    let end = cleaned
        .char_indices()
        .find(|&(i, c)| !(c.is_ascii_digit() || c == '.' || (i == 0 && (c == '-' || c == '+'))))
        .map_or(cleaned.len(), |(i, _)| i);

    cleaned[..end]
        .parse::<f64>()
        .map_err(|_| HarvestError::NumericConversion {
            field,
            value: raw.trim().to_string(),
        })
}

/// Split `"Frontier - HPE Cray EX235a, ..."` into name and summary.
pub fn split_heading(heading: &str) -> (String, Option<String>) {
    match heading.split_once(" - ") {
        Some((name, summary)) => (name.trim().to_string(), Some(summary.trim().to_string())),
        None => (heading.trim().to_string(), None),
    }
}

impl Attribute {
    fn apply(&self, item: &mut Item, cell: ElementRef<'_>) -> Result<()> {
        let text = text_content(cell);
        match self.setter {
            Setter::Text(field) => *field(item) = Some(text),
            Setter::Float(field) => *field(item) = Some(parse_number(self.field, &text)?),
            Setter::Integer(field) => {
                *field(item) = Some(parse_number(self.field, &text)?.round() as i64)
            }
            Setter::SiteRef => {
                let id = cell_href(cell).and_then(trailing_id).ok_or_else(|| {
                    HarvestError::structural(format!(
                        "item {}: site cell without site link",
                        item.id
                    ))
                })?;
                item.site_id = Some(id);
            }
            Setter::Link => item.url = Some(cell_href(cell).map_or(text, str::to_string)),
        }
        Ok(())
    }
}

fn cell_href<'a>(cell: ElementRef<'a>) -> Option<&'a str> {
    nth_child_by_tag(cell, "a", 1).and_then(|a| a.value().attr("href"))
}

/// Label and value cell of every attribute row that carries data.
fn attribute_rows<'a>(
    table: ElementRef<'a>,
) -> impl Iterator<Item = (Option<&'a str>, ElementRef<'a>)> {
    table_rows(table).into_iter().filter_map(|tr| {
        let td = nth_child_by_tag(tr, "td", 1)?;
        // Column shown but no data available.
        if text_content(td).is_empty() && cell_href(td).is_none() {
            return None;
        }
        Some((nth_text_of_child(tr, "th", 1), td))
    })
}

#[instrument(level = "debug", skip(html))]
pub fn parse_item(html: &str, id: u64) -> Result<Item> {
    let what = format!("item {id}");
    let document = Html::parse_document(html);
    let table = content_table(&document, &what)?;
    let container = super::content_root(&document, &what)?;

    let mut item = Item::new(id);
    if let Some(heading) = nth_text_of_child(container, "h1", 1) {
        let (name, summary) = split_heading(heading);
        item.name = Some(name);
        item.summary = summary;
    }

    let mut applied = 0usize;
    for (raw_label, cell) in attribute_rows(table) {
        let raw_label = raw_label.ok_or_else(|| {
            HarvestError::structural(format!("{what}: attribute row without a label"))
        })?;
        let label = normalize_label(raw_label);
        let attribute = lookup(&label)?;

        match attribute.apply(&mut item, cell) {
            Ok(()) => applied += 1,
            Err(e) if e.is_recoverable() => {
                warn!(item = id, %label, error = %e, "Skipping attribute");
            }
            Err(e) => return Err(e),
        }
    }

    debug!(item = id, applied, "Parsed item attributes");
    Ok(item)
}

/// Normalized labels of every attribute row on a system page, data or not.
pub fn attribute_labels(html: &str, id: u64) -> Result<Vec<String>> {
    let document = Html::parse_document(html);
    let table = content_table(&document, &format!("item {id}"))?;
    Ok(table_rows(table)
        .into_iter()
        .filter_map(|tr| nth_text_of_child(tr, "th", 1))
        .map(normalize_label)
        .collect())
}

#[cfg(test)]
pub(crate) fn item_page_fixture(id: u64, site_id: u64) -> String {
    super::page_fixture(
        &format!("<h1>System {id} - Cray EX, AMD EPYC 64C 2GHz</h1>"),
        &format!(
            "<tr><th>Site:</th><td><a href=\"https://www.top500.org/site/{site_id}\">\
             Laboratory {site_id}</a></td></tr>\
             <tr><th>System URL:</th>\
             <td><a href=\"https://example.org/system{id}\">link</a></td></tr>\
             <tr><th>Manufacturer:</th><td>HPE</td></tr>\
             <tr><th>Cores:</th><td>8,699,904</td></tr>\
             <tr><th>Memory:</th><td>9,408,000 GB</td></tr>\
             <tr><th>Processor:</th><td>AMD Optimized 3rd Generation EPYC 64C 2GHz</td></tr>\
             <tr><th>Interconnect:</th><td>Slingshot-11</td></tr>\
             <tr><th>Linpack Performance (Rmax)</th><td>1,194.00 PFlop/s</td></tr>\
             <tr><th>Theoretical Peak (Rpeak)</th><td>1,679.82 PFlop/s</td></tr>\
             <tr><th>Nmax</th><td>24,440,832</td></tr>\
             <tr><th>Nhalf</th><td></td></tr>\
             <tr><th>HPCG [TFlop/s]</th><td>14,054.00</td></tr>\
             <tr><th>Power:</th><td>22,703.00 kW</td></tr>\
             <tr><th>Power Measurement Level:</th><td>2</td></tr>\
             <tr><th>Operating System:</th><td>HPE Cray OS</td></tr>\
             <tr><th>Compiler:</th><td>n/a</td></tr>\
             <tr><th>Math Library:</th><td>n/a</td></tr>\
             <tr><th>MPI:</th><td>MPICH</td></tr>"
        ),
    )
}
