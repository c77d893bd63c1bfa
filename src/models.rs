//! Records extracted from the published lists.
//!
//! - [`ListId`]: `YYYYMM` identifier of one published list
//! - [`List`]: fixed-capacity array of [`RankEntry`] rows for one list
//! - [`Site`] and [`Item`]: detail records referenced by id from rank entries
//!
//! Nothing here holds a pointer to another record. Rank entries refer to sites
//! and items by their source-assigned numeric id; only the store links them.

use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::error::HarvestError;

/// Number of entries in every published list.
pub const LIST_SIZE: usize = 500;
/// The source paginates each list into this many pages.
pub const PAGES_PER_LIST: u8 = 5;
/// Rows on one list page.
pub const ROWS_PER_PAGE: usize = LIST_SIZE / PAGES_PER_LIST as usize;
/// Year of the first published list.
pub const FIRST_YEAR: u32 = 1993;
/// Months in which a list is published.
pub const SLOTS: [u32; 2] = [6, 11];

/// Identifier of one published list, encoded as `year * 100 + month`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ListId(u32);

impl ListId {
    pub fn new(year: u32, slot: u32) -> Result<Self, HarvestError> {
        if year < FIRST_YEAR || !SLOTS.contains(&slot) {
            return Err(HarvestError::InvalidListId(format!("{year}{slot:02}")));
        }
        Ok(Self(year * 100 + slot))
    }

    pub fn year(self) -> u32 {
        self.0 / 100
    }

    pub fn slot(self) -> u32 {
        self.0 % 100
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }

    /// Every list published from `start_year` up to `today`, two per year.
    ///
    /// Slots of the current year whose month has not arrived yet are left out.
    pub fn all(start_year: u32, today: NaiveDate) -> Vec<ListId> {
        let this_year = today.year() as u32;
        let first = start_year.max(FIRST_YEAR);
        (first..=this_year)
            .flat_map(|year| SLOTS.iter().map(move |&slot| (year, slot)))
            .filter(|&(year, slot)| year < this_year || slot <= today.month())
            .map(|(year, slot)| ListId(year * 100 + slot))
            .collect()
    }
}

impl fmt::Display for ListId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{:02}", self.year(), self.slot())
    }
}

impl FromStr for ListId {
    type Err = HarvestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.len() != 6 || !s.chars().all(|c| c.is_ascii_digit()) {
            return Err(HarvestError::InvalidListId(s.to_string()));
        }
        let raw: u32 = s
            .parse()
            .map_err(|_| HarvestError::InvalidListId(s.to_string()))?;
        ListId::new(raw / 100, raw % 100).map_err(|_| HarvestError::InvalidListId(s.to_string()))
    }
}

/// One row of a published list.
///
/// A `rank` of zero marks a slot that has not been filled by the parser yet.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RankEntry {
    pub rank: u32,
    pub site_id: u64,
    pub item_id: u64,
    pub display_name: Option<String>,
}

/// A published list: exactly [`LIST_SIZE`] entries, entry `i` holding rank `i + 1`.
#[derive(Debug, Clone, Serialize)]
pub struct List {
    pub id: ListId,
    entries: Vec<RankEntry>,
}

impl List {
    pub fn new(id: ListId) -> Self {
        Self {
            id,
            entries: vec![RankEntry::default(); LIST_SIZE],
        }
    }

    pub fn entries(&self) -> &[RankEntry] {
        &self.entries
    }

    /// Put `entry` into the slot named by its rank.
    pub fn place(&mut self, entry: RankEntry) -> Result<(), HarvestError> {
        let rank = entry.rank as usize;
        if rank == 0 || rank > LIST_SIZE {
            return Err(HarvestError::structural(format!(
                "list {}: rank {} outside 1..={LIST_SIZE}",
                self.id, entry.rank
            )));
        }
        let slot = &mut self.entries[rank - 1];
        if slot.rank != 0 {
            return Err(HarvestError::structural(format!(
                "list {}: rank {} appears twice",
                self.id, entry.rank
            )));
        }
        *slot = entry;
        Ok(())
    }

    /// Fails on the first unfilled slot.
    pub fn validate(&self) -> Result<(), HarvestError> {
        match self
            .entries
            .iter()
            .enumerate()
            .find(|(i, e)| e.rank as usize != i + 1)
        {
            Some((i, _)) => Err(HarvestError::structural(format!(
                "list {}: no entry for rank {}",
                self.id,
                i + 1
            ))),
            None => Ok(()),
        }
    }

    pub fn clear(&mut self) {
        self.entries.iter_mut().for_each(|e| *e = RankEntry::default());
    }
}

/// Organization or location hosting one or more ranked systems.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Site {
    pub id: u64,
    pub name: Option<String>,
    pub url: Option<String>,
    pub segment: Option<String>,
    pub city: Option<String>,
    pub country: Option<String>,
}

impl Site {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    /// Drop every field but the id.
    pub fn reset(&mut self) {
        *self = Site::new(self.id);
    }
}

/// A ranked system and its attributes.
///
/// `site_id` is a reference resolved by the store, not ownership.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: u64,
    pub site_id: Option<u64>,
    pub name: Option<String>,
    pub summary: Option<String>,
    pub url: Option<String>,
    pub manufacturer: Option<String>,
    pub cores: Option<i64>,
    pub memory: Option<f64>,
    pub processor: Option<String>,
    pub interconnect: Option<String>,
    /// Rmax, TFlop/s.
    pub linpack: Option<f64>,
    /// Rpeak, TFlop/s.
    pub theoretical_peak: Option<f64>,
    pub nmax: Option<f64>,
    pub nhalf: Option<f64>,
    pub hpcg: Option<f64>,
    pub power: Option<f64>,
    pub power_measurement_level: Option<f64>,
    pub measured_cores: Option<i64>,
    pub os: Option<String>,
    pub compiler: Option<String>,
    pub mathlib: Option<String>,
    pub mpi: Option<String>,
}

impl Item {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    pub fn reset(&mut self) {
        *self = Item::new(self.id);
    }
}
