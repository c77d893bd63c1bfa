//! SQLite persistence for lists, sites and items.
//!
//! # Schema
//!
//! ```text
//! site(id PK, name, url, segment, city, country)
//! item(id PK, site_id, name, summary, url, manufacturer, cores, memory, ...)
//! ranking(id PK, list_id, rank, item_id -> item(id), site_id -> site(id),
//!         UNIQUE(list_id, rank, item_id))
//! label_survey(id PK, label UNIQUE, count)
//! ```
//!
//! `site.id` and `item.id` are the source-assigned ids. Ties in rank are
//! representable because `item_id` is part of the ranking key.
//!
//! Every list is written inside one transaction: sites and items first, then
//! the ranking rows that reference them. Any failure rolls the whole list back.

use std::path::Path;

use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Sqlite, SqlitePool, Transaction};
use tracing::{debug, error, info, instrument};

use crate::error::{HarvestError, Result};
use crate::models::{Item, List, Site};

/// What to do when a site or item with the same id is already stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ConflictPolicy {
    /// Overwrite stored fields with the new non-null values.
    #[default]
    Update,
    /// Keep the stored row untouched.
    Ignore,
}

const TABLES: [&str; 4] = ["ranking", "item", "site", "label_survey"];

const SCHEMA: [&str; 4] = [
    r#"
    CREATE TABLE IF NOT EXISTS site (
        id INTEGER PRIMARY KEY NOT NULL,
        name TEXT,
        url TEXT,
        segment TEXT,
        city TEXT,
        country TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS item (
        id INTEGER PRIMARY KEY NOT NULL,
        site_id INTEGER,
        name TEXT,
        summary TEXT,
        url TEXT,
        manufacturer TEXT,
        cores INTEGER,
        memory REAL,
        processor TEXT,
        interconnect TEXT,
        linpack REAL,
        theoretical_peak REAL,
        nmax REAL,
        nhalf REAL,
        hpcg REAL,
        power REAL,
        power_measurement_level REAL,
        measured_cores INTEGER,
        os TEXT,
        compiler TEXT,
        mathlib TEXT,
        mpi TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS ranking (
        id INTEGER PRIMARY KEY NOT NULL,
        list_id INTEGER NOT NULL,
        rank INTEGER NOT NULL,
        item_id INTEGER NOT NULL REFERENCES item(id),
        site_id INTEGER NOT NULL REFERENCES site(id),
        UNIQUE(list_id, rank, item_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS label_survey (
        id INTEGER PRIMARY KEY NOT NULL,
        label TEXT NOT NULL,
        count INTEGER NOT NULL DEFAULT 1,
        UNIQUE(label)
    )
    "#,
];

const SITE_COLUMNS: &str = "id, name, url, segment, city, country";
const SITE_UPDATE: &str = "name = COALESCE(excluded.name, site.name), \
     url = COALESCE(excluded.url, site.url), \
     segment = COALESCE(excluded.segment, site.segment), \
     city = COALESCE(excluded.city, site.city), \
     country = COALESCE(excluded.country, site.country)";

const ITEM_COLUMNS: &str = "id, site_id, name, summary, url, manufacturer, cores, memory, \
     processor, interconnect, linpack, theoretical_peak, nmax, nhalf, hpcg, power, \
     power_measurement_level, measured_cores, os, compiler, mathlib, mpi";
const ITEM_UPDATE_COLUMNS: [&str; 21] = [
    "site_id",
    "name",
    "summary",
    "url",
    "manufacturer",
    "cores",
    "memory",
    "processor",
    "interconnect",
    "linpack",
    "theoretical_peak",
    "nmax",
    "nhalf",
    "hpcg",
    "power",
    "power_measurement_level",
    "measured_cores",
    "os",
    "compiler",
    "mathlib",
    "mpi",
];

/// Rows written by one call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteCounts {
    pub rankings: u64,
    pub sites: u64,
    pub items: u64,
}

/// Handle on the SQLite database.
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
    site_sql: String,
    item_sql: String,
}

impl Store {
    /// Open (creating if needed) the database at `path` and create missing tables.
    #[instrument(level = "info", skip_all, fields(path = %path.as_ref().display()))]
    pub async fn open(path: impl AsRef<Path>, policy: ConflictPolicy) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        let store = Self {
            pool,
            site_sql: upsert_sql("site", SITE_COLUMNS, 6, SITE_UPDATE, policy),
            item_sql: upsert_sql("item", ITEM_COLUMNS, 22, &item_update_clause(), policy),
        };
        store.migrate().await?;
        info!(?policy, "Store opened");
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<()> {
        for ddl in SCHEMA {
            sqlx::query(ddl).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Drop every table and create the schema again.
    pub async fn reset(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for table in TABLES {
            sqlx::query(&format!("DROP TABLE IF EXISTS {table}"))
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        self.migrate().await?;
        info!("Store reset");
        Ok(())
    }

    /// Persist `list` with the sites and items it references, all or nothing.
    ///
    /// `sites` and `items` carry parsed detail records. Any id a rank entry
    /// references without a detail record is stored as an id-only row that
    /// never overwrites stored data.
    #[instrument(level = "info", skip_all, fields(list = %list.id))]
    pub async fn write_list(
        &self,
        list: &List,
        sites: &[Site],
        items: &[Item],
    ) -> Result<WriteCounts> {
        let mut tx = self.pool.begin().await?;
        match self.insert_list(&mut tx, list, sites, items).await {
            Ok(counts) => {
                tx.commit().await?;
                info!(
                    rankings = counts.rankings,
                    sites = counts.sites,
                    items = counts.items,
                    "List persisted"
                );
                Ok(counts)
            }
            Err(e) => {
                error!(error = %e, "List write failed; rolling back");
                if let Err(rb) = tx.rollback().await {
                    error!(error = %rb, "Rollback failed");
                }
                Err(e)
            }
        }
    }

    async fn insert_list(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        list: &List,
        sites: &[Site],
        items: &[Item],
    ) -> Result<WriteCounts> {
        let mut counts = self.insert_records(tx, sites, items).await?;

        for entry in list.entries() {
            counts.sites += sqlx::query(
                "INSERT INTO site (id) VALUES (?) ON CONFLICT(id) DO NOTHING",
            )
            .bind(sql_id(entry.site_id))
            .execute(&mut **tx)
            .await?
            .rows_affected();
            counts.items += sqlx::query(
                "INSERT INTO item (id, site_id) VALUES (?, ?) ON CONFLICT(id) DO NOTHING",
            )
            .bind(sql_id(entry.item_id))
            .bind(sql_id(entry.site_id))
            .execute(&mut **tx)
            .await?
            .rows_affected();
            counts.rankings += sqlx::query(
                "INSERT INTO ranking (list_id, rank, item_id, site_id) VALUES (?, ?, ?, ?) \
                 ON CONFLICT(list_id, rank, item_id) DO NOTHING",
            )
            .bind(list.id.as_u32())
            .bind(entry.rank)
            .bind(sql_id(entry.item_id))
            .bind(sql_id(entry.site_id))
            .execute(&mut **tx)
            .await?
            .rows_affected();
        }

        debug!(entries = list.entries().len(), "Inserted ranking rows");
        Ok(counts)
    }

    /// Upsert detail records outside of any list, in one transaction.
    #[instrument(level = "info", skip_all, fields(sites = sites.len(), items = items.len()))]
    pub async fn write_records(&self, sites: &[Site], items: &[Item]) -> Result<WriteCounts> {
        let mut tx = self.pool.begin().await?;
        match self.insert_records(&mut tx, sites, items).await {
            Ok(counts) => {
                tx.commit().await?;
                Ok(counts)
            }
            Err(e) => {
                if let Err(rb) = tx.rollback().await {
                    error!(error = %rb, "Rollback failed");
                }
                Err(e)
            }
        }
    }

    async fn insert_records(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        sites: &[Site],
        items: &[Item],
    ) -> Result<WriteCounts> {
        let mut counts = WriteCounts::default();
        for site in sites {
            counts.sites += sqlx::query(&self.site_sql)
                .bind(sql_id(site.id))
                .bind(&site.name)
                .bind(&site.url)
                .bind(&site.segment)
                .bind(&site.city)
                .bind(&site.country)
                .execute(&mut **tx)
                .await?
                .rows_affected();
        }
        for item in items {
            counts.items += sqlx::query(&self.item_sql)
                .bind(sql_id(item.id))
                .bind(item.site_id.map(sql_id))
                .bind(&item.name)
                .bind(&item.summary)
                .bind(&item.url)
                .bind(&item.manufacturer)
                .bind(item.cores)
                .bind(item.memory)
                .bind(&item.processor)
                .bind(&item.interconnect)
                .bind(item.linpack)
                .bind(item.theoretical_peak)
                .bind(item.nmax)
                .bind(item.nhalf)
                .bind(item.hpcg)
                .bind(item.power)
                .bind(item.power_measurement_level)
                .bind(item.measured_cores)
                .bind(&item.os)
                .bind(&item.compiler)
                .bind(&item.mathlib)
                .bind(&item.mpi)
                .execute(&mut **tx)
                .await?
                .rows_affected();
        }
        Ok(counts)
    }

    /// Count every label occurrence in `labels`, in one transaction.
    pub async fn record_labels(&self, labels: &[String]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for label in labels {
            sqlx::query(
                "INSERT INTO label_survey (label) VALUES (?) \
                 ON CONFLICT(label) DO UPDATE SET count = count + 1",
            )
            .bind(label)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn clear_labels(&self) -> Result<()> {
        sqlx::query("DELETE FROM label_survey").execute(&self.pool).await?;
        Ok(())
    }

    /// `(label, count)` pairs, most frequent first.
    pub async fn label_counts(&self) -> Result<Vec<(String, i64)>> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            "SELECT label, count FROM label_survey ORDER BY count DESC, label",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn count(&self, table: &str) -> Result<i64> {
        if !TABLES.contains(&table) {
            return Err(HarvestError::Persistence(sqlx::Error::Protocol(format!(
                "unknown table {table}"
            ))));
        }
        let n = sqlx::query_scalar::<_, i64>(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }

    pub async fn load_site(&self, id: u64) -> Result<Option<Site>> {
        let sql = format!("SELECT {SITE_COLUMNS} FROM site WHERE id = ?");
        let row = sqlx::query_as::<_, SiteRow>(&sql)
            .bind(sql_id(id))
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Site::from))
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[derive(sqlx::FromRow)]
struct SiteRow {
    id: i64,
    name: Option<String>,
    url: Option<String>,
    segment: Option<String>,
    city: Option<String>,
    country: Option<String>,
}

impl From<SiteRow> for Site {
    fn from(row: SiteRow) -> Self {
        Site {
            id: row.id as u64,
            name: row.name,
            url: row.url,
            segment: row.segment,
            city: row.city,
            country: row.country,
        }
    }
}

/// SQLite integers are signed; source ids fit comfortably.
fn sql_id(id: u64) -> i64 {
    id as i64
}

fn item_update_clause() -> String {
    ITEM_UPDATE_COLUMNS
        .iter()
        .map(|c| format!("{c} = COALESCE(excluded.{c}, item.{c})"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn upsert_sql(
    table: &str,
    columns: &str,
    arity: usize,
    update: &str,
    policy: ConflictPolicy,
) -> String {
    let placeholders = vec!["?"; arity].join(", ");
    let on_conflict = match policy {
        ConflictPolicy::Update => format!("DO UPDATE SET {update}"),
        ConflictPolicy::Ignore => "DO NOTHING".to_string(),
    };
    format!("INSERT INTO {table} ({columns}) VALUES ({placeholders}) ON CONFLICT(id) {on_conflict}")
}
