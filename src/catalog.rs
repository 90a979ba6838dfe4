use rusqlite::{params, OptionalExtension};
use thiserror::Error;

use crate::db::{Database, DbError};

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("Catalog store error: {0}")]
    Db(#[from] DbError),
    #[error("Catalog store error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

type Result<T> = std::result::Result<T, CatalogError>;

/// The fields the pipeline writes for one catalog item. The store's
/// internal schema is its own business — this is the whole contract.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemFields {
    pub name: String,
    pub title: Option<String>,
    pub canonical_key: Option<String>,
    pub artist: String,
    pub show_identifier: String,
    pub show_date: Option<String>,
    pub venue: Option<String>,
    pub track_number: Option<i32>,
    pub length_secs: Option<f64>,
    pub format: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertAction {
    Created,
    Updated,
    /// Fields identical to the stored item — counted, not written.
    Unchanged,
}

#[derive(Debug, Clone, Copy)]
pub struct UpsertOutcome {
    pub item_id: i64,
    pub action: UpsertAction,
}

/// External catalog-store collaborator. Items are keyed by SKU (the
/// track's content hash), so the same recording always lands on the same
/// item no matter how often it is imported.
pub trait CatalogStore {
    fn get_item(&self, sku: &str) -> Result<Option<(i64, ItemFields)>>;

    fn item_exists_for_sku(&self, sku: &str) -> Result<bool> {
        Ok(self.get_item(sku)?.is_some())
    }

    /// Create, update, or skip depending on what is already stored.
    fn upsert_item(&self, sku: &str, fields: &ItemFields) -> Result<UpsertOutcome>;

    /// Add the item to a grouping path ("artist/Grateful Dead/1977-05-08").
    /// Idempotent.
    fn assign_to_group(&self, item_id: i64, group_path: &str) -> Result<()>;
}

/// Thin SQLite-backed adapter so the binary and tests have a working
/// collaborator. Nothing outside this type knows about its tables.
pub struct SqliteCatalog<'a> {
    db: &'a Database,
}

impl<'a> SqliteCatalog<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Group paths an item belongs to (for tests and inspection).
    pub fn groups_for_item(&self, item_id: i64) -> Result<Vec<String>> {
        let mut stmt = self
            .db
            .conn
            .prepare("SELECT group_path FROM catalog_groups WHERE item_id = ?1 ORDER BY group_path")?;
        let rows = stmt
            .query_map(params![item_id], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(rows)
    }

    pub fn item_count(&self) -> Result<i64> {
        let n = self
            .db
            .conn
            .query_row("SELECT COUNT(*) FROM catalog_items", [], |row| row.get(0))?;
        Ok(n)
    }
}

impl CatalogStore for SqliteCatalog<'_> {
    fn get_item(&self, sku: &str) -> Result<Option<(i64, ItemFields)>> {
        let row = self
            .db
            .conn
            .query_row(
                "SELECT id, name, title, canonical_key, artist, show_identifier,
                        show_date, venue, track_number, length_secs, format
                 FROM catalog_items WHERE sku = ?1",
                params![sku],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        ItemFields {
                            name: row.get(1)?,
                            title: row.get(2)?,
                            canonical_key: row.get(3)?,
                            artist: row.get(4)?,
                            show_identifier: row.get(5)?,
                            show_date: row.get(6)?,
                            venue: row.get(7)?,
                            track_number: row.get(8)?,
                            length_secs: row.get(9)?,
                            format: row.get(10)?,
                        },
                    ))
                },
            )
            .optional()?;
        Ok(row)
    }

    fn upsert_item(&self, sku: &str, fields: &ItemFields) -> Result<UpsertOutcome> {
        match self.get_item(sku)? {
            None => {
                self.db.conn.execute(
                    "INSERT INTO catalog_items (
                        sku, name, title, canonical_key, artist, show_identifier,
                        show_date, venue, track_number, length_secs, format
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                    params![
                        sku,
                        fields.name,
                        fields.title,
                        fields.canonical_key,
                        fields.artist,
                        fields.show_identifier,
                        fields.show_date,
                        fields.venue,
                        fields.track_number,
                        fields.length_secs,
                        fields.format,
                    ],
                )?;
                Ok(UpsertOutcome {
                    item_id: self.db.conn.last_insert_rowid(),
                    action: UpsertAction::Created,
                })
            }
            Some((id, existing)) if existing == *fields => Ok(UpsertOutcome {
                item_id: id,
                action: UpsertAction::Unchanged,
            }),
            Some((id, _)) => {
                self.db.conn.execute(
                    "UPDATE catalog_items SET
                        name = ?2, title = ?3, canonical_key = ?4, artist = ?5,
                        show_identifier = ?6, show_date = ?7, venue = ?8,
                        track_number = ?9, length_secs = ?10, format = ?11,
                        updated_at = datetime('now')
                     WHERE id = ?1",
                    params![
                        id,
                        fields.name,
                        fields.title,
                        fields.canonical_key,
                        fields.artist,
                        fields.show_identifier,
                        fields.show_date,
                        fields.venue,
                        fields.track_number,
                        fields.length_secs,
                        fields.format,
                    ],
                )?;
                Ok(UpsertOutcome {
                    item_id: id,
                    action: UpsertAction::Updated,
                })
            }
        }
    }

    fn assign_to_group(&self, item_id: i64, group_path: &str) -> Result<()> {
        self.db.conn.execute(
            "INSERT OR IGNORE INTO catalog_groups (item_id, group_path) VALUES (?1, ?2)",
            params![item_id, group_path],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(name: &str) -> ItemFields {
        ItemFields {
            name: name.to_string(),
            title: Some("Bertha".to_string()),
            canonical_key: Some("bertha".to_string()),
            artist: "Grateful Dead".to_string(),
            show_identifier: "gd1977-05-08.sbd".to_string(),
            show_date: Some("1977-05-08".to_string()),
            venue: Some("Barton Hall".to_string()),
            track_number: Some(1),
            length_secs: Some(380.5),
            format: "Flac".to_string(),
        }
    }

    #[test]
    fn test_create_update_skip() {
        let db = Database::open_in_memory().unwrap();
        let store = SqliteCatalog::new(&db);

        let f = fields("t01.flac");
        let first = store.upsert_item("sku1", &f).unwrap();
        assert_eq!(first.action, UpsertAction::Created);

        // Identical fields: no write
        let second = store.upsert_item("sku1", &f).unwrap();
        assert_eq!(second.action, UpsertAction::Unchanged);
        assert_eq!(second.item_id, first.item_id);

        // Changed field: update, same item
        let mut f2 = f.clone();
        f2.venue = Some("Cornell".to_string());
        let third = store.upsert_item("sku1", &f2).unwrap();
        assert_eq!(third.action, UpsertAction::Updated);
        assert_eq!(third.item_id, first.item_id);
        assert_eq!(store.item_count().unwrap(), 1);
    }

    #[test]
    fn test_exists_and_groups() {
        let db = Database::open_in_memory().unwrap();
        let store = SqliteCatalog::new(&db);
        assert!(!store.item_exists_for_sku("sku1").unwrap());

        let out = store.upsert_item("sku1", &fields("t01.flac")).unwrap();
        assert!(store.item_exists_for_sku("sku1").unwrap());

        store.assign_to_group(out.item_id, "artist/Grateful Dead").unwrap();
        store
            .assign_to_group(out.item_id, "artist/Grateful Dead/1977-05-08")
            .unwrap();
        // Idempotent
        store.assign_to_group(out.item_id, "artist/Grateful Dead").unwrap();

        assert_eq!(
            store.groups_for_item(out.item_id).unwrap(),
            vec![
                "artist/Grateful Dead".to_string(),
                "artist/Grateful Dead/1977-05-08".to_string()
            ]
        );
    }
}
