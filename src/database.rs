use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;

pub const MAX_TEXT_LEN: usize = 64_000;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("note text is {0} characters, the store caps it at {MAX_TEXT_LEN}")]
    TextTooLong(usize),
    #[error("note has no id; it was never inserted")]
    Unsaved,
}

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Note {
    pub id: Option<i64>,
    pub text: String,
    pub position_x: i32,
    pub position_y: i32,
    pub position_right: i32,
    pub position_bottom: i32,
    pub background_red: u8,
    pub background_green: u8,
    pub background_blue: u8,
}

impl Note {
    pub fn with_defaults() -> Self {
        Note {
            id: None,
            text: String::new(),
            position_x: 0,
            position_y: 0,
            position_right: 100,
            position_bottom: 100,
            background_red: 255,
            background_green: 255,
            background_blue: 255,
        }
    }

    pub fn background(&self) -> (u8, u8, u8) {
        (self.background_red, self.background_green, self.background_blue)
    }
}

#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn new(db_path: &Path) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        // Performance pragmas
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA cache_size=-8000;
             PRAGMA temp_store=MEMORY;",
        )?;
        let db = Database { conn: Arc::new(Mutex::new(conn)) };
        db.init_tables()?;
        db.run_migrations()?;
        Ok(db)
    }

    fn init_tables(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS notes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                text TEXT NOT NULL,
                position_x INTEGER DEFAULT 0,
                position_y INTEGER DEFAULT 0,
                position_right INTEGER DEFAULT 100,
                position_bottom INTEGER DEFAULT 100
            );",
        )?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        // Background color columns arrived after the first release
        let has_background: bool = conn
            .prepare("SELECT background_red FROM notes LIMIT 0")
            .is_ok();
        if !has_background {
            conn.execute_batch(
                "ALTER TABLE notes ADD COLUMN background_red INTEGER DEFAULT 255;
                 ALTER TABLE notes ADD COLUMN background_green INTEGER DEFAULT 255;
                 ALTER TABLE notes ADD COLUMN background_blue INTEGER DEFAULT 255;",
            )?;
        }
        Ok(())
    }

    pub fn create_note(&self, note: &Note) -> Result<i64> {
        Self::check_text(&note.text)?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO notes (text, position_x, position_y, position_right, position_bottom, background_red, background_green, background_blue)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                note.text, note.position_x, note.position_y,
                note.position_right, note.position_bottom,
                note.background_red, note.background_green, note.background_blue
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn update_note(&self, note: &Note) -> Result<()> {
        let id = note.id.ok_or(StoreError::Unsaved)?;
        Self::check_text(&note.text)?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE notes SET text = ?1, position_x = ?2, position_y = ?3, position_right = ?4, position_bottom = ?5, background_red = ?6, background_green = ?7, background_blue = ?8
             WHERE id = ?9",
            params![
                note.text, note.position_x, note.position_y,
                note.position_right, note.position_bottom,
                note.background_red, note.background_green, note.background_blue,
                id
            ],
        )?;
        Ok(())
    }

    pub fn first_note(&self) -> Result<Option<Note>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(
            "SELECT id, text, position_x, position_y, position_right, position_bottom, background_red, background_green, background_blue
             FROM notes ORDER BY id LIMIT 1",
        )?;
        let mut rows = stmt.query_map([], Self::row_to_note)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    fn check_text(text: &str) -> Result<()> {
        let len = text.chars().count();
        if len > MAX_TEXT_LEN {
            return Err(StoreError::TextTooLong(len));
        }
        Ok(())
    }

    fn row_to_note(row: &rusqlite::Row) -> rusqlite::Result<Note> {
        Ok(Note {
            id: Some(row.get(0)?),
            text: row.get(1)?,
            position_x: row.get(2)?,
            position_y: row.get(3)?,
            position_right: row.get(4)?,
            position_bottom: row.get(5)?,
            background_red: row.get(6)?,
            background_green: row.get(7)?,
            background_blue: row.get(8)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_store() -> (TempDir, Database) {
        let dir = TempDir::new().expect("temp dir");
        let db = Database::new(&dir.path().join("limpet.db")).expect("open database");
        (dir, db)
    }

    #[test]
    fn fresh_note_carries_documented_defaults() {
        let note = Note::with_defaults();
        assert_eq!(note.id, None);
        assert_eq!(note.text, "");
        assert_eq!((note.position_x, note.position_y), (0, 0));
        assert_eq!((note.position_right, note.position_bottom), (100, 100));
        assert_eq!(note.background(), (255, 255, 255));
    }

    #[test]
    fn create_assigns_id_and_persists_defaults() {
        let (_dir, db) = open_store();
        let id = db.create_note(&Note::with_defaults()).expect("create");
        let stored = db.first_note().expect("load").expect("row exists");
        assert_eq!(stored.id, Some(id));
        assert_eq!(stored.text, "");
        assert_eq!((stored.position_x, stored.position_y), (0, 0));
        assert_eq!((stored.position_right, stored.position_bottom), (100, 100));
        assert_eq!(stored.background(), (255, 255, 255));
    }

    #[test]
    fn update_overwrites_the_full_record() {
        let (_dir, db) = open_store();
        let mut note = Note::with_defaults();
        note.id = Some(db.create_note(&note).expect("create"));
        note.text = "<p>groceries</p>".to_string();
        note.position_x = 140;
        note.position_y = 60;
        note.position_right = 304;
        note.position_bottom = 220;
        db.update_note(&note).expect("update");
        let stored = db.first_note().expect("load").expect("row exists");
        assert_eq!(stored.text, "<p>groceries</p>");
        assert_eq!((stored.position_x, stored.position_y), (140, 60));
        assert_eq!((stored.position_right, stored.position_bottom), (304, 220));
    }

    #[test]
    fn moves_compose_additively_across_saves() {
        let (_dir, db) = open_store();
        let mut note = Note::with_defaults();
        note.id = Some(db.create_note(&note).expect("create"));
        for (dx, dy) in [(3, 0), (10, -4), (-2, 9)] {
            note.position_x += dx;
            note.position_y += dy;
            db.update_note(&note).expect("update");
        }
        let stored = db.first_note().expect("load").expect("row exists");
        assert_eq!((stored.position_x, stored.position_y), (11, 5));
    }

    #[test]
    fn background_color_survives_reopen() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("limpet.db");
        {
            let db = Database::new(&path).expect("open database");
            let mut note = Note::with_defaults();
            note.id = Some(db.create_note(&note).expect("create"));
            note.background_red = 120;
            note.background_green = 200;
            note.background_blue = 40;
            db.update_note(&note).expect("update");
        }
        let db = Database::new(&path).expect("reopen database");
        let stored = db.first_note().expect("load").expect("row exists");
        assert_eq!(stored.background(), (120, 200, 40));
    }

    #[test]
    fn first_note_returns_the_lowest_id() {
        let (_dir, db) = open_store();
        let first = db.create_note(&Note::with_defaults()).expect("create");
        let mut second = Note::with_defaults();
        second.text = "<p>later</p>".to_string();
        db.create_note(&second).expect("create");
        let stored = db.first_note().expect("load").expect("row exists");
        assert_eq!(stored.id, Some(first));
    }

    #[test]
    fn empty_store_yields_no_note() {
        let (_dir, db) = open_store();
        assert!(db.first_note().expect("load").is_none());
    }

    #[test]
    fn oversized_text_is_rejected() {
        let (_dir, db) = open_store();
        let mut note = Note::with_defaults();
        note.text = "x".repeat(MAX_TEXT_LEN + 1);
        assert!(matches!(db.create_note(&note), Err(StoreError::TextTooLong(_))));
        note.id = Some(1);
        assert!(matches!(db.update_note(&note), Err(StoreError::TextTooLong(_))));
    }

    #[test]
    fn update_without_id_is_refused() {
        let (_dir, db) = open_store();
        let note = Note::with_defaults();
        assert!(matches!(db.update_note(&note), Err(StoreError::Unsaved)));
    }

    #[test]
    fn first_release_table_gains_color_columns() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("limpet.db");
        {
            let conn = Connection::open(&path).expect("open raw");
            conn.execute_batch(
                "CREATE TABLE notes (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    text TEXT NOT NULL,
                    position_x INTEGER DEFAULT 0,
                    position_y INTEGER DEFAULT 0,
                    position_right INTEGER DEFAULT 100,
                    position_bottom INTEGER DEFAULT 100
                 );
                 INSERT INTO notes (text, position_x, position_y, position_right, position_bottom)
                 VALUES ('<p>carried over</p>', 5, 6, 120, 90);",
            )
            .expect("seed old schema");
        }
        let db = Database::new(&path).expect("migrate");
        let stored = db.first_note().expect("load").expect("row exists");
        assert_eq!(stored.text, "<p>carried over</p>");
        assert_eq!((stored.position_right, stored.position_bottom), (120, 90));
        assert_eq!(stored.background(), (255, 255, 255));
    }

    #[test]
    fn reopening_the_store_is_idempotent() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("limpet.db");
        {
            let db = Database::new(&path).expect("open database");
            db.create_note(&Note::with_defaults()).expect("create");
        }
        let db = Database::new(&path).expect("reopen database");
        assert!(db.first_note().expect("load").is_some());
    }
}
