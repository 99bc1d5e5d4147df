use gtk4::glib;
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use crate::database::{Database, Note};

/// How a change notification turns into a store write.
pub enum WritePolicy {
    /// Commit on the calling thread before returning, one write per event.
    Immediate,
    /// Coalesce bursts behind a main-loop timer.
    #[allow(dead_code)]
    Debounced(Duration),
}

/// Subscriber sitting between the editing surfaces and the store. Surfaces
/// report that the note changed; the persister decides when the row is
/// written.
pub struct Persister {
    db: Database,
    policy: WritePolicy,
    pending: Rc<RefCell<Option<glib::SourceId>>>,
}

impl Persister {
    pub fn new(db: Database, policy: WritePolicy) -> Self {
        Persister { db, policy, pending: Rc::new(RefCell::new(None)) }
    }

    pub fn note_changed(&self, note: &Rc<RefCell<Note>>) {
        match self.policy {
            WritePolicy::Immediate => Self::commit(&self.db, note),
            WritePolicy::Debounced(delay) => {
                if let Some(id) = self.pending.borrow_mut().take() {
                    id.remove();
                }
                let db = self.db.clone();
                let note = note.clone();
                let pending = self.pending.clone();
                let id = glib::timeout_add_local_once(delay, move || {
                    pending.borrow_mut().take();
                    Self::commit(&db, &note);
                });
                *self.pending.borrow_mut() = Some(id);
            }
        }
    }

    /// Cancels any scheduled write and commits the current state now.
    pub fn flush(&self, note: &Rc<RefCell<Note>>) {
        if let Some(id) = self.pending.borrow_mut().take() {
            id.remove();
        }
        Self::commit(&self.db, note);
    }

    fn commit(db: &Database, note: &Rc<RefCell<Note>>) {
        let snapshot = note.borrow().clone();
        let result = match snapshot.id {
            Some(_) => db.update_note(&snapshot),
            // First save: insert, then carry the assigned id back
            None => db.create_note(&snapshot).map(|id| {
                note.borrow_mut().id = Some(id);
            }),
        };
        if let Err(e) = result {
            eprintln!("Error saving note: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn immediate_persister() -> (TempDir, Persister, Database) {
        let dir = TempDir::new().expect("temp dir");
        let db = Database::new(&dir.path().join("limpet.db")).expect("open database");
        let persister = Persister::new(db.clone(), WritePolicy::Immediate);
        (dir, persister, db)
    }

    #[test]
    fn immediate_policy_writes_before_returning() {
        let (_dir, persister, db) = immediate_persister();
        let note = Rc::new(RefCell::new(Note::with_defaults()));
        persister.note_changed(&note);
        note.borrow_mut().text = "<p>call the plumber</p>".to_string();
        persister.note_changed(&note);
        let stored = db.first_note().expect("load").expect("row exists");
        assert_eq!(stored.text, "<p>call the plumber</p>");
    }

    #[test]
    fn first_commit_assigns_the_record_id() {
        let (_dir, persister, db) = immediate_persister();
        let note = Rc::new(RefCell::new(Note::with_defaults()));
        assert!(note.borrow().id.is_none());
        persister.note_changed(&note);
        let id = note.borrow().id;
        assert!(id.is_some());
        let stored = db.first_note().expect("load").expect("row exists");
        assert_eq!(stored.id, id);
    }

    #[test]
    fn later_commits_update_in_place() {
        let (_dir, persister, db) = immediate_persister();
        let note = Rc::new(RefCell::new(Note::with_defaults()));
        persister.note_changed(&note);
        note.borrow_mut().position_x = 42;
        persister.note_changed(&note);
        note.borrow_mut().position_x = 77;
        persister.note_changed(&note);
        let stored = db.first_note().expect("load").expect("row exists");
        assert_eq!(stored.position_x, 77);
    }

    #[test]
    fn flush_commits_the_current_snapshot() {
        let (_dir, persister, db) = immediate_persister();
        let note = Rc::new(RefCell::new(Note::with_defaults()));
        persister.note_changed(&note);
        note.borrow_mut().text = "<p>final</p>".to_string();
        persister.flush(&note);
        let stored = db.first_note().expect("load").expect("row exists");
        assert_eq!(stored.text, "<p>final</p>");
    }
}
