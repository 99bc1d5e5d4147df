use gtk4::prelude::*;
use gtk4::{glib, ApplicationWindow};
use std::cell::RefCell;
use std::collections::HashMap;

use crate::database::Database;

/// Shared application state, passed around by `Rc` instead of living in a
/// global.
pub struct AppContext {
    pub db: Database,
    pub registry: ActiveNotes,
}

impl AppContext {
    pub fn new(db: Database) -> Self {
        AppContext { db, registry: ActiveNotes::new() }
    }
}

/// Live note windows keyed by note id. Written on load and on every save;
/// nothing reads it back at runtime. Weak references, so the map never keeps
/// a closed window alive.
pub struct ActiveNotes {
    windows: RefCell<HashMap<i64, glib::WeakRef<ApplicationWindow>>>,
}

impl ActiveNotes {
    fn new() -> Self {
        ActiveNotes { windows: RefCell::new(HashMap::new()) }
    }

    pub fn register(&self, id: i64, window: &ApplicationWindow) {
        self.windows.borrow_mut().insert(id, window.downgrade());
    }
}
