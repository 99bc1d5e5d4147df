use gtk4::prelude::*;
use gtk4::{glib, Application};
use std::rc::Rc;

mod agenda;
mod context;
mod database;
mod note_window;
mod persist;
mod pickers;
mod rich_editor;

const APP_ID: &str = "com.limpet.Limpet";

fn main() -> glib::ExitCode {
    let app = Application::builder().application_id(APP_ID).build();
    app.connect_activate(build_ui);
    app.run()
}

fn build_ui(app: &Application) {
    load_css();

    // Initialize the record store
    let data_dir = dirs::data_dir()
        .expect("Could not determine data directory")
        .join("limpet");
    std::fs::create_dir_all(&data_dir).expect("Failed to create data directory");
    let db_path = data_dir.join("limpet.db");
    let db = database::Database::new(&db_path).expect("Failed to initialize database");

    let ctx = Rc::new(context::AppContext::new(db));

    // One window, bound to the first stored note (or a fresh default)
    let note = ctx.db.first_note().expect("Failed to load note record");
    let nw = note_window::NoteWindow::new(app, ctx, note);
    nw.present();
}

fn load_css() {
    let provider = gtk4::CssProvider::new();
    provider.load_from_data(
        "window.sticky-window { background-color: rgb(255, 255, 255); }
         .drag-strip { background-color: alpha(@theme_fg_color, 0.06); }
         textview.note-editor { font-family: Times; font-size: 18pt; }
         textview.note-editor text { background-color: transparent; }
         .resize-grip { opacity: 0.5; }
         .resize-grip:hover { opacity: 1.0; }
         window.agenda-dialog label.agenda-slot { padding: 2px; }",
    );
    gtk4::style_context_add_provider_for_display(
        &gtk4::gdk::Display::default().expect("Could not get default display"),
        &provider,
        gtk4::STYLE_PROVIDER_PRIORITY_APPLICATION,
    );
}
