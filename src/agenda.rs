use gtk4::prelude::*;
use gtk4::{glib, ApplicationWindow, Button, Label, Orientation, Window};

use crate::note_window::{background_css, move_window};

/// Placeholder agenda surface: three fixed date slots and a dismiss
/// control. Takes on the parent note's background color and screen
/// position at the moment it is opened.
pub fn show_agenda(parent: &ApplicationWindow, background: (u8, u8, u8), origin: (i32, i32)) {
    let dialog = Window::builder()
        .title("Agenda")
        .transient_for(parent)
        .modal(false)
        .decorated(false)
        .default_width(200)
        .default_height(160)
        .build();

    dialog.add_css_class("agenda-dialog");

    // Unique class so each opening carries its own background
    let agenda_class = format!(
        "agenda-{}",
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis()
    );
    dialog.add_css_class(&agenda_class);

    let provider = gtk4::CssProvider::new();
    gtk4::style_context_add_provider_for_display(
        &gtk4::gdk::Display::default().expect("Could not get default display"),
        &provider,
        gtk4::STYLE_PROVIDER_PRIORITY_USER,
    );
    provider.load_from_data(&background_css(&agenda_class, background));

    // The provider is display-global; closing the dialog takes it back out
    let provider_for_close = provider.clone();
    dialog.connect_close_request(move |_| {
        if let Some(display) = gtk4::gdk::Display::default() {
            gtk4::style_context_remove_provider_for_display(&display, &provider_for_close);
        }
        glib::Propagation::Proceed
    });

    let vbox = gtk4::Box::builder()
        .orientation(Orientation::Vertical)
        .spacing(6)
        .margin_top(8)
        .margin_bottom(8)
        .margin_start(8)
        .margin_end(8)
        .build();

    for slot in ["Date 1", "Date 2", "Date 3"] {
        let label = Label::builder()
            .label(slot)
            .xalign(0.0)
            .css_classes(["agenda-slot"])
            .build();
        vbox.append(&label);
    }

    let dismiss_btn = Button::builder().label("Dismiss").build();
    let dialog_for_dismiss = dialog.clone();
    dismiss_btn.connect_clicked(move |_| {
        dialog_for_dismiss.close();
    });
    vbox.append(&dismiss_btn);

    dialog.set_child(Some(&vbox));

    // Land on the parent note's position once mapped, X11 only
    let (x, y) = origin;
    if x > 0 || y > 0 {
        dialog.connect_realize(move |_| {
            glib::timeout_add_local_once(std::time::Duration::from_millis(100), move || {
                move_window("Agenda", x, y);
            });
        });
    }

    dialog.present();
}
