use gtk4::prelude::*;
use gtk4::{gdk, gio, Window};

/// Color chooser for the note background. Calls `on_pick` with the chosen
/// channel values; cancelling picks nothing.
pub fn choose_background_color(
    parent: &impl IsA<Window>,
    current: (u8, u8, u8),
    on_pick: impl Fn(u8, u8, u8) + 'static,
) {
    let dialog = gtk4::ColorDialog::builder().with_alpha(false).build();
    let initial = gdk::RGBA::new(
        current.0 as f32 / 255.0,
        current.1 as f32 / 255.0,
        current.2 as f32 / 255.0,
        1.0,
    );
    dialog.choose_rgba(
        Some(parent),
        Some(&initial),
        None::<&gio::Cancellable>,
        move |result| {
            if let Ok(rgba) = result {
                on_pick(
                    (rgba.red() * 255.0) as u8,
                    (rgba.green() * 255.0) as u8,
                    (rgba.blue() * 255.0) as u8,
                );
            }
        },
    );
}

/// Font chooser. Calls `on_pick` with the chosen description.
pub fn choose_font(
    parent: &impl IsA<Window>,
    on_pick: impl Fn(&gtk4::pango::FontDescription) + 'static,
) {
    let dialog = gtk4::FontDialog::new();
    dialog.choose_font(
        Some(parent),
        None,
        None::<&gio::Cancellable>,
        move |result| {
            if let Ok(desc) = result {
                on_pick(&desc);
            }
        },
    );
}
