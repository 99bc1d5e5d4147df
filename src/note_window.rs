use gtk4::prelude::*;
use gtk4::{glib, ApplicationWindow, DrawingArea, Orientation, Overlay};
use gtk4::gdk::prelude::ToplevelExt;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use crate::agenda;
use crate::context::AppContext;
use crate::database::Note;
use crate::persist::{Persister, WritePolicy};
use crate::pickers;
use crate::rich_editor::RichEditor;

// Inset folded into the stored size fields so the grip sits clear of the edges
pub const GRIP_SIZE: i32 = 16;

const WINDOW_TITLE: &str = "Limpet";

pub struct NoteWindow {
    pub window: ApplicationWindow,
}

/// Frame-to-frame drag state. The anchor follows the pointer on every
/// motion event, so each delta covers only the distance since the last
/// event rather than since the press.
struct DragTracker {
    anchor: Option<(i32, i32)>,
}

impl DragTracker {
    fn new() -> Self {
        DragTracker { anchor: None }
    }

    fn press(&mut self, x: i32, y: i32) {
        self.anchor = Some((x, y));
    }

    /// Delta from the previously seen pointer position, if any.
    /// The anchor is refreshed whether or not a delta was available.
    fn motion(&mut self, x: i32, y: i32) -> Option<(i32, i32)> {
        let prev = self.anchor.replace((x, y));
        prev.map(|(ax, ay)| (x - ax, y - ay))
    }
}

/// Size fields as stored: the client edges pulled in by the grip inset.
fn grip_adjusted(width: i32, height: i32) -> (i32, i32) {
    (width - GRIP_SIZE, height - GRIP_SIZE)
}

/// Stored position follows the pointer only for moves that were issued.
fn apply_drag_delta<F: FnOnce(i32, i32) -> bool>(note: &mut Note, dx: i32, dy: i32, place: F) {
    let x = note.position_x + dx;
    let y = note.position_y + dy;
    if place(x, y) {
        note.position_x = x;
        note.position_y = y;
    }
}

impl NoteWindow {
    pub fn new(app: &gtk4::Application, ctx: Rc<AppContext>, note: Option<Note>) -> Self {
        let mut note = note.unwrap_or_else(Note::with_defaults);

        // A window always sits on a stored record, so a fresh note is
        // written out before anything is shown
        let note_id = match note.id {
            Some(id) => id,
            None => {
                let id = ctx
                    .db
                    .create_note(&note)
                    .expect("Failed to create note record");
                note.id = Some(id);
                id
            }
        };

        let win_w = if note.position_right > 0 { note.position_right } else { 100 };
        let win_h = if note.position_bottom > 0 { note.position_bottom } else { 100 };

        let window = ApplicationWindow::builder()
            .application(app)
            .title(WINDOW_TITLE)
            .default_width(win_w)
            .default_height(win_h)
            .decorated(false)
            .resizable(true)
            .build();

        window.add_css_class("sticky-window");
        let note_class = format!("note-{}", note_id);
        window.add_css_class(&note_class);

        // Per-window background color, keyed by the note class
        let bg_provider = gtk4::CssProvider::new();
        gtk4::style_context_add_provider_for_display(
            &gtk4::gdk::Display::default().expect("Could not get default display"),
            &bg_provider,
            gtk4::STYLE_PROVIDER_PRIORITY_USER,
        );
        apply_background(&bg_provider, &note_class, note.background());

        // Restore saved position on X11
        let pos_x = note.position_x;
        let pos_y = note.position_y;
        if pos_x > 0 || pos_y > 0 {
            window.connect_realize(move |_| {
                let x = pos_x;
                let y = pos_y;
                glib::timeout_add_local_once(std::time::Duration::from_millis(100), move || {
                    move_window(WINDOW_TITLE, x, y);
                });
            });
        }

        let main_box = gtk4::Box::builder()
            .orientation(Orientation::Vertical)
            .build();

        // A thin strip along the top is the grab surface for moving the
        // window, since the editor swallows clicks everywhere else
        let drag_strip = gtk4::Box::builder()
            .orientation(Orientation::Horizontal)
            .height_request(10)
            .css_classes(["drag-strip"])
            .build();
        main_box.append(&drag_strip);

        let editor = Rc::new(RichEditor::new());
        main_box.append(&editor.widget);

        let grip = build_resize_grip();

        let overlay = Overlay::new();
        overlay.set_child(Some(&main_box));
        overlay.add_overlay(&grip);
        window.set_child(Some(&overlay));

        // Populate before wiring saves, so loading does not count as an edit
        editor.set_content(&note.text);

        let note = Rc::new(RefCell::new(note));
        let persister = Rc::new(Persister::new(ctx.db.clone(), WritePolicy::Immediate));

        ctx.registry.register(note_id, &window);

        let do_save = {
            let note = note.clone();
            let editor = editor.clone();
            let persister = persister.clone();
            let ctx_for_save = ctx.clone();
            let window_for_save = window.clone();
            Rc::new(move || {
                note.borrow_mut().text = editor.content_html();
                persister.note_changed(&note);
                if let Some(id) = note.borrow().id {
                    ctx_for_save.registry.register(id, &window_for_save);
                }
            })
        };

        // Every buffer mutation writes the whole record back. Tag changes
        // do not emit "changed", so they are wired separately.
        let save_on_edit = do_save.clone();
        editor.buffer.connect_changed(move |_| {
            save_on_edit();
        });
        let save_on_format = do_save.clone();
        editor.buffer.connect_apply_tag(move |_, _, _, _| {
            save_on_format();
        });
        let save_on_unformat = do_save.clone();
        editor.buffer.connect_remove_tag(move |_, _, _, _| {
            save_on_unformat();
        });

        // Drag-to-move from the top strip
        let drag = gtk4::GestureDrag::builder().button(1).build();
        if is_x11() {
            let tracker = Rc::new(RefCell::new(DragTracker::new()));
            let press_at = Rc::new(Cell::new((0.0f64, 0.0f64)));

            let note_for_press = note.clone();
            let tracker_for_press = tracker.clone();
            let press_ref = press_at.clone();
            drag.connect_drag_begin(move |_, x, y| {
                press_ref.set((x, y));
                let n = note_for_press.borrow();
                tracker_for_press
                    .borrow_mut()
                    .press(n.position_x + x as i32, n.position_y + y as i32);
            });

            // The stored position stands in for the window origin, so the
            // pointer's screen position is origin + press point + offset
            let note_for_move = note.clone();
            let tracker_for_move = tracker.clone();
            let press_ref = press_at.clone();
            let save_on_move = do_save.clone();
            drag.connect_drag_update(move |_, off_x, off_y| {
                let (px, py) = press_ref.get();
                let (pointer_x, pointer_y) = {
                    let n = note_for_move.borrow();
                    (
                        n.position_x + (px + off_x) as i32,
                        n.position_y + (py + off_y) as i32,
                    )
                };
                let delta = tracker_for_move.borrow_mut().motion(pointer_x, pointer_y);
                if let Some((dx, dy)) = delta {
                    if dx != 0 || dy != 0 {
                        let mut n = note_for_move.borrow_mut();
                        apply_drag_delta(&mut n, dx, dy, |x, y| move_window(WINDOW_TITLE, x, y));
                    }
                }
                save_on_move();
            });
        } else {
            // No global pointer coordinates off X11; hand the move to the
            // compositor and leave the stored position alone
            let window_for_drag = window.clone();
            drag.connect_drag_begin(move |gesture, x, y| {
                if let Some(surface) = window_for_drag.surface() {
                    if let Some(toplevel) = surface.downcast_ref::<gtk4::gdk::Toplevel>() {
                        let device = gesture.device().unwrap();
                        let timestamp = gesture.current_event_time();
                        let (root_x, root_y) = if let Some(event) =
                            gesture.last_event(gesture.current_sequence().as_ref())
                        {
                            event.position().unwrap_or((x, y))
                        } else {
                            (x, y)
                        };
                        toplevel.begin_move(&device, 1, root_x, root_y, timestamp);
                    }
                }
            });
        }
        drag_strip.add_controller(drag);

        // Size changes store the client edges minus the grip inset.
        // Width and height notify separately, so dedupe on the pair.
        let last_size = Rc::new(Cell::new((0, 0)));
        let on_resize = {
            let note = note.clone();
            let last = last_size.clone();
            let do_save = do_save.clone();
            Rc::new(move |win: &ApplicationWindow| {
                let (w, h) = (win.width(), win.height());
                if w <= 0 || h <= 0 {
                    return;
                }
                let (right, bottom) = grip_adjusted(w, h);
                if last.get() == (right, bottom) {
                    return;
                }
                last.set((right, bottom));
                {
                    let mut n = note.borrow_mut();
                    n.position_right = right;
                    n.position_bottom = bottom;
                }
                do_save();
            })
        };
        let resize_w = on_resize.clone();
        window.connect_default_width_notify(move |win| resize_w(win));
        let resize_h = on_resize.clone();
        window.connect_default_height_notify(move |win| resize_h(win));

        // Corner grip hands the resize to the window system
        let grip_drag = gtk4::GestureDrag::builder().button(1).build();
        let win_for_grip = window.clone();
        grip_drag.connect_drag_begin(move |gesture, x, y| {
            if let Some(surface) = win_for_grip.surface() {
                if let Some(toplevel) = surface.downcast_ref::<gtk4::gdk::Toplevel>() {
                    let device = gesture.device().unwrap();
                    let timestamp = gesture.current_event_time();
                    let (sx, sy) = if let Some(event) =
                        gesture.last_event(gesture.current_sequence().as_ref())
                    {
                        event.position().unwrap_or((x, y))
                    } else {
                        (x, y)
                    };
                    toplevel.begin_resize(
                        gtk4::gdk::SurfaceEdge::SouthEast,
                        Some(&device),
                        1,
                        sx,
                        sy,
                        timestamp,
                    );
                }
            }
        });
        grip.add_controller(grip_drag);

        // Window-level shortcuts; the editor keeps Ctrl+B/I/U to itself
        let key_controller = gtk4::EventControllerKey::new();
        {
            let editor = editor.clone();
            let note = note.clone();
            let provider = bg_provider.clone();
            let class = note_class.clone();
            let do_save = do_save.clone();
            let persister = persister.clone();
            let window_ref = window.clone();
            key_controller.connect_key_pressed(move |_, keyval, _, modifier| {
                let ctrl = modifier.contains(gtk4::gdk::ModifierType::CONTROL_MASK);
                if !ctrl {
                    return glib::Propagation::Proceed;
                }
                match keyval {
                    gtk4::gdk::Key::t => {
                        let editor_for_pick = editor.clone();
                        pickers::choose_font(&window_ref, move |desc| {
                            editor_for_pick.apply_font(desc);
                        });
                        glib::Propagation::Stop
                    }
                    gtk4::gdk::Key::g => {
                        let current = note.borrow().background();
                        let note_for_pick = note.clone();
                        let provider_for_pick = provider.clone();
                        let class_for_pick = class.clone();
                        let save_for_pick = do_save.clone();
                        pickers::choose_background_color(&window_ref, current, move |r, g, b| {
                            {
                                let mut n = note_for_pick.borrow_mut();
                                n.background_red = r;
                                n.background_green = g;
                                n.background_blue = b;
                            }
                            apply_background(&provider_for_pick, &class_for_pick, (r, g, b));
                            save_for_pick();
                        });
                        glib::Propagation::Stop
                    }
                    gtk4::gdk::Key::d => {
                        let (bg, origin) = {
                            let n = note.borrow();
                            (n.background(), (n.position_x, n.position_y))
                        };
                        agenda::show_agenda(&window_ref, bg, origin);
                        glib::Propagation::Stop
                    }
                    gtk4::gdk::Key::k => {
                        do_save();
                        persister.flush(&note);
                        window_ref.close();
                        glib::Propagation::Stop
                    }
                    _ => glib::Propagation::Proceed,
                }
            });
        }
        window.add_controller(key_controller);

        // Save once more on the way out, whatever triggered the close
        let save_on_close = do_save.clone();
        let persister_for_close = persister.clone();
        let note_for_close = note.clone();
        window.connect_close_request(move |_| {
            save_on_close();
            persister_for_close.flush(&note_for_close);
            glib::Propagation::Proceed
        });

        editor.text_view.grab_focus();

        NoteWindow { window }
    }

    pub fn present(&self) {
        self.window.present();
    }
}

fn build_resize_grip() -> DrawingArea {
    let grip = DrawingArea::builder()
        .width_request(GRIP_SIZE)
        .height_request(GRIP_SIZE)
        .halign(gtk4::Align::End)
        .valign(gtk4::Align::End)
        .css_classes(["resize-grip"])
        .build();
    grip.set_draw_func(|_area, cr, w, h| {
        cr.set_source_rgba(0.5, 0.5, 0.5, 0.8);
        cr.set_line_width(1.0);
        for step in 1..4 {
            let inset = (step * 4) as f64;
            cr.move_to(w as f64, h as f64 - inset);
            cr.line_to(w as f64 - inset, h as f64);
        }
        let _ = cr.stroke();
    });
    grip
}

fn apply_background(provider: &gtk4::CssProvider, note_class: &str, color: (u8, u8, u8)) {
    provider.load_from_data(&background_css(note_class, color));
}

// Scoped to a single window class so per-window providers stay independent
pub(crate) fn background_css(class: &str, color: (u8, u8, u8)) -> String {
    let (r, g, b) = color;
    format!(
        "window.{nc} {{ background-color: rgb({r}, {g}, {b}); }}",
        nc = class,
        r = r,
        g = g,
        b = b
    )
}

/// Places a window by title via wmctrl. The call is waited on, so every
/// child is reaped; the return reports whether the move was issued.
pub(crate) fn move_window(title: &str, x: i32, y: i32) -> bool {
    std::process::Command::new("wmctrl")
        .args(["-r", title, "-e", &format!("0,{},{},{},{}", x, y, -1, -1)])
        .output()
        .map_or(false, |out| out.status.success())
}

fn is_x11() -> bool {
    std::env::var("XDG_SESSION_TYPE").unwrap_or_default() == "x11"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drag_deltas_compose_additively() {
        let mut tracker = DragTracker::new();
        tracker.press(10, 10);
        assert_eq!(tracker.motion(13, 14), Some((3, 4)));
        assert_eq!(tracker.motion(20, 20), Some((7, 6)));
    }

    #[test]
    fn anchor_refreshes_on_every_event() {
        let mut tracker = DragTracker::new();
        tracker.press(0, 0);
        assert_eq!(tracker.motion(5, 0), Some((5, 0)));
        // A repeat of the same position is a zero delta, not a re-run
        assert_eq!(tracker.motion(5, 0), Some((0, 0)));
    }

    #[test]
    fn motion_before_any_press_reports_no_delta() {
        let mut tracker = DragTracker::new();
        assert_eq!(tracker.motion(40, 40), None);
        // The event still seeds the anchor, as the next motion shows
        assert_eq!(tracker.motion(41, 43), Some((1, 3)));
    }

    #[test]
    fn stored_size_is_inset_by_the_grip() {
        assert_eq!(grip_adjusted(100, 100), (84, 84));
        assert_eq!(grip_adjusted(500, 300), (484, 284));
    }

    #[test]
    fn drag_commit_follows_an_issued_move() {
        let mut note = Note::with_defaults();
        apply_drag_delta(&mut note, 3, 4, |_, _| true);
        apply_drag_delta(&mut note, 2, -1, |_, _| true);
        assert_eq!((note.position_x, note.position_y), (5, 3));
    }

    #[test]
    fn refused_moves_leave_the_stored_position_alone() {
        let mut note = Note::with_defaults();
        note.position_x = 7;
        note.position_y = 9;
        apply_drag_delta(&mut note, 5, -2, |_, _| false);
        assert_eq!((note.position_x, note.position_y), (7, 9));
    }

    #[test]
    fn repeated_moves_leave_no_unreaped_children() {
        for _ in 0..25 {
            move_window("limpet-placement-check", 4, 4);
        }
        assert_eq!(zombie_children(), 0);
    }

    // Z-state children of this process are calls that were never waited on
    fn zombie_children() -> usize {
        let own_pid = std::process::id().to_string();
        let entries = match std::fs::read_dir("/proc") {
            Ok(entries) => entries,
            Err(_) => return 0,
        };
        let mut count = 0;
        for entry in entries.flatten() {
            let stat = match std::fs::read_to_string(entry.path().join("stat")) {
                Ok(s) => s,
                Err(_) => continue,
            };
            // /proc/<pid>/stat reads "pid (comm) state ppid ..."
            let after_comm = match stat.rsplit(')').next() {
                Some(rest) => rest,
                None => continue,
            };
            let mut fields = after_comm.split_whitespace();
            if fields.next() == Some("Z") && fields.next() == Some(own_pid.as_str()) {
                count += 1;
            }
        }
        count
    }

    #[test]
    fn background_css_scopes_to_the_window_class() {
        assert_eq!(
            background_css("note-7", (250, 235, 160)),
            "window.note-7 { background-color: rgb(250, 235, 160); }"
        );
    }
}
