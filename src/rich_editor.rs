use gtk4::prelude::*;
use gtk4::{glib, ScrolledWindow, TextBuffer, TextIter, TextTag, TextView};
use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::rc::Rc;

use html5ever::tendril::StrTendril;
use html5ever::tokenizer::{
    BufferQueue, TagKind, Token, TokenSink, TokenSinkResult, Tokenizer, TokenizerOpts,
};

pub struct RichEditor {
    pub widget: ScrolledWindow,
    pub text_view: TextView,
    pub buffer: TextBuffer,
    pending_tags: Rc<RefCell<HashSet<String>>>,
    inhibit_changed: Rc<Cell<bool>>,
}

impl RichEditor {
    pub fn new() -> Self {
        let buffer = TextBuffer::new(None);
        let table = buffer.tag_table();

        // Pre-create formatting tags
        let bold = TextTag::builder().name("bold").weight(700).build();
        let italic = TextTag::builder().name("italic").style(gtk4::pango::Style::Italic).build();
        let underline = TextTag::builder().name("underline").underline(gtk4::pango::Underline::Single).build();
        for tag in [&bold, &italic, &underline] {
            table.add(tag);
        }

        let pending_tags: Rc<RefCell<HashSet<String>>> = Rc::new(RefCell::new(HashSet::new()));
        let inhibit_changed = Rc::new(Cell::new(false));

        let text_view = TextView::builder()
            .buffer(&buffer)
            .wrap_mode(gtk4::WrapMode::Word)
            .hexpand(true)
            .vexpand(true)
            .css_classes(["note-editor"])
            .left_margin(8)
            .right_margin(8)
            .top_margin(8)
            .bottom_margin(8)
            .build();

        // Keyboard shortcuts
        let key_controller = gtk4::EventControllerKey::new();
        let buf_for_keys = buffer.clone();
        let pt_for_keys = pending_tags.clone();
        key_controller.connect_key_pressed(move |_, keyval, _, modifier| {
            let ctrl = modifier.contains(gtk4::gdk::ModifierType::CONTROL_MASK);
            if !ctrl {
                return glib::Propagation::Proceed;
            }
            match keyval {
                gtk4::gdk::Key::b => {
                    toggle_inline_tag(&buf_for_keys, "bold", &pt_for_keys);
                    glib::Propagation::Stop
                }
                gtk4::gdk::Key::i => {
                    toggle_inline_tag(&buf_for_keys, "italic", &pt_for_keys);
                    glib::Propagation::Stop
                }
                gtk4::gdk::Key::u => {
                    toggle_inline_tag(&buf_for_keys, "underline", &pt_for_keys);
                    glib::Propagation::Stop
                }
                _ => glib::Propagation::Proceed,
            }
        });
        text_view.add_controller(key_controller);

        // Pending tags: apply to newly inserted text
        let pt_insert = pending_tags.clone();
        let inhibit_insert = inhibit_changed.clone();
        buffer.connect_insert_text(move |buf, iter, text| {
            if inhibit_insert.get() {
                return;
            }
            let tags = pt_insert.borrow().clone();
            if tags.is_empty() {
                return;
            }
            let end_offset = iter.offset();
            let start_offset = end_offset - text.chars().count() as i32;
            let start = buf.iter_at_offset(start_offset);
            let end = buf.iter_at_offset(end_offset);
            for tag_name in &tags {
                let tag = get_or_create_tag(&buf.tag_table(), tag_name);
                buf.apply_tag(&tag, &start, &end);
            }
        });

        // Clear pending tags on cursor movement
        let pt_mark = pending_tags.clone();
        buffer.connect_mark_set(move |_, _, mark| {
            if mark.name().as_deref() == Some("insert") {
                pt_mark.borrow_mut().clear();
            }
        });

        let widget = ScrolledWindow::builder()
            .child(&text_view)
            .vexpand(true)
            .hexpand(true)
            .build();

        RichEditor {
            widget,
            text_view,
            buffer,
            pending_tags,
            inhibit_changed,
        }
    }

    pub fn set_content(&self, html: &str) {
        self.inhibit_changed.set(true);
        self.buffer.set_text("");
        if !html.is_empty() {
            apply_html(&self.buffer, html);
        }
        self.inhibit_changed.set(false);
    }

    pub fn content_html(&self) -> String {
        render_html(&buffer_lines(&self.buffer))
    }

    pub fn toggle_bold(&self) {
        toggle_inline_tag(&self.buffer, "bold", &self.pending_tags);
    }

    pub fn toggle_italic(&self) {
        toggle_inline_tag(&self.buffer, "italic", &self.pending_tags);
    }

    pub fn toggle_underline(&self) {
        toggle_inline_tag(&self.buffer, "underline", &self.pending_tags);
    }

    /// Applies the chosen family and point size to the selection, or to the
    /// caret's pending state when nothing is selected.
    pub fn apply_font(&self, desc: &gtk4::pango::FontDescription) {
        if let Some(family) = desc.family() {
            self.apply_exclusive_tag("font::", &format!("font::{}", family));
        }
        if desc.size() > 0 {
            let points = desc.size() / gtk4::pango::SCALE;
            self.apply_exclusive_tag("size::", &format!("size::{}", points));
        }
    }

    // A font family or size replaces any previous tag of the same kind
    fn apply_exclusive_tag(&self, prefix: &str, tag_name: &str) {
        let tag = get_or_create_tag(&self.buffer.tag_table(), tag_name);
        if let Some((start, end)) = self.buffer.selection_bounds() {
            remove_prefixed_tags_in_range(&self.buffer, prefix, &start, &end);
            self.buffer.apply_tag(&tag, &start, &end);
        } else {
            let mut p = self.pending_tags.borrow_mut();
            p.retain(|t| !t.starts_with(prefix));
            p.insert(tag_name.to_string());
        }
    }
}

// ── Inline tag toggling ────────────────────────────────────────────

fn toggle_inline_tag(buffer: &TextBuffer, tag_name: &str, pending: &Rc<RefCell<HashSet<String>>>) {
    let tag = get_or_create_tag(&buffer.tag_table(), tag_name);
    if let Some((start, end)) = buffer.selection_bounds() {
        if has_tag_in_range(buffer, tag_name, &start, &end) {
            buffer.remove_tag(&tag, &start, &end);
        } else {
            buffer.apply_tag(&tag, &start, &end);
        }
    } else {
        flip_pending(&mut pending.borrow_mut(), tag_name);
    }
}

fn flip_pending(pending: &mut HashSet<String>, tag_name: &str) -> bool {
    if pending.contains(tag_name) {
        pending.remove(tag_name);
        false
    } else {
        pending.insert(tag_name.to_string());
        true
    }
}

fn has_tag_in_range(buffer: &TextBuffer, tag_name: &str, start: &TextIter, end: &TextIter) -> bool {
    let tag = match buffer.tag_table().lookup(tag_name) {
        Some(t) => t,
        None => return false,
    };
    let limit = end.offset();
    let mut iter = *start;
    loop {
        if iter.offset() >= limit {
            return false;
        }
        if iter.has_tag(&tag) {
            return true;
        }
        if !iter.forward_char() {
            return false;
        }
    }
}

fn get_or_create_tag(table: &gtk4::TextTagTable, name: &str) -> TextTag {
    if let Some(tag) = table.lookup(name) {
        return tag;
    }
    let tag = if let Some(family) = name.strip_prefix("font::") {
        TextTag::builder().name(name).family(family).build()
    } else if let Some(size) = name.strip_prefix("size::") {
        let points = size.parse::<f64>().unwrap_or(18.0);
        TextTag::builder().name(name).size_points(points).build()
    } else {
        TextTag::builder().name(name).build()
    };
    table.add(&tag);
    tag
}

fn remove_prefixed_tags_in_range(buffer: &TextBuffer, prefix: &str, start: &TextIter, end: &TextIter) {
    let mut found: Vec<TextTag> = Vec::new();
    let mut iter = *start;
    while iter.offset() < end.offset() {
        for tag in iter.tags() {
            if tag.name().map_or(false, |n| n.starts_with(prefix)) && !found.contains(&tag) {
                found.push(tag);
            }
        }
        if !iter.forward_char() {
            break;
        }
    }
    for tag in found {
        buffer.remove_tag(&tag, start, end);
    }
}

// ── Serialization: Buffer → HTML ───────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
struct Run {
    text: String,
    tags: Vec<String>,
}

fn buffer_lines(buffer: &TextBuffer) -> Vec<Vec<Run>> {
    let mut lines = Vec::new();
    let line_count = buffer.line_count();

    for line_idx in 0..line_count {
        let line_start = match buffer.iter_at_line(line_idx) {
            Some(it) => it,
            None => continue,
        };
        let mut line_end = line_start;
        if !line_end.ends_line() {
            line_end.forward_to_line_end();
        }

        // Skip trailing empty line (GTK adds one after final \n)
        if line_idx == line_count - 1
            && line_start.offset() == line_end.offset()
            && line_start.offset() == buffer.end_iter().offset()
        {
            continue;
        }

        let mut runs = Vec::new();
        let mut iter = line_start;
        while iter.offset() < line_end.offset() {
            // Collect contiguous text with the same tags
            let tags_here = inline_tag_names(&iter);
            let seg_start = iter.offset();
            loop {
                if !iter.forward_char() || iter.offset() >= line_end.offset() {
                    break;
                }
                if inline_tag_names(&iter) != tags_here {
                    break;
                }
            }
            let seg_end = iter.offset().min(line_end.offset());
            let seg_start_iter = buffer.iter_at_offset(seg_start);
            let seg_end_iter = buffer.iter_at_offset(seg_end);
            let text = buffer.text(&seg_start_iter, &seg_end_iter, false).to_string();
            if text.is_empty() {
                continue;
            }
            runs.push(Run { text, tags: tags_here });
        }
        lines.push(runs);
    }

    lines
}

fn inline_tag_names(iter: &TextIter) -> Vec<String> {
    let mut names: Vec<String> = iter
        .tags()
        .into_iter()
        .filter_map(|t| t.name().map(|n| n.to_string()))
        .collect();
    names.sort_by(|a, b| tag_rank(a).cmp(&tag_rank(b)).then_with(|| a.cmp(b)));
    names
}

fn tag_rank(name: &str) -> u8 {
    match name {
        "bold" => 0,
        "italic" => 1,
        "underline" => 2,
        n if n.starts_with("font::") => 3,
        n if n.starts_with("size::") => 4,
        _ => 5,
    }
}

fn render_html(lines: &[Vec<Run>]) -> String {
    let mut html = String::new();
    for runs in lines {
        html.push_str("<p>");
        for run in runs {
            let mut close_tags: Vec<&str> = Vec::new();
            for tag_name in &run.tags {
                match tag_name.as_str() {
                    "bold" => {
                        html.push_str("<b>");
                        close_tags.push("</b>");
                    }
                    "italic" => {
                        html.push_str("<i>");
                        close_tags.push("</i>");
                    }
                    "underline" => {
                        html.push_str("<u>");
                        close_tags.push("</u>");
                    }
                    n if n.starts_with("font::") => {
                        html.push_str(&format!("<span style=\"font-family:{}\">", escape_html(&n[6..])));
                        close_tags.push("</span>");
                    }
                    n if n.starts_with("size::") => {
                        html.push_str(&format!("<span style=\"font-size:{}pt\">", &n[6..]));
                        close_tags.push("</span>");
                    }
                    _ => {}
                }
            }
            html.push_str(&escape_html(&run.text));
            for close in close_tags.iter().rev() {
                html.push_str(close);
            }
        }
        html.push_str("</p>\n");
    }
    html
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

// ── Deserialization: HTML → Buffer ─────────────────────────────────

struct HtmlSink {
    tokens: RefCell<Vec<HtmlToken>>,
}

#[derive(Debug)]
enum HtmlToken {
    StartTag(String, Vec<(String, String)>),
    EndTag(String),
    Text(String),
}

impl TokenSink for HtmlSink {
    type Handle = ();

    fn process_token(&self, token: Token, _line_number: u64) -> TokenSinkResult<()> {
        match token {
            Token::TagToken(tag) => {
                let name = tag.name.to_string();
                let attrs: Vec<(String, String)> = tag
                    .attrs
                    .iter()
                    .map(|a| (a.name.local.to_string(), a.value.to_string()))
                    .collect();
                match tag.kind {
                    TagKind::StartTag => self.tokens.borrow_mut().push(HtmlToken::StartTag(name, attrs)),
                    TagKind::EndTag => self.tokens.borrow_mut().push(HtmlToken::EndTag(name)),
                }
            }
            Token::CharacterTokens(s) => {
                self.tokens.borrow_mut().push(HtmlToken::Text(s.to_string()));
            }
            _ => {}
        }
        TokenSinkResult::Continue
    }
}

fn tokenize(html: &str) -> Vec<HtmlToken> {
    let sink = HtmlSink { tokens: RefCell::new(Vec::new()) };
    let tokenizer = Tokenizer::new(sink, TokenizerOpts::default());
    let mut queue = BufferQueue::default();
    queue.push_back(StrTendril::from(html));
    let _ = tokenizer.feed(&mut queue);
    tokenizer.end();
    tokenizer.sink.tokens.into_inner()
}

fn apply_html(buffer: &TextBuffer, html: &str) {
    let tokens = tokenize(html);

    let mut tag_stack: Vec<(String, Vec<(String, String)>, i32)> = Vec::new(); // (tag_name, attrs, start_offset)
    let mut need_newline_before_block = false;
    let mut in_block = false;
    let mut skip_depth: i32 = 0; // inside <style>/<script>/<title>

    for token in &tokens {
        match token {
            HtmlToken::StartTag(name, attrs) => match name.as_str() {
                "p" | "div" => {
                    if need_newline_before_block {
                        let mut end = buffer.end_iter();
                        buffer.insert(&mut end, "\n");
                    }
                    need_newline_before_block = true;
                    in_block = true;
                    let offset = buffer.end_iter().offset();
                    tag_stack.push((name.clone(), attrs.clone(), offset));
                }
                "br" => {
                    let mut end = buffer.end_iter();
                    buffer.insert(&mut end, "\n");
                }
                "style" | "script" | "title" => {
                    skip_depth += 1;
                }
                _ => {
                    // Inline tags
                    let offset = buffer.end_iter().offset();
                    tag_stack.push((name.clone(), attrs.clone(), offset));
                }
            },
            HtmlToken::EndTag(name) => match name.as_str() {
                "style" | "script" | "title" => {
                    skip_depth = (skip_depth - 1).max(0);
                }
                _ => {
                    // Find matching start tag
                    if let Some(pos) = tag_stack.iter().rposition(|(n, _, _)| n == name) {
                        let (tag_name, attrs, start_offset) = tag_stack.remove(pos);
                        let end_offset = buffer.end_iter().offset();

                        // Reset in_block for block elements before the size
                        // check, so empty blocks still reset the flag
                        if matches!(tag_name.as_str(), "p" | "div") {
                            in_block = false;
                        }

                        if start_offset < end_offset {
                            let start = buffer.iter_at_offset(start_offset);
                            let end = buffer.iter_at_offset(end_offset);

                            match tag_name.as_str() {
                                "b" | "strong" => {
                                    let tag = get_or_create_tag(&buffer.tag_table(), "bold");
                                    buffer.apply_tag(&tag, &start, &end);
                                }
                                "i" | "em" => {
                                    let tag = get_or_create_tag(&buffer.tag_table(), "italic");
                                    buffer.apply_tag(&tag, &start, &end);
                                }
                                "u" => {
                                    let tag = get_or_create_tag(&buffer.tag_table(), "underline");
                                    buffer.apply_tag(&tag, &start, &end);
                                }
                                "span" | "font" | "p" | "div" | "body" => {
                                    for derived in attr_tag_names(&attrs) {
                                        let tag = get_or_create_tag(&buffer.tag_table(), &derived);
                                        buffer.apply_tag(&tag, &start, &end);
                                    }
                                }
                                _ => {}
                            }
                        }
                    }
                }
            },
            HtmlToken::Text(text) => {
                if skip_depth > 0 || text.is_empty() {
                    continue;
                }
                // Skip whitespace-only text between block elements
                if !in_block && text.chars().all(|c| c.is_whitespace()) {
                    continue;
                }
                let mut end = buffer.end_iter();
                buffer.insert(&mut end, text);
            }
        }
    }
}

// Formatting carried in attributes: style properties, plus <font face=…>
fn attr_tag_names(attrs: &[(String, String)]) -> Vec<String> {
    let mut tags = Vec::new();
    for (key, value) in attrs {
        match key.as_str() {
            "style" => tags.extend(parse_style_tags(value)),
            "face" => tags.push(format!("font::{}", value.trim())),
            _ => {}
        }
    }
    tags
}

fn parse_style_tags(style: &str) -> Vec<String> {
    let mut tags = Vec::new();
    for part in style.split(';') {
        let part = part.trim();
        if let Some((prop, val)) = part.split_once(':') {
            let prop = prop.trim().to_ascii_lowercase();
            let val = val.trim();
            match prop.as_str() {
                "font-family" => {
                    let family = val
                        .split(',')
                        .next()
                        .unwrap_or(val)
                        .trim()
                        .trim_matches(|c| c == '\'' || c == '"');
                    if !family.is_empty() {
                        tags.push(format!("font::{}", family));
                    }
                }
                "font-size" => {
                    let number: String = val
                        .chars()
                        .take_while(|c| c.is_ascii_digit() || *c == '.')
                        .collect();
                    if let Ok(points) = number.parse::<f64>() {
                        tags.push(format!("size::{}", points.round() as i32));
                    }
                }
                "font-weight" => {
                    let bold = val.eq_ignore_ascii_case("bold")
                        || val.parse::<i32>().map(|w| w >= 600).unwrap_or(false);
                    if bold {
                        tags.push("bold".to_string());
                    }
                }
                "font-style" => {
                    if val.eq_ignore_ascii_case("italic") {
                        tags.push("italic".to_string());
                    }
                }
                "text-decoration" => {
                    if val.to_ascii_lowercase().contains("underline") {
                        tags.push("underline".to_string());
                    }
                }
                _ => {}
            }
        }
    }
    tags
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(text: &str, tags: &[&str]) -> Run {
        Run {
            text: text.to_string(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
        }
    }

    #[test]
    fn pending_toggle_twice_restores_state() {
        let mut pending = HashSet::new();
        assert!(flip_pending(&mut pending, "bold"));
        assert!(!flip_pending(&mut pending, "bold"));
        assert!(pending.is_empty());

        pending.insert("italic".to_string());
        flip_pending(&mut pending, "underline");
        flip_pending(&mut pending, "underline");
        assert_eq!(pending.len(), 1);
        assert!(pending.contains("italic"));
    }

    #[test]
    fn renders_plain_paragraphs() {
        let lines = vec![vec![run("first", &[])], vec![run("second", &[])]];
        assert_eq!(render_html(&lines), "<p>first</p>\n<p>second</p>\n");
    }

    #[test]
    fn renders_inline_formatting() {
        let lines = vec![vec![
            run("plain ", &[]),
            run("loud", &["bold", "italic"]),
            run(" calm", &["underline"]),
        ]];
        assert_eq!(
            render_html(&lines),
            "<p>plain <b><i>loud</i></b><u> calm</u></p>\n"
        );
    }

    #[test]
    fn renders_font_and_size_spans() {
        let lines = vec![vec![run("styled", &["font::Times", "size::18"])]];
        assert_eq!(
            render_html(&lines),
            "<p><span style=\"font-family:Times\"><span style=\"font-size:18pt\">styled</span></span></p>\n"
        );
    }

    #[test]
    fn renders_empty_line_as_empty_paragraph() {
        let lines = vec![vec![run("a", &[])], vec![], vec![run("b", &[])]];
        assert_eq!(render_html(&lines), "<p>a</p>\n<p></p>\n<p>b</p>\n");
    }

    #[test]
    fn escapes_reserved_characters() {
        let lines = vec![vec![run("a < b & \"c\"", &[])]];
        assert_eq!(render_html(&lines), "<p>a &lt; b &amp; &quot;c&quot;</p>\n");
    }

    #[test]
    fn style_parsing_extracts_font_properties() {
        let tags = parse_style_tags(" font-family:'Times New Roman', serif; font-size:18pt ");
        assert_eq!(tags, vec!["font::Times New Roman", "size::18"]);
    }

    #[test]
    fn style_parsing_maps_weight_and_decoration() {
        let tags = parse_style_tags("font-weight:600; font-style:italic; text-decoration: underline");
        assert_eq!(tags, vec!["bold", "italic", "underline"]);
    }

    #[test]
    fn style_parsing_ignores_normal_weight() {
        assert!(parse_style_tags("font-weight:400").is_empty());
        assert!(parse_style_tags("color:#333").is_empty());
    }

    #[test]
    fn tokenizer_preserves_order_and_attributes() {
        let tokens = tokenize("<p><b>hi</b></p>");
        let shape: Vec<String> = tokens
            .iter()
            .map(|t| match t {
                HtmlToken::StartTag(n, _) => format!("+{}", n),
                HtmlToken::EndTag(n) => format!("-{}", n),
                HtmlToken::Text(s) => format!("'{}'", s),
            })
            .collect();
        assert_eq!(shape, vec!["+p", "+b", "'hi'", "-b", "-p"]);

        let tokens = tokenize("<span style=\"font-size:14pt\">x</span>");
        match &tokens[0] {
            HtmlToken::StartTag(name, attrs) => {
                assert_eq!(name, "span");
                assert_eq!(attrs[0].0, "style");
                assert_eq!(attrs[0].1, "font-size:14pt");
            }
            other => panic!("unexpected token {:?}", other),
        }
    }

    #[test]
    fn tokenizer_decodes_entities() {
        // Character runs may arrive split around each decoded entity
        let tokens = tokenize("<p>a &lt; b &amp; c</p>");
        let text: String = tokens
            .iter()
            .filter_map(|t| match t {
                HtmlToken::Text(s) => Some(s.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(text, "a < b & c");
    }

    #[test]
    fn attr_tags_cover_font_face() {
        let attrs = vec![("face".to_string(), "Georgia".to_string())];
        assert_eq!(attr_tag_names(&attrs), vec!["font::Georgia"]);
    }
}
