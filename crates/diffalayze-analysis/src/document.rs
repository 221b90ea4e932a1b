//! Side-by-side HTML diff documents to plain text.
//!
//! Documents are parsed with `scraper`; scripts, styles and the diff
//! "Legends" tables are dropped and the rest is rendered as
//! markdown-flavoured text: ATX headings, one line per table row with
//! ` | ` between cells, and blank lines between blocks. The tree is walked
//! with an explicit stack, so nesting depth is bounded only by memory.

use std::path::Path;

use scraper::{ElementRef, Html, Node};

const SKIPPED_ELEMENTS: &[&str] = &["script", "style", "template"];
const BLOCK_ELEMENTS: &[&str] = &[
    "address", "article", "aside", "blockquote", "body", "dd", "div", "dl", "dt", "fieldset",
    "figure", "footer", "form", "header", "html", "main", "nav", "ol", "p", "section", "table",
    "tbody", "tfoot", "thead", "ul",
];
const LEGENDS: &str = "Legends";

/// Whether `path` looks like an HTML document.
pub fn is_document(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("html") || e.eq_ignore_ascii_case("htm"))
        .unwrap_or(false)
}

/// Convert one HTML document to text.
pub fn html_to_text(html: &str) -> String {
    let document = Html::parse_document(html);
    let mut renderer = Renderer::default();

    // (node, closing) pairs; a node is pushed again as closing once its
    // children are queued.
    let mut stack = vec![(document.tree.root(), false)];
    while let Some((node, closing)) = stack.pop() {
        if let Node::Text(text) = node.value() {
            renderer.text(text);
            continue;
        }
        let element = ElementRef::wrap(node);
        if closing {
            if let Some(element) = element {
                renderer.close(element.value().name());
            }
            continue;
        }
        let descend = match element {
            Some(element) => {
                let name = element.value().name();
                if SKIPPED_ELEMENTS.contains(&name) || is_legends(element) {
                    continue;
                }
                renderer.open(element)
            }
            None => matches!(node.value(), Node::Document | Node::Fragment),
        };
        if element.is_some() {
            stack.push((node, true));
        }
        if descend {
            let children: Vec<_> = node.children().collect();
            stack.extend(children.into_iter().rev().map(|child| (child, false)));
        }
    }
    normalize(&renderer.out)
}

// ---------------------------------------------------------------------------
// Legends removal
// ---------------------------------------------------------------------------

/// A "Legends" table, or the paragraph captioning one.
fn is_legends(element: ElementRef<'_>) -> bool {
    match element.value().name() {
        "table" => {
            previous_element(element).is_some_and(is_legends_caption)
                || (has_descendant(element, "td") && contains_text(element, LEGENDS))
        }
        "p" => is_legends_caption(element),
        _ => false,
    }
}

fn is_legends_caption(element: ElementRef<'_>) -> bool {
    element.value().name() == "p"
        && contains_text(element, LEGENDS)
        && next_element(element).is_some_and(|next| next.value().name() == "table")
}

fn previous_element(element: ElementRef<'_>) -> Option<ElementRef<'_>> {
    element.prev_siblings().find_map(ElementRef::wrap)
}

fn next_element(element: ElementRef<'_>) -> Option<ElementRef<'_>> {
    element.next_siblings().find_map(ElementRef::wrap)
}

fn has_descendant(element: ElementRef<'_>, name: &str) -> bool {
    element
        .descendants()
        .skip(1)
        .any(|n| n.value().as_element().is_some_and(|e| e.name() == name))
}

fn contains_text(element: ElementRef<'_>, needle: &str) -> bool {
    element.text().collect::<String>().contains(needle)
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Renderer {
    out: String,
    pre_depth: usize,
}

impl Renderer {
    fn line_break(&mut self) {
        if !self.out.is_empty() && !self.out.ends_with('\n') {
            self.out.push('\n');
        }
    }

    fn block_break(&mut self) {
        if self.out.is_empty() {
            return;
        }
        self.line_break();
        if !self.out.ends_with("\n\n") {
            self.out.push('\n');
        }
    }

    fn text(&mut self, raw: &str) {
        if self.pre_depth > 0 {
            self.out.push_str(&raw.replace('\u{a0}', " "));
            return;
        }
        let mut collapsed = collapse_whitespace(raw);
        if self.out.is_empty() || self.out.ends_with('\n') || self.out.ends_with(' ') {
            collapsed = collapsed.trim_start().to_string();
        }
        self.out.push_str(&collapsed.replace('\u{a0}', " "));
    }

    /// Emit the opening of `element`; returns whether its children are
    /// rendered by the walk.
    fn open(&mut self, element: ElementRef<'_>) -> bool {
        let name = element.value().name();
        match name {
            "h1" | "h2" | "h3" | "h4" | "h5" | "h6" => {
                let level = name[1..].parse::<usize>().unwrap_or(1);
                self.block_break();
                self.out.push_str(&"#".repeat(level));
                self.out.push(' ');
                self.out.push_str(&inline_text(element));
                false
            }
            "br" => {
                self.out.push('\n');
                false
            }
            "hr" => {
                self.block_break();
                self.out.push_str("---");
                false
            }
            "tr" => {
                self.line_break();
                let cells: Vec<String> = element
                    .children()
                    .filter_map(ElementRef::wrap)
                    .filter(|cell| matches!(cell.value().name(), "td" | "th"))
                    .map(inline_text)
                    .collect();
                self.out.push_str(&cells.join(" | "));
                false
            }
            "li" => {
                self.line_break();
                self.out.push_str("- ");
                true
            }
            "pre" => {
                self.block_break();
                self.pre_depth += 1;
                true
            }
            name if BLOCK_ELEMENTS.contains(&name) => {
                self.block_break();
                true
            }
            _ => true,
        }
    }

    fn close(&mut self, name: &str) {
        match name {
            "h1" | "h2" | "h3" | "h4" | "h5" | "h6" | "hr" => self.block_break(),
            "tr" | "li" => self.line_break(),
            "pre" => {
                self.pre_depth = self.pre_depth.saturating_sub(1);
                self.block_break();
            }
            name if BLOCK_ELEMENTS.contains(&name) => self.block_break(),
            _ => {}
        }
    }
}

/// Cell or heading text on one line.
fn inline_text(element: ElementRef<'_>) -> String {
    let mut raw = String::new();
    for node in element.descendants() {
        match node.value() {
            Node::Text(text) => {
                let hidden = node
                    .parent()
                    .and_then(|p| p.value().as_element())
                    .is_some_and(|p| SKIPPED_ELEMENTS.contains(&p.name()));
                if !hidden {
                    raw.push_str(text);
                }
            }
            Node::Element(e) if e.name() == "br" => raw.push(' '),
            _ => {}
        }
    }
    collapse_whitespace(&raw).trim().replace('\u{a0}', " ")
}

fn collapse_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_space = false;
    for c in text.chars() {
        if c.is_ascii_whitespace() {
            if !in_space {
                out.push(' ');
            }
            in_space = true;
        } else {
            out.push(c);
            in_space = false;
        }
    }
    out
}

/// Right-trim every line, collapse blank-line runs and trim the ends.
fn normalize(text: &str) -> String {
    let mut lines: Vec<&str> = Vec::new();
    for line in text.lines().map(str::trim_end) {
        if line.is_empty() && lines.last().map_or(true, |l| l.is_empty()) {
            continue;
        }
        lines.push(line);
    }
    while lines.last().is_some_and(|l| l.is_empty()) {
        lines.pop();
    }
    lines.join("\n")
}
