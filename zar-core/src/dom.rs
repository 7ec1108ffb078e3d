//! Document access used by the overlay engine
//!
//! Elements are addressed by a stable [`ElementId`] handed out by the host.
//! [`MemoryDom`] is a small in-process document used by the CLI and tests.

use std::fmt;

/// Stable per-element identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ElementId(pub u64);

impl fmt::Display for ElementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Query and mutation capability over a document.
pub trait Dom: Send {
    /// Elements matching `selector`, in document order.
    fn query_selector_all(&self, selector: &str) -> Vec<ElementId>;
    /// Rendered text of the element.
    fn text(&self, el: ElementId) -> Option<String>;
    /// Raw inner markup of the element.
    fn html(&self, el: ElementId) -> Option<String>;
    /// Link target, if the element has one.
    fn href(&self, el: ElementId) -> Option<String>;
    fn set_html(&mut self, el: ElementId, html: &str);
    fn set_text(&mut self, el: ElementId, text: &str);
    fn set_href(&mut self, el: ElementId, href: &str);
}

/// One element of a [`MemoryDom`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryElement {
    pub tag: String,
    pub id: Option<String>,
    pub classes: Vec<String>,
    pub href: Option<String>,
    pub html: String,
}

impl MemoryElement {
    pub fn new(tag: &str) -> Self {
        Self {
            tag: tag.to_ascii_lowercase(),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.id = Some(id.to_string());
        self
    }

    pub fn with_class(mut self, class: &str) -> Self {
        self.classes.push(class.to_string());
        self
    }

    pub fn with_href(mut self, href: &str) -> Self {
        self.href = Some(href.to_string());
        self
    }

    pub fn with_html(mut self, html: &str) -> Self {
        self.html = html.to_string();
        self
    }

    pub fn with_text(mut self, text: &str) -> Self {
        self.html = escape_html(text);
        self
    }

    fn matches(&self, selector: &SimpleSelector) -> bool {
        if let Some(tag) = &selector.tag {
            if tag != "*" && *tag != self.tag {
                return false;
            }
        }
        if let Some(id) = &selector.id {
            if self.id.as_deref() != Some(id.as_str()) {
                return false;
            }
        }
        selector
            .classes
            .iter()
            .all(|class| self.classes.iter().any(|c| c == class))
    }
}

/// Compound selector: optional tag, optional `#id`, any number of `.class`.
#[derive(Debug, Default, PartialEq, Eq)]
struct SimpleSelector {
    tag: Option<String>,
    id: Option<String>,
    classes: Vec<String>,
}

fn parse_selector(raw: &str) -> Option<SimpleSelector> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    let mut selector = SimpleSelector::default();
    let mut current = String::new();
    let mut kind = 't';

    let flush = |kind: char, value: &mut String, sel: &mut SimpleSelector| -> bool {
        let part = std::mem::take(value);
        match kind {
            't' if !part.is_empty() => sel.tag = Some(part.to_ascii_lowercase()),
            't' => {}
            '#' if !part.is_empty() => sel.id = Some(part),
            '.' if !part.is_empty() => sel.classes.push(part),
            _ => return false,
        }
        true
    };

    for c in raw.chars() {
        match c {
            '.' | '#' => {
                if !flush(kind, &mut current, &mut selector) {
                    return None;
                }
                kind = c;
            }
            c if c.is_alphanumeric() || c == '-' || c == '_' || c == '*' => current.push(c),
            // Combinators and attribute selectors are not supported.
            _ => return None,
        }
    }
    if !flush(kind, &mut current, &mut selector) {
        return None;
    }
    Some(selector)
}

/// An in-process document.
#[derive(Debug, Default, Clone)]
pub struct MemoryDom {
    elements: Vec<MemoryElement>,
}

impl MemoryDom {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, element: MemoryElement) -> ElementId {
        self.elements.push(element);
        ElementId((self.elements.len() - 1) as u64)
    }

    pub fn element(&self, el: ElementId) -> Option<&MemoryElement> {
        self.elements.get(el.0 as usize)
    }

    fn element_mut(&mut self, el: ElementId) -> Option<&mut MemoryElement> {
        self.elements.get_mut(el.0 as usize)
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }
}

impl Dom for MemoryDom {
    fn query_selector_all(&self, selector: &str) -> Vec<ElementId> {
        let selectors: Option<Vec<SimpleSelector>> =
            selector.split(',').map(parse_selector).collect();
        let Some(selectors) = selectors else {
            tracing::debug!(selector, "Unsupported selector");
            return Vec::new();
        };

        self.elements
            .iter()
            .enumerate()
            .filter(|(_, el)| selectors.iter().any(|s| el.matches(s)))
            .map(|(i, _)| ElementId(i as u64))
            .collect()
    }

    fn text(&self, el: ElementId) -> Option<String> {
        self.element(el).map(|e| html_to_text(&e.html))
    }

    fn html(&self, el: ElementId) -> Option<String> {
        self.element(el).map(|e| e.html.clone())
    }

    fn href(&self, el: ElementId) -> Option<String> {
        self.element(el).and_then(|e| e.href.clone())
    }

    fn set_html(&mut self, el: ElementId, html: &str) {
        if let Some(e) = self.element_mut(el) {
            e.html = html.to_string();
        }
    }

    fn set_text(&mut self, el: ElementId, text: &str) {
        if let Some(e) = self.element_mut(el) {
            e.html = escape_html(text);
        }
    }

    fn set_href(&mut self, el: ElementId, href: &str) {
        if let Some(e) = self.element_mut(el) {
            e.href = Some(href.to_string());
        }
    }
}

/// Escape text for inclusion in markup.
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            c => out.push(c),
        }
    }
    out
}

/// Drop tags and decode the common entities.
pub fn html_to_text(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => in_tag = true,
            '>' if in_tag => in_tag = false,
            c if !in_tag => out.push(c),
            _ => {}
        }
    }
    out.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}
