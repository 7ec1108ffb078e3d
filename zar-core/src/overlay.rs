//! Phone number extraction and overlay
//!
//! The engine remembers the original state of every element it rewrites so a
//! revert restores the page exactly, no matter how many times the element was
//! re-overlaid in between.
//!
//! Matching is only tuned for US numbers.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::dom::{Dom, ElementId};

static PHONE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\+?\(?\d*\)? ?\(?\d+\)?\d*([\s./-]?\d{2,})+").expect("valid phone regex")
});

/// What [`extract`] found in one element.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extracted {
    pub text: Option<String>,
    pub html: Option<String>,
    /// The matched number as displayed
    pub number_text: Option<String>,
    /// Link target, only for `tel:` links
    pub href: Option<String>,
    /// Normalized digits
    pub number: Option<String>,
}

/// Original state of an overlaid element.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OverlayRecord {
    pub original_text: Option<String>,
    pub original_html: Option<String>,
    pub original_href: Option<String>,
    pub extracted_number: Option<String>,
}

impl From<Extracted> for OverlayRecord {
    fn from(e: Extracted) -> Self {
        Self {
            original_text: e.text,
            original_html: e.html,
            original_href: e.href,
            extracted_number: e.number,
        }
    }
}

/// Strip `+`, whitespace, dashes, parens and a leading country code `1`.
pub fn normalize_number(number_text: &str) -> String {
    let digits: String = number_text
        .chars()
        .filter(|c| !matches!(c, '+' | '-' | '(' | ')') && !c.is_whitespace())
        .collect();
    match digits.strip_prefix('1') {
        Some(rest) => rest.to_string(),
        None => digits,
    }
}

/// Find the first phone number in `text`: (matched text, normalized number).
pub fn find_number(text: &str) -> Option<(String, String)> {
    let m = PHONE_PATTERN.find(text)?;
    let number_text = m.as_str().trim().to_string();
    let number = normalize_number(&number_text);
    Some((number_text, number))
}

/// Scan an element for a phone number. A miss is a valid result with empty
/// number fields.
pub fn extract(dom: &dyn Dom, el: ElementId) -> Extracted {
    let text = dom.text(el);
    let html = dom.html(el);
    let href = dom.href(el).filter(|h| h.starts_with("tel:"));

    let (number_text, number) = match text.as_deref().and_then(find_number) {
        Some((number_text, number)) => (Some(number_text), Some(number)),
        None => (None, None),
    };

    Extracted {
        text,
        html,
        number_text,
        href,
        number,
    }
}

/// `+1NNNNNNNNNN` form of a leased number.
pub fn overlay_form(number: &str) -> String {
    if number.starts_with("+1") {
        number.to_string()
    } else {
        format!("+1{}", number)
    }
}

/// `NNN-NNN-NNNN` from a `+1NNNNNNNNNN` string; unchanged when too short.
fn dashed(overlay_num: &str) -> String {
    match (
        overlay_num.get(2..5),
        overlay_num.get(5..8),
        overlay_num.get(8..12),
    ) {
        (Some(a), Some(b), Some(c)) => format!("{}-{}-{}", a, b, c),
        _ => overlay_num.to_string(),
    }
}

/// Replace the first `needle` found in the text between tags of `html`.
/// Tag names and attribute values are never rewritten. `None` when the
/// needle only occurs inside tags or not at all.
fn replace_in_text_nodes(html: &str, needle: &str, replacement: &str) -> Option<String> {
    if needle.is_empty() {
        return None;
    }

    let mut offset = 0;
    loop {
        let text_end = html[offset..].find('<').map_or(html.len(), |i| offset + i);
        if let Some(pos) = html[offset..text_end].find(needle) {
            let at = offset + pos;
            return Some(format!(
                "{}{}{}",
                &html[..at],
                replacement,
                &html[at + needle.len()..]
            ));
        }
        offset = text_end + html[text_end..].find('>')? + 1;
    }
}

/// Tracks overlaid elements and their original state.
#[derive(Debug, Default)]
pub struct OverlayEngine {
    records: HashMap<ElementId, OverlayRecord>,
}

impl OverlayEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current extraction of each element, tracked or not.
    pub fn extract_all(&self, dom: &dyn Dom, elements: &[ElementId]) -> Vec<Extracted> {
        elements.iter().map(|el| extract(dom, *el)).collect()
    }

    /// Replace the displayed number of each element with `number`.
    ///
    /// Already tracked elements are skipped unless `force` is set. The original
    /// state is recorded on the first overlay only. Returns how many elements
    /// were rewritten.
    pub fn overlay(
        &mut self,
        dom: &mut dyn Dom,
        elements: &[ElementId],
        number: &str,
        force: bool,
    ) -> usize {
        let overlay_num = overlay_form(number);
        let mut reference: Option<String> = None;
        let mut rewritten = 0;

        for &el in elements {
            let tracked = self.records.contains_key(&el);
            if tracked && !force {
                tracing::debug!(element = %el, "Element already overlaid");
                continue;
            }

            let current = extract(&*dom, el);

            if !force {
                match (&reference, &current.number) {
                    (None, Some(n)) => reference = Some(n.clone()),
                    (Some(first), Some(n)) if first != n => {
                        tracing::warn!(
                            first = %first,
                            other = %n,
                            "Overlaying multiple numbers with a single number"
                        );
                    }
                    _ => {}
                }
            }

            if current.href.is_none() && current.number_text.is_none() {
                tracing::debug!(element = %el, "No number text found");
                continue;
            }

            tracing::debug!(element = %el, number = %overlay_num, "Overlaying number");

            if let Some(href) = &current.href {
                if href.starts_with("tel:") {
                    dom.set_href(el, &format!("tel:{}", overlay_num));
                }
            }

            if let Some(number_text) = &current.number_text {
                let replacement = if number_text.contains('-') {
                    dashed(&overlay_num)
                } else {
                    overlay_num.clone()
                };

                let in_markup = current.html.as_deref().and_then(|html| {
                    replace_in_text_nodes(html, number_text, &replacement).or_else(|| {
                        let spaced = number_text.replace(' ', "&nbsp;");
                        replace_in_text_nodes(html, &spaced, &replacement)
                    })
                });
                match (in_markup, &current.text) {
                    (Some(html), _) => dom.set_html(el, &html),
                    (None, Some(text)) => {
                        dom.set_text(el, &text.replacen(number_text.as_str(), &replacement, 1));
                    }
                    (None, None) => dom.set_text(el, &overlay_num),
                }
            }

            if !tracked {
                self.records.insert(el, current.into());
            }
            rewritten += 1;
        }

        rewritten
    }

    /// Restore tracked elements to their original state and stop tracking
    /// them. Untracked elements are ignored.
    pub fn revert(&mut self, dom: &mut dyn Dom, elements: &[ElementId]) -> usize {
        let mut reverted = 0;
        for el in elements {
            let Some(record) = self.records.remove(el) else {
                tracing::debug!(element = %el, "Element not overlaid");
                continue;
            };

            match (&record.original_html, &record.original_text) {
                (Some(html), _) if !html.is_empty() => dom.set_html(*el, html),
                (_, Some(text)) => dom.set_text(*el, text),
                _ => dom.set_text(*el, ""),
            }
            if let Some(href) = &record.original_href {
                dom.set_href(*el, href);
            }
            reverted += 1;
        }
        reverted
    }

    /// Revert every tracked element.
    pub fn revert_all(&mut self, dom: &mut dyn Dom) -> usize {
        let elements: Vec<ElementId> = self.records.keys().copied().collect();
        self.revert(dom, &elements)
    }

    pub fn is_overlaid(&self, el: ElementId) -> bool {
        self.records.contains_key(&el)
    }

    pub fn record(&self, el: ElementId) -> Option<&OverlayRecord> {
        self.records.get(&el)
    }

    pub fn tracked_count(&self) -> usize {
        self.records.len()
    }
}
