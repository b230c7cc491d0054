//! Splitting raw documentation into named sections

use crate::types::Sections;
use once_cell::sync::Lazy;
use regex::Regex;

static HEADING: Lazy<Regex> = Lazy::new(|| Regex::new(r"^#+\s*(.+)$").expect("static regex"));
static NON_WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\w\s]").expect("static regex"));
static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("static regex"));

/// Name of the section holding text before the first heading
pub const LEAD_SECTION: &str = "overview";

/// Turns raw documentation text into a section mapping
pub trait SectionSplitter: Send + Sync {
    fn split(&self, raw: &str) -> Sections;
}

/// Splits on Markdown headings of any level
#[derive(Debug, Clone, Copy, Default)]
pub struct MarkdownSplitter;

/// `"Getting Started!"` becomes `getting_started`
pub fn normalize_section_name(heading: &str) -> String {
    let stripped = NON_WORD.replace_all(heading.trim(), "");
    WHITESPACE.replace_all(&stripped, "_").to_lowercase()
}

impl SectionSplitter for MarkdownSplitter {
    fn split(&self, raw: &str) -> Sections {
        let mut sections = Sections::new();
        let mut current = LEAD_SECTION.to_string();
        let mut lines: Vec<&str> = Vec::new();

        for line in raw.lines() {
            let heading = HEADING
                .captures(line)
                .map(|caps| normalize_section_name(&caps[1]))
                .filter(|name| !name.is_empty());

            match heading {
                Some(name) => {
                    if !lines.is_empty() {
                        sections.insert(current, lines.join("\n").trim());
                    }
                    current = name;
                    lines.clear();
                }
                None => lines.push(line),
            }
        }
        if !lines.is_empty() {
            sections.insert(current, lines.join("\n").trim());
        }

        sections
    }
}
