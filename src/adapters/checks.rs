//! Heuristic check evaluator.
//!
//! Checks are free-text sentences. The evaluator looks for signals it can
//! verify statically (element ids, tags, required files, libraries) and
//! fails a check only when one of those signals is missing from the file
//! set. Checks without any recognisable signal pass as unverifiable.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use tracing::debug;

use super::{CheckEvaluator, CheckVerdict};
use crate::domain::FileSet;

/// Shortest README that counts as documentation
const MIN_README_CHARS: usize = 50;

/// `#id` at the start of a selector; skips `&#x..;` entities and URL fragments
static ID_SELECTOR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|[^&#/])#([A-Za-z][\w-]*)").unwrap());

static COLOUR_MENTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(colou?rs?|background|border|fill|hex)\b").unwrap());

static MIT_MENTION: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\bmit\b").unwrap());

static LICENSE_MENTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\blicen[cs]e\b").unwrap());

static README_MENTION: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\breadme\b").unwrap());

/// A keyword in the check and the tags that satisfy it
struct ElementRule {
    keyword: Regex,
    tags: &'static [&'static str],
    label: &'static str,
}

impl ElementRule {
    fn new(keyword: &str, tags: &'static [&'static str], label: &'static str) -> Self {
        Self {
            keyword: Regex::new(keyword).unwrap(),
            tags,
            label,
        }
    }
}

const INPUT_TAGS: &[&str] = &["<input", "<textarea"];
const BUTTON_TAGS: &[&str] = &["<button", "type=\"submit\"", "type=\"button\""];
const FORM_TAGS: &[&str] = &["<form"];
const TABLE_TAGS: &[&str] = &["<table"];
const SELECT_TAGS: &[&str] = &["<select"];
const IMAGE_TAGS: &[&str] = &["<img", "<svg"];
const CANVAS_TAGS: &[&str] = &["<canvas"];
const HEADING_TAGS: &[&str] = &["<h1", "<h2", "<h3", "<h4", "<h5", "<h6", "<title"];
const LINK_TAGS: &[&str] = &["<a "];

static ELEMENT_RULES: LazyLock<Vec<ElementRule>> = LazyLock::new(|| {
    vec![
        ElementRule::new(r"(?i)\binputs?\b", INPUT_TAGS, "input field"),
        ElementRule::new(r"(?i)\bbuttons?\b", BUTTON_TAGS, "button"),
        ElementRule::new(r"(?i)\bforms?\b", FORM_TAGS, "form"),
        ElementRule::new(r"(?i)\btables?\b", TABLE_TAGS, "table"),
        ElementRule::new(r"(?i)\b(dropdown|select)s?\b", SELECT_TAGS, "dropdown"),
        ElementRule::new(r"(?i)\b(image|img)s?\b", IMAGE_TAGS, "image"),
        ElementRule::new(r"(?i)\bcanvas\b", CANVAS_TAGS, "canvas"),
        ElementRule::new(r"(?i)\b(heading|title)s?\b", HEADING_TAGS, "heading"),
        ElementRule::new(r"(?i)\b(link|anchor)s?\b", LINK_TAGS, "link"),
    ]
});

/// (keyword in the check, text that must appear in HTML/JS)
static LIBRARY_RULES: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    vec![
        (Regex::new(r"(?i)\bbootstrap\b").unwrap(), "bootstrap"),
        (Regex::new(r"(?i)\bmarked\b").unwrap(), "marked"),
        (Regex::new(r"(?i)\bhighlight\.?js\b").unwrap(), "highlight"),
        (Regex::new(r"(?i)\bchart(\.?js)?\b").unwrap(), "chart"),
    ]
});

/// Evaluates checks by inspecting file contents
#[derive(Debug, Clone, Default)]
pub struct HeuristicCheckEvaluator;

impl HeuristicCheckEvaluator {
    pub fn new() -> Self {
        Self
    }

    /// Synchronous evaluation, shared by the trait impl and tests
    pub fn check(&self, check: &str, files: &FileSet) -> CheckVerdict {
        let markup = files
            .iter()
            .filter(|(path, _)| {
                path.ends_with(".html") || path.ends_with(".htm") || path.ends_with(".js")
            })
            .map(|(_, content)| content.to_lowercase())
            .collect::<Vec<_>>()
            .join("\n");

        let mut signals = 0;
        let mut failures = Vec::new();

        let colour_context = COLOUR_MENTION.is_match(check);
        for capture in ID_SELECTOR.captures_iter(check) {
            if colour_context && is_hex_colour(&capture[1]) {
                continue;
            }
            signals += 1;
            let id = capture[1].to_lowercase();
            let found = markup.contains(&format!("id=\"{}\"", id))
                || markup.contains(&format!("id='{}'", id));
            if !found {
                failures.push(format!("no element with id '{}'", &capture[1]));
            }
        }

        let mentions_mit = MIT_MENTION.is_match(check);
        if mentions_mit || LICENSE_MENTION.is_match(check) {
            signals += 1;
            match files.get("LICENSE") {
                None => failures.push("LICENSE file missing".to_string()),
                Some(text) if mentions_mit && !text.contains("MIT") => {
                    failures.push("LICENSE is not MIT".to_string())
                }
                Some(_) => {}
            }
        }

        if README_MENTION.is_match(check) {
            signals += 1;
            let long_enough = files
                .get("README.md")
                .map(|text| text.trim().chars().count() >= MIN_README_CHARS)
                .unwrap_or(false);
            if !long_enough {
                failures.push("README.md missing or too short".to_string());
            }
        }

        for rule in ELEMENT_RULES.iter() {
            if rule.keyword.is_match(check) {
                signals += 1;
                if !rule.tags.iter().any(|tag| markup.contains(tag)) {
                    failures.push(format!("no {} element", rule.label));
                }
            }
        }

        for (keyword, needle) in LIBRARY_RULES.iter() {
            if keyword.is_match(check) {
                signals += 1;
                if !markup.contains(needle) {
                    failures.push(format!("library '{}' not referenced", needle));
                }
            }
        }

        if signals == 0 {
            debug!(check, "No verifiable signal in check, passing as unverifiable");
            return CheckVerdict::Pass;
        }

        if failures.is_empty() {
            CheckVerdict::Pass
        } else {
            CheckVerdict::fail(failures.join("; "))
        }
    }
}

/// `fff`, `fafafa`, `ffffff80` and the like
fn is_hex_colour(token: &str) -> bool {
    matches!(token.len(), 3 | 4 | 6 | 8) && token.chars().all(|c| c.is_ascii_hexdigit())
}

#[async_trait]
impl CheckEvaluator for HeuristicCheckEvaluator {
    async fn evaluate(&self, check: &str, files: &FileSet) -> CheckVerdict {
        self.check(check, files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn files(entries: &[(&str, &str)]) -> FileSet {
        entries
            .iter()
            .map(|(p, c)| (p.to_string(), c.to_string()))
            .collect()
    }

    fn calculator() -> FileSet {
        files(&[
            (
                "index.html",
                r#"<html><head><title>Calc</title>
                <link href="https://cdn.jsdelivr.net/npm/bootstrap@5.3.0/dist/css/bootstrap.min.css" rel="stylesheet">
                </head><body><h1>Calculator</h1>
                <input type="number" id="num1"><input type="number" id="num2">
                <button id="calculate">=</button><div id="result"></div></body></html>"#,
            ),
            ("README.md", "# Calculator\n\nA small calculator that adds two numbers in the browser."),
            ("LICENSE", "MIT License\n\nCopyright (c) 2025"),
        ])
    }

    #[test]
    fn test_element_checks() {
        let evaluator = HeuristicCheckEvaluator::new();
        let app = calculator();

        assert!(evaluator.check("Has input fields", &app).is_pass());
        assert!(evaluator.check("Page has a button to calculate", &app).is_pass());
        assert!(evaluator.check("Page shows a heading", &app).is_pass());
        assert!(!evaluator.check("Results are shown in a table", &app).is_pass());
    }

    #[test]
    fn test_id_selectors() {
        let evaluator = HeuristicCheckEvaluator::new();
        let app = calculator();

        assert!(evaluator.check("#num1 and #num2 accept numbers", &app).is_pass());

        let verdict = evaluator.check("#total shows the sum", &app);
        assert_eq!(verdict, CheckVerdict::fail("no element with id 'total'"));
    }

    #[test]
    fn test_hex_colours_are_not_ids() {
        let evaluator = HeuristicCheckEvaluator::new();
        let app = calculator();

        assert!(evaluator.check("Background is #fff", &app).is_pass());
        assert!(evaluator.check("Border colour #cafe80 around #result", &app).is_pass());
        assert_eq!(
            evaluator.check("Text colour #abc on #total", &app),
            CheckVerdict::fail("no element with id 'total'")
        );

        // Without a colour context a hex-looking token is still an id
        assert_eq!(
            evaluator.check("#add appends a row", &app),
            CheckVerdict::fail("no element with id 'add'")
        );
    }

    #[test]
    fn test_entities_and_fragments_are_not_ids() {
        let evaluator = HeuristicCheckEvaluator::new();
        let app = calculator();

        assert!(evaluator.check("Shows &#x2713; in #result", &app).is_pass());
        assert!(evaluator.check("Docs at https://example.com/#intro describe usage", &app).is_pass());
        assert!(evaluator.check("button#calculate runs the sum", &app).is_pass());
    }

    #[test]
    fn test_license_and_readme() {
        let evaluator = HeuristicCheckEvaluator::new();
        let app = calculator();

        assert!(evaluator.check("Repo has MIT license", &app).is_pass());
        assert!(evaluator.check("README.md is professional", &app).is_pass());

        let bare = files(&[("index.html", "<html></html>"), ("README.md", "# x")]);
        assert!(!evaluator.check("Repo has MIT license", &bare).is_pass());
        assert!(!evaluator.check("README.md is professional", &bare).is_pass());
    }

    #[test]
    fn test_library_mentions() {
        let evaluator = HeuristicCheckEvaluator::new();
        let app = calculator();

        assert!(evaluator.check("Uses Bootstrap 5 from jsdelivr", &app).is_pass());
        assert!(!evaluator.check("Renders markdown with marked", &app).is_pass());
    }

    #[test]
    fn test_unverifiable_check_passes() {
        let evaluator = HeuristicCheckEvaluator::new();
        assert!(evaluator
            .check("The app feels delightful", &calculator())
            .is_pass());
    }
}
