//! Section parser for llms-full.txt documentation digests.
//!
//! An llms-full.txt file concatenates whole documentation sections delimited by top-level
//! `#` headings. Each H1 section becomes an independent page with a synthetic URL anchor
//! (`#section-<order>-<slug>`) so agents can open the original section directly. `##` and
//! deeper headings stay inside their parent section, as do `#` lines inside code fences.

/// One parsed H1 section of an llms-full document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LlmsFullSection {
    /// Synthetic URL: base URL plus `#section-<order>-<slug>` (or the base URL itself for
    /// the no-heading fallback).
    pub url: String,
    /// Heading line as written, including the `#` marker.
    pub section_title: String,
    /// 0-based position of the section within the document.
    pub section_order: usize,
    /// Full section text, heading line included.
    pub content: String,
    /// Whitespace-separated word count of `content`.
    pub word_count: usize,
}

/// Title used when a document contains no H1 heading at all.
const FALLBACK_TITLE: &str = "Full Document";

/// Build a URL-safe slug from a heading line.
///
/// Lowercases, maps every non-alphanumeric run to a single `-`, and trims leading and
/// trailing dashes. The `#` markers count as non-alphanumeric, so they vanish.
pub fn create_section_slug(heading: &str) -> String {
    let mut slug = String::with_capacity(heading.len());
    let mut pending_dash = false;
    for ch in heading.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(ch.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    slug
}

/// Build the synthetic anchor URL for a section.
pub fn create_section_url(base_url: &str, heading: &str, order: usize) -> String {
    format!(
        "{base_url}#section-{order}-{slug}",
        slug = create_section_slug(heading)
    )
}

/// Split a document at H1 headings into independent sections.
///
/// Returns a single fallback section spanning the whole document when no H1 exists.
/// Parse-then-reparse of the same input yields identical records.
pub fn parse_llms_full_sections(content: &str, base_url: &str) -> Vec<LlmsFullSection> {
    let mut sections: Vec<(String, Vec<&str>)> = Vec::new();
    let mut in_fence = false;

    for line in content.lines() {
        if line.trim_start().starts_with("```") {
            in_fence = !in_fence;
        }
        if !in_fence && is_h1(line) {
            sections.push((line.trim().to_string(), vec![line]));
            continue;
        }
        match sections.last_mut() {
            Some((_, lines)) => lines.push(line),
            // Preamble before the first heading is not part of any section.
            None => {}
        }
    }

    if sections.is_empty() {
        let trimmed = content.trim();
        if trimmed.is_empty() {
            return Vec::new();
        }
        return vec![LlmsFullSection {
            url: base_url.to_string(),
            section_title: FALLBACK_TITLE.to_string(),
            section_order: 0,
            content: trimmed.to_string(),
            word_count: trimmed.split_whitespace().count(),
        }];
    }

    sections
        .into_iter()
        .filter_map(|(title, lines)| {
            let body = lines.join("\n").trim().to_string();
            // A heading with no prose under it is an empty section.
            if lines.len() <= 1 || body == title {
                return None;
            }
            Some((title, body))
        })
        .enumerate()
        .map(|(order, (title, body))| LlmsFullSection {
            url: create_section_url(base_url, &title, order),
            section_title: title,
            section_order: order,
            word_count: body.split_whitespace().count(),
            content: body,
        })
        .collect()
}

fn is_h1(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with('#') && !trimmed.starts_with("##")
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = "https://example.com/llms-full.txt";

    #[test]
    fn slug_normalises_headings() {
        assert_eq!(create_section_slug("# Core Concepts"), "core-concepts");
        assert_eq!(create_section_slug("# Getting Started!"), "getting-started");
        assert_eq!(create_section_slug("# API Reference (v2)"), "api-reference-v2");
        assert_eq!(create_section_slug("#   Spaces   "), "spaces");
    }

    #[test]
    fn section_urls_carry_order_and_slug() {
        assert_eq!(
            create_section_url(BASE, "# Core Concepts", 0),
            "https://example.com/llms-full.txt#section-0-core-concepts"
        );
        assert_eq!(
            create_section_url(BASE, "# Getting Started", 1),
            "https://example.com/llms-full.txt#section-1-getting-started"
        );
    }

    #[test]
    fn parses_multiple_sections_in_order() {
        let content = "# Core Concepts\n\nAlpha text.\n\n# Getting Started\n\nBeta text.\n";
        let sections = parse_llms_full_sections(content, BASE);

        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].section_title, "# Core Concepts");
        assert_eq!(sections[0].section_order, 0);
        assert_eq!(
            sections[0].url,
            "https://example.com/llms-full.txt#section-0-core-concepts"
        );
        assert!(sections[0].content.contains("Alpha text."));
        assert_eq!(sections[1].section_title, "# Getting Started");
        assert_eq!(
            sections[1].url,
            "https://example.com/llms-full.txt#section-1-getting-started"
        );
        assert!(sections[1].content.contains("Beta text."));
    }

    #[test]
    fn nested_headings_stay_inside_their_section() {
        let content = "# Guide\n\nIntro.\n\n## Install\n\nSteps.\n";
        let sections = parse_llms_full_sections(content, BASE);
        assert_eq!(sections.len(), 1);
        assert!(sections[0].content.contains("## Install"));
    }

    #[test]
    fn hash_lines_inside_fences_do_not_split() {
        let content = "# Shell\n\n```bash\n# a comment, not a heading\necho hi\n```\n";
        let sections = parse_llms_full_sections(content, BASE);
        assert_eq!(sections.len(), 1);
        assert!(sections[0].content.contains("# a comment, not a heading"));
    }

    #[test]
    fn no_h1_falls_back_to_full_document() {
        let content = "Just prose.\n\nMore prose.";
        let sections = parse_llms_full_sections(content, BASE);
        assert_eq!(sections.len(), 1);
        assert_eq!(sections[0].section_title, "Full Document");
        assert_eq!(sections[0].url, BASE);
        assert_eq!(sections[0].section_order, 0);
        assert!(sections[0].word_count > 0);
    }

    #[test]
    fn empty_sections_are_dropped_and_orders_stay_dense() {
        let content = "# Empty\n# Real\n\nBody text.\n";
        let sections = parse_llms_full_sections(content, BASE);
        assert_eq!(sections.len(), 1);
        assert_eq!(sections[0].section_title, "# Real");
        assert_eq!(sections[0].section_order, 0);
    }

    #[test]
    fn reparse_yields_identical_records() {
        let content = "# One\n\nFirst.\n\n# Two\n\nSecond.\n";
        let first = parse_llms_full_sections(content, BASE);
        let second = parse_llms_full_sections(content, BASE);
        assert_eq!(first, second);
    }
}
