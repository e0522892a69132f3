//! Best-effort extractors over provider response text.
//!
//! These parsers work around a stable core of explicit markers (section
//! headers, bullet prefixes, fenced blocks) and tolerate absence: a section
//! that cannot be found yields an empty value rather than an error.

use regex::Regex;
use std::collections::BTreeMap;
use std::sync::LazyLock;

use super::types::Recommendation;

const MIN_ITEM_LEN: usize = 10;
const MAX_ACTIONABLE_ITEMS: usize = 10;

static BULLET_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(?:[-*•]|\d+[.):])\s+(.+)$").expect("valid regex"));

static FENCED_TEMPLATE_RE: LazyLock<Regex> = LazyLock::new(|| {
    // `template_id:` (optionally bolded) followed by a fenced block
    Regex::new(r"(?s)\*{0,2}([a-z][a-z0-9_]*)\*{0,2}\s*:\s*\n```[a-z]*\n(.*?)```")
        .expect("valid regex")
});

static ANY_FENCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```[a-z]*\n(.*?)```").expect("valid regex"));

/// Extract the text between two literal section markers. The end marker is
/// optional; when absent the section runs to the end of the content.
pub fn extract_section(content: &str, start_marker: &str, end_marker: Option<&str>) -> String {
    let Some(start_idx) = content.find(start_marker) else {
        return String::new();
    };
    let after_start = start_idx + start_marker.len();

    match end_marker.and_then(|m| content[after_start..].find(m)) {
        Some(end_offset) => content[after_start..after_start + end_offset].trim().to_string(),
        None => content[after_start..].trim().to_string(),
    }
}

/// Extract up to ten bulleted or numbered items of meaningful length.
pub fn extract_actionable_items(text: &str) -> Vec<String> {
    let mut items = Vec::new();
    for line in text.lines() {
        if let Some(caps) = BULLET_RE.captures(line) {
            let item = caps[1].trim().to_string();
            if item.len() > MIN_ITEM_LEN {
                items.push(item);
            }
        }
        if items.len() >= MAX_ACTIONABLE_ITEMS {
            break;
        }
    }
    items
}

/// Parsed improvement buckets from one provider response.
#[derive(Debug, Default)]
pub struct ParsedImprovements {
    pub prompts: BTreeMap<String, String>,
    pub validation_rules: Vec<String>,
    pub complexity_adjustments: BTreeMap<String, String>,
    pub context_additions: Vec<String>,
}

/// Heuristically populate the four improvement buckets from response text.
pub fn parse_improvements(content: &str) -> ParsedImprovements {
    let mut parsed = ParsedImprovements::default();

    // Prompt improvements: explicit `template_id:` fenced blocks first,
    // falling back to the first fenced block in a prompt-flavored response.
    for caps in FENCED_TEMPLATE_RE.captures_iter(content) {
        parsed
            .prompts
            .insert(caps[1].to_string(), caps[2].trim().to_string());
    }
    if parsed.prompts.is_empty() && content.to_lowercase().contains("prompt") {
        if let Some(caps) = ANY_FENCE_RE.captures(content) {
            parsed
                .prompts
                .insert("issue_analysis".to_string(), caps[1].trim().to_string());
        }
    }

    parsed.validation_rules = items_in_section(content, &["validation", "check"]);
    parsed.context_additions = items_in_section(content, &["context", "example"]);

    let lower = content.to_lowercase();
    if lower.contains("complexity") {
        for line in content.lines() {
            let line_lower = line.to_lowercase();
            if line_lower.contains("complexity")
                && (line_lower.contains("increase")
                    || line_lower.contains("decrease")
                    || line_lower.contains("adjust"))
            {
                parsed
                    .complexity_adjustments
                    .insert("adjustment".to_string(), line.trim().to_string());
                break;
            }
        }
    }

    parsed
}

/// Bulleted items under lines containing one of the section keywords.
fn items_in_section(content: &str, keywords: &[&str]) -> Vec<String> {
    let mut items = Vec::new();
    let mut in_section = false;

    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let lower = trimmed.to_lowercase();
        let is_header = !BULLET_RE.is_match(line)
            && (trimmed.starts_with('#')
                || trimmed.starts_with("**")
                || trimmed.ends_with(':')
                || lower
                    .split_whitespace()
                    .next()
                    .map(|w| w.chars().next().is_some_and(|c| c.is_numeric()))
                    .unwrap_or(false));

        if is_header {
            in_section = keywords.iter().any(|k| lower.contains(k));
            continue;
        }

        if in_section {
            if let Some(caps) = BULLET_RE.captures(line) {
                let item = caps[1].trim().to_string();
                if item.len() > MIN_ITEM_LEN && !items.contains(&item) {
                    items.push(item);
                }
            }
        }
    }

    items
}

/// Side effect mentions in validation output.
pub fn extract_side_effects(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| {
            let lower = line.to_lowercase();
            lower.contains("side effect") || lower.contains("unintended")
        })
        .map(|line| line.trim_start_matches(['-', '*', '•', ' ']).to_string())
        .filter(|line| !line.is_empty())
        .collect()
}

/// Recommendation keyword, matched keep → refine → revert; defaults keep.
pub fn extract_recommendation(content: &str) -> Recommendation {
    let lower = content.to_lowercase();
    if lower.contains("keep") || lower.contains("maintain") {
        Recommendation::Keep
    } else if lower.contains("refine") || lower.contains("adjust") {
        Recommendation::Refine
    } else if lower.contains("revert") {
        Recommendation::Revert
    } else {
        Recommendation::Keep
    }
}

/// Confidence from provider agreement: more independent perspectives give a
/// higher baseline.
pub fn consensus_confidence(provider_count: usize) -> f64 {
    match provider_count {
        n if n >= 4 => 0.9,
        3 => 0.8,
        2 => 0.7,
        _ => 0.6,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const DIALECTICAL: &str = "\
Some preamble.

THESIS
The system retried blindly on timeouts.

ANTITHESIS
No backpressure signal existed, so retries amplified load.

SYNTHESIS
Prevent by:
- Add a circuit breaker around provider calls with sane thresholds
- short
1. Cap retries at two attempts with exponential backoff delays
2) Record every retry in the operations ledger for analysis
";

    #[test]
    fn test_extract_sections_in_order() {
        let thesis = extract_section(DIALECTICAL, "THESIS", Some("ANTITHESIS"));
        assert_eq!(thesis, "The system retried blindly on timeouts.");

        let antithesis = extract_section(DIALECTICAL, "ANTITHESIS", Some("SYNTHESIS"));
        assert!(antithesis.contains("backpressure"));

        let synthesis = extract_section(DIALECTICAL, "SYNTHESIS", None);
        assert!(synthesis.contains("circuit breaker"));
    }

    #[test]
    fn test_missing_section_is_empty() {
        assert_eq!(extract_section("no markers here", "THESIS", None), "");
    }

    #[test]
    fn test_actionable_items_filters_short_lines() {
        let synthesis = extract_section(DIALECTICAL, "SYNTHESIS", None);
        let items = extract_actionable_items(&synthesis);
        assert_eq!(items.len(), 3);
        assert!(items[0].contains("circuit breaker"));
        // "short" is below the length floor
        assert!(!items.iter().any(|i| i == "short"));
    }

    #[test]
    fn test_actionable_items_capped_at_ten() {
        let many: String = (0..20)
            .map(|i| format!("- actionable item number {i} with plenty of detail\n"))
            .collect();
        assert_eq!(extract_actionable_items(&many).len(), 10);
    }

    #[test]
    fn test_parse_improvements_explicit_template() {
        let content = "\
Here is an improved prompt.

**issue_analysis**:
```
Analyze the issue carefully.
Check for timeouts.
```

## Validation checks
- Reject responses that omit a complexity estimate entirely
- Verify the issue number is echoed back in the result

## Context additions
- Include two examples of previously successful analyses
";
        let parsed = parse_improvements(content);
        assert_eq!(
            parsed.prompts.get("issue_analysis").map(String::as_str),
            Some("Analyze the issue carefully.\nCheck for timeouts.")
        );
        assert_eq!(parsed.validation_rules.len(), 2);
        assert_eq!(parsed.context_additions.len(), 1);
    }

    #[test]
    fn test_parse_improvements_fallback_fence() {
        let content = "Suggested prompt change:\n```\nNew template body here\n```";
        let parsed = parse_improvements(content);
        assert_eq!(
            parsed.prompts.get("issue_analysis").map(String::as_str),
            Some("New template body here")
        );
    }

    #[test]
    fn test_parse_complexity_adjustment() {
        let content = "3. Complexity: increase scrutiny for multi-file changes";
        let parsed = parse_improvements(content);
        assert!(parsed.complexity_adjustments.contains_key("adjustment"));
    }

    #[test]
    fn test_extract_recommendation_order() {
        assert_eq!(
            extract_recommendation("We should keep these improvements"),
            Recommendation::Keep
        );
        assert_eq!(
            extract_recommendation("The changes need to be refined further"),
            Recommendation::Refine
        );
        assert_eq!(
            extract_recommendation("These caused regressions: revert"),
            Recommendation::Revert
        );
        // keep wins when both are mentioned, per the stated match order
        assert_eq!(
            extract_recommendation("Either keep or revert depending on appetite"),
            Recommendation::Keep
        );
        assert_eq!(extract_recommendation("no verdict"), Recommendation::Keep);
    }

    #[test]
    fn test_extract_side_effects() {
        let content = "\
Observations:
- Side effect: longer prompt increases token spend
- unrelated line
Some unintended slowdown was measured in CI.
";
        let effects = extract_side_effects(content);
        assert_eq!(effects.len(), 2);
    }

    #[test]
    fn test_consensus_confidence_bands() {
        assert_eq!(consensus_confidence(5), 0.9);
        assert_eq!(consensus_confidence(4), 0.9);
        assert_eq!(consensus_confidence(3), 0.8);
        assert_eq!(consensus_confidence(2), 0.7);
        assert_eq!(consensus_confidence(1), 0.6);
        assert_eq!(consensus_confidence(0), 0.6);
    }
}
