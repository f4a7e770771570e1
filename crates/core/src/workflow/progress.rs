//! Best-effort summary of an interrupted agent run.
//!
//! The partial output is scanned line by line for completion markers
//! (`✅`, `✓`, `[x]`, `Done:`, `Completed:`), pending markers (`[ ]`,
//! `TODO`, `Next:`, `Remaining:`) and a "Files modified" section.

use std::collections::BTreeSet;

/// What a partial output says about the work so far.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgressSummary {
    pub completed: Vec<String>,
    pub pending: Vec<String>,
    pub modified_files: BTreeSet<String>,
}

impl ProgressSummary {
    pub fn is_empty(&self) -> bool {
        self.completed.is_empty() && self.pending.is_empty() && self.modified_files.is_empty()
    }

    pub fn what_was_done(&self) -> String {
        if self.completed.is_empty() {
            return "No completed steps were reported before the pause.".to_string();
        }
        bullets(&self.completed)
    }

    pub fn what_remains(&self, phase: &str) -> String {
        if self.pending.is_empty() {
            return format!("Finish the remaining work of the '{phase}' phase.");
        }
        bullets(&self.pending)
    }
}

fn bullets(items: &[String]) -> String {
    items
        .iter()
        .map(|item| format!("- {item}"))
        .collect::<Vec<_>>()
        .join("\n")
}

const DONE_PREFIXES: [&str; 6] = ["✅", "✓", "[x]", "[X]", "Done:", "Completed:"];
const PENDING_PREFIXES: [&str; 5] = ["[ ]", "TODO:", "TODO", "Next:", "Remaining:"];
const FILES_HEADINGS: [&str; 3] = ["files modified", "files changed", "files touched"];

/// Scan partial agent output for progress markers.
pub fn summarize_progress(text: &str) -> ProgressSummary {
    let mut summary = ProgressSummary::default();
    let mut in_files_section = false;

    for raw in text.lines() {
        let line = strip_list_marker(raw.trim());
        if line.is_empty() {
            in_files_section = false;
            continue;
        }

        if let Some(rest) = files_heading(line) {
            in_files_section = rest.is_empty();
            for file in rest.split(',').map(clean_file).filter(|f| !f.is_empty()) {
                summary.modified_files.insert(file);
            }
            continue;
        }

        if in_files_section {
            if is_list_item(raw.trim()) {
                let file = clean_file(line);
                if !file.is_empty() {
                    summary.modified_files.insert(file);
                }
                continue;
            }
            in_files_section = false;
        }

        if let Some(item) = strip_any(line, &DONE_PREFIXES) {
            summary.completed.push(item);
        } else if let Some(item) = strip_any(line, &PENDING_PREFIXES) {
            summary.pending.push(item);
        }
    }

    summary
}

const LIST_MARKERS: [&str; 3] = ["- ", "* ", "+ "];

fn is_list_item(line: &str) -> bool {
    LIST_MARKERS.iter().any(|m| line.starts_with(m))
}

fn strip_list_marker(line: &str) -> &str {
    LIST_MARKERS
        .iter()
        .find_map(|m| line.strip_prefix(m))
        .map_or(line, str::trim_start)
}

/// Text after a "Files modified:" style heading, if `line` is one.
fn files_heading(line: &str) -> Option<&str> {
    let unmarked = line.trim_start_matches('#').trim_start().trim_matches('*');
    let lower = unmarked.to_lowercase();
    let heading = FILES_HEADINGS.iter().find(|h| lower.starts_with(*h))?;
    let rest = unmarked.get(heading.len()..)?;
    Some(rest.trim_start_matches([':', '*']).trim())
}

fn clean_file(item: &str) -> String {
    item.trim()
        .trim_matches(|c| c == '`' || c == '*')
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .trim_end_matches([',', ':'])
        .to_string()
}

fn strip_any(line: &str, prefixes: &[&str]) -> Option<String> {
    prefixes.iter().find_map(|prefix| {
        line.strip_prefix(prefix)
            .map(|rest| rest.trim().to_string())
            .filter(|rest| !rest.is_empty())
    })
}

/// The last `max_chars` characters of `text`.
pub fn tail_slice(text: &str, max_chars: usize) -> &str {
    let count = text.chars().count();
    if count <= max_chars {
        return text;
    }
    let skip = count - max_chars;
    match text.char_indices().nth(skip) {
        Some((offset, _)) => &text[offset..],
        None => "",
    }
}

/// Prompt prepended to the first agent run after a resume.
pub fn build_continuation_prompt(
    phase: &str,
    summary: &ProgressSummary,
    modified_files: &BTreeSet<String>,
    previous_output: &str,
) -> String {
    let mut prompt = format!(
        "## Resuming paused work\n\n\
         You are continuing the '{phase}' phase, which was paused before it finished.\n\n\
         ### What was done\n{}\n",
        summary.what_was_done()
    );

    let files: BTreeSet<&String> = modified_files.iter().chain(&summary.modified_files).collect();
    if !files.is_empty() {
        prompt.push_str("\n### Files touched\n");
        for file in files {
            prompt.push_str(&format!("- {file}\n"));
        }
    }

    prompt.push_str(&format!("\n### What remains\n{}\n", summary.what_remains(phase)));

    let tail = previous_output.trim();
    if !tail.is_empty() {
        prompt.push_str(&format!("\n### Previous output (tail)\n```\n{tail}\n```\n"));
    }

    prompt.push_str("\nDo not redo completed work. Continue from where it stopped.\n");
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_markers_and_file_section() {
        let text = "Working on it.\n\
                    ✅ Added the parser\n\
                    - [x] Wired the CLI flag\n\
                    - [ ] Write tests\n\
                    Next: update the docs\n\
                    \n\
                    Files modified:\n\
                    - `src/parser.rs`\n\
                    - src/main.rs (new flag)\n\
                    \n\
                    TODO: release notes\n";

        let summary = summarize_progress(text);
        assert_eq!(summary.completed, vec!["Added the parser", "Wired the CLI flag"]);
        assert_eq!(
            summary.pending,
            vec!["Write tests", "update the docs", "release notes"]
        );
        assert_eq!(
            summary.modified_files.iter().collect::<Vec<_>>(),
            vec!["src/main.rs", "src/parser.rs"]
        );
    }

    #[test]
    fn test_inline_file_list() {
        let summary = summarize_progress("**Files changed:** a.rs, b/c.rs");
        assert_eq!(summary.modified_files.len(), 2);
        assert!(summary.modified_files.contains("b/c.rs"));
    }

    #[test]
    fn test_no_markers_uses_defaults() {
        let summary = summarize_progress("I looked around the codebase for a while.");
        assert!(summary.is_empty());
        assert_eq!(
            summary.what_was_done(),
            "No completed steps were reported before the pause."
        );
        assert_eq!(
            summary.what_remains("implement"),
            "Finish the remaining work of the 'implement' phase."
        );
    }

    #[test]
    fn test_tail_slice_is_char_safe() {
        assert_eq!(tail_slice("héllo wörld", 5), "wörld");
        assert_eq!(tail_slice("short", 10), "short");
        assert_eq!(tail_slice("abc", 0), "");
    }

    #[test]
    fn test_continuation_prompt_sections() {
        let summary = summarize_progress("Done: schema migration\nRemaining: backfill");
        let files = BTreeSet::from(["db/schema.sql".to_string()]);
        let prompt = build_continuation_prompt("implement", &summary, &files, "last words");

        assert!(prompt.contains("'implement' phase"));
        assert!(prompt.contains("### What was done\n- schema migration"));
        assert!(prompt.contains("### Files touched\n- db/schema.sql"));
        assert!(prompt.contains("### What remains\n- backfill"));
        assert!(prompt.contains("last words"));
    }

    #[test]
    fn test_continuation_prompt_without_output() {
        let prompt =
            build_continuation_prompt("plan", &ProgressSummary::default(), &BTreeSet::new(), "  ");
        assert!(!prompt.contains("Previous output"));
        assert!(!prompt.contains("Files touched"));
    }
}
