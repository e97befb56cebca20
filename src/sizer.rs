//! Output shaping for downstream budgets.
//!
//! Large worker outputs are never silently dropped. Three bands:
//!
//! - At or under the soft budgets (characters and estimated tokens), the
//!   output passes through untouched.
//! - Over soft but at or under the hard character ceiling, the full
//!   output is persisted under a per-call path and the caller gets the
//!   raw text mid-truncated to the digest target, headed by a notice
//!   naming both artifacts.
//! - Over the hard ceiling, plain trimming would bury whatever matters,
//!   so the caller instead gets a structured digest: key sections pulled
//!   out by header matching under proportional shares, plus a bounded
//!   tail.
//!
//! In both truncated bands a second, larger digest sized to a downstream
//! reader's token budget is written next to the full artifact, and the
//! returned text always names the full artifact's path.

use crate::types::{estimate_tokens, truncate_middle};
use crate::{Error, Result};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

/// Character and token budgets applied when shaping output.
#[derive(Debug, Clone)]
pub struct SizerBudgets {
    /// Output at or under this many characters passes through untouched.
    pub soft_chars: usize,
    /// Output at or under this many estimated tokens passes through untouched.
    pub soft_tokens: u64,
    /// Ceiling above which the digest switches from plain trimming to
    /// section extraction.
    pub hard_chars: usize,
    /// Upper bound on the digest handed back to the caller.
    pub summary_target_chars: usize,
    /// Token budget of the downstream read tool; sizes the on-disk digest.
    pub read_tool_tokens: u64,
    /// Character-per-token assumption used for estimates.
    pub chars_per_token: usize,
    /// How many trailing lines the structured digest keeps.
    pub tail_lines: usize,
}

impl Default for SizerBudgets {
    fn default() -> Self {
        Self {
            soft_chars: 8_000,
            soft_tokens: 2_000,
            hard_chars: 16_000,
            summary_target_chars: 6_000,
            read_tool_tokens: 25_000,
            chars_per_token: 4,
            tail_lines: 40,
        }
    }
}

/// Result of shaping one output.
#[derive(Debug, Clone)]
pub struct ShapedOutput {
    /// What the caller receives: the raw output when it fit, otherwise the digest.
    pub text: String,
    /// Path of the untruncated artifact, present only when truncation occurred.
    pub full_path: Option<PathBuf>,
    /// Path of the reader-budget digest, present only when truncation occurred.
    pub summary_path: Option<PathBuf>,
    pub truncated: bool,
}

static SECTION_PATTERNS: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    vec![
        (
            "Summary",
            Regex::new(r"(?mi)^#{1,6}\s*(summary|overview)\b.*$").unwrap(),
        ),
        (
            "Recommendations",
            Regex::new(r"(?mi)^#{1,6}\s*(recommendations?|suggestions?)\b.*$").unwrap(),
        ),
        (
            "Errors",
            Regex::new(r"(?mi)^#{1,6}\s*(errors?|issues?|problems?)\b.*$").unwrap(),
        ),
        (
            "Files changed",
            Regex::new(r"(?mi)^#{1,6}\s*(files?\s+(changed|modified)|changes)\b.*$").unwrap(),
        ),
    ]
});

static ANY_HEADER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^#{1,6}\s").unwrap());

/// Proportional share of the digest budget per section, in the priority
/// order of `SECTION_PATTERNS`. The remainder goes to files-changed.
const SECTION_SHARES: [f64; 4] = [0.40, 0.30, 0.20, 0.10];

/// Shape one output against the budgets.
///
/// Under-budget output is returned unchanged with no artifacts. Anything
/// larger is persisted in full to `<dir>/<call_id>-full.txt` and digested
/// to `<dir>/<call_id>-summary.txt` sized for the read tool; the caller
/// receives a trimmed or structured digest depending on whether the hard
/// ceiling was crossed.
pub async fn shape_output(
    raw: &str,
    call_id: &str,
    dir: &Path,
    budgets: &SizerBudgets,
) -> Result<ShapedOutput> {
    if raw.len() <= budgets.soft_chars && estimate_tokens(raw) <= budgets.soft_tokens {
        return Ok(ShapedOutput {
            text: raw.to_string(),
            full_path: None,
            summary_path: None,
            truncated: false,
        });
    }

    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| Error::filesystem(dir.display().to_string(), e.to_string()))?;

    let full_path = dir.join(format!("{}-full.txt", call_id));
    tokio::fs::write(&full_path, raw)
        .await
        .map_err(|e| Error::filesystem(full_path.display().to_string(), e.to_string()))?;

    let reader_digest = truncate_middle(
        raw,
        (budgets.read_tool_tokens as usize).saturating_mul(budgets.chars_per_token),
    );
    let summary_path = dir.join(format!("{}-summary.txt", call_id));
    tokio::fs::write(&summary_path, &reader_digest)
        .await
        .map_err(|e| Error::filesystem(summary_path.display().to_string(), e.to_string()))?;

    let text = if raw.len() <= budgets.hard_chars {
        build_trimmed(raw, &full_path, &summary_path, budgets)
    } else {
        build_digest(raw, &full_path, &summary_path, budgets)
    };

    Ok(ShapedOutput {
        text,
        full_path: Some(full_path),
        summary_path: Some(summary_path),
        truncated: true,
    })
}

fn notice_header(
    raw_len: usize,
    budget_chars: usize,
    full_path: &Path,
    summary_path: &Path,
) -> String {
    format!(
        "[output truncated: {} chars exceeded the {}-char budget]\n\
         Full output saved to: {}\n\
         Readable summary file: {}\n",
        raw_len,
        budget_chars,
        full_path.display(),
        summary_path.display(),
    )
}

/// Between the soft and hard budgets: the raw text, mid-truncated to fit
/// the digest target under the notice header.
fn build_trimmed(
    raw: &str,
    full_path: &Path,
    summary_path: &Path,
    budgets: &SizerBudgets,
) -> String {
    let mut text = notice_header(raw.len(), budgets.soft_chars, full_path, summary_path);
    // Reserve one character for the trailing newline.
    let body_budget = budgets
        .summary_target_chars
        .saturating_sub(text.len() + 1);
    text.push_str(truncate_middle(raw, body_budget).trim_end());
    text.push('\n');
    text
}

/// Over the hard ceiling: key sections in priority order, then a bounded
/// tail of the output.
fn build_digest(
    raw: &str,
    full_path: &Path,
    summary_path: &Path,
    budgets: &SizerBudgets,
) -> String {
    let mut digest = notice_header(raw.len(), budgets.hard_chars, full_path, summary_path);

    let header_len = digest.len();
    let body_budget = budgets.summary_target_chars.saturating_sub(header_len);

    let mut used = 0usize;
    for ((title, pattern), share) in SECTION_PATTERNS.iter().zip(SECTION_SHARES) {
        let section_budget = (body_budget as f64 * share) as usize;
        if section_budget == 0 || used >= body_budget {
            break;
        }
        if let Some(section) = extract_section(raw, pattern) {
            let clipped = truncate_middle(&section, section_budget.min(body_budget - used));
            digest.push_str(&format!("\n## {}\n{}\n", title, clipped.trim_end()));
            used += clipped.len();
        }
    }

    let tail: Vec<&str> = raw
        .lines()
        .rev()
        .take(budgets.tail_lines)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    let tail_budget = body_budget.saturating_sub(used);
    if tail_budget > 0 && !tail.is_empty() {
        let tail_text = truncate_middle(&tail.join("\n"), tail_budget);
        digest.push_str(&format!(
            "\n## Tail (last {} lines)\n{}\n",
            tail.len(),
            tail_text.trim_end()
        ));
    }

    if digest.len() > budgets.summary_target_chars {
        digest = truncate_middle(&digest, budgets.summary_target_chars);
    }
    digest
}

/// Pull out the text between a matching section header and the next
/// header (or end of input).
fn extract_section(raw: &str, pattern: &Regex) -> Option<String> {
    let m = pattern.find(raw)?;
    let body_start = m.end();
    let rest = &raw[body_start..];
    let body_end = ANY_HEADER
        .find(rest)
        .map(|next| body_start + next.start())
        .unwrap_or(raw.len());
    let body = raw[body_start..body_end].trim();
    if body.is_empty() {
        None
    } else {
        Some(body.to_string())
    }
}
