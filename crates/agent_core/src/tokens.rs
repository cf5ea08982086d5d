use once_cell::sync::Lazy;
use regex::Regex;

use agent_events::{AgentEvent, AgentEventKind};

use crate::result::MAX_TOKEN_VALUE;

static TOKEN_FIELD_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(prompt|input|completion|output)_tokens\s*[:=]\s*(\d{1,7})\b")
        .expect("static regex is valid")
});

/// Result of scanning backend output for token usage, with any warnings the
/// validation pass produced. Warnings are never promoted to errors.
#[derive(Debug, Clone)]
pub struct TokenExtraction {
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub warnings: Vec<AgentEvent>,
}

/// Scans `combined` (stdout+stderr) for explicit `..._tokens: N` fields,
/// cross-checks the reported output-token count against a length-based
/// estimate derived from `stdout`, applies the in/out heuristic fallback,
/// and caps both values at [`MAX_TOKEN_VALUE`].
pub fn extract_and_validate_tokens(
    agent: &str,
    combined: &str,
    stdout: &str,
    discrepancy_threshold: f64,
) -> TokenExtraction {
    let mut reported_in: Option<u64> = None;
    let mut reported_out: Option<u64> = None;

    for caps in TOKEN_FIELD_RE.captures_iter(combined) {
        let field = caps[1].to_lowercase();
        let Ok(value) = caps[2].parse::<u64>() else {
            continue;
        };
        match field.as_str() {
            "prompt" | "input" => reported_in = Some(value),
            "completion" | "output" => reported_out = Some(value),
            _ => {}
        }
    }

    let mut warnings = Vec::new();
    let estimated = (stdout.len() as f64 / 4.0).round() as u64;

    let mut tokens_out = reported_out.unwrap_or(0);
    if let Some(reported) = reported_out {
        if estimated > 100 {
            let ratio = reported as f64 / estimated as f64;
            let threshold = discrepancy_threshold.max(1.0);
            if ratio < 1.0 / threshold || ratio > threshold {
                warnings.push(AgentEvent::new(
                    AgentEventKind::Progress,
                    agent,
                    format!(
                        "Token discrepancy: reported {reported} vs estimated {estimated}, using estimate"
                    ),
                ));
                tokens_out = estimated;
            }
        }
    }

    let mut tokens_in = match reported_in {
        Some(value) => value,
        None => 0,
    };
    if tokens_in == 0 && tokens_out > 0 {
        tokens_in = tokens_out / 3;
    }

    if tokens_in > MAX_TOKEN_VALUE {
        warnings.push(AgentEvent::new(
            AgentEventKind::Progress,
            agent,
            format!("Capped unrealistic TokensIn {tokens_in} to {MAX_TOKEN_VALUE}"),
        ));
        tokens_in = MAX_TOKEN_VALUE;
    }
    if tokens_out > MAX_TOKEN_VALUE {
        warnings.push(AgentEvent::new(
            AgentEventKind::Progress,
            agent,
            format!("Capped unrealistic TokensOut {tokens_out} to {MAX_TOKEN_VALUE}"),
        ));
        tokens_out = MAX_TOKEN_VALUE;
    }

    TokenExtraction {
        tokens_in,
        tokens_out,
        warnings,
    }
}

/// Cost estimate from per-million-token rates, as published by each adapter.
pub fn estimate_cost(tokens_in: u64, tokens_out: u64, rate_in_per_mtok: f64, rate_out_per_mtok: f64) -> f64 {
    (tokens_in as f64 / 1_000_000.0) * rate_in_per_mtok
        + (tokens_out as f64 / 1_000_000.0) * rate_out_per_mtok
}
