//! Cross-backend vocabulary reconciliation: reasoning-effort levels today,
//! a natural home for model-alias reconciliation if future backends need it.

/// Normalizes a reasoning-effort value expressed in codex's vocabulary
/// (`minimal, low, medium, high, xhigh`) into claude's (`low, medium, high,
/// max`) for use as `CLAUDE_CODE_EFFORT_LEVEL`. Values already in claude's
/// vocabulary pass through unchanged (idempotent on the target vocabulary).
pub fn normalize_effort_for_claude(effort: &str) -> String {
    match effort {
        "minimal" => "low".to_string(),
        "xhigh" => "max".to_string(),
        other => other.to_string(),
    }
}

/// Resolves the effort level to use for one invocation following the
/// priority chain: explicit per-call override > per-phase config override >
/// config default > phase-based backend default > empty.
pub fn resolve_effort<'a>(
    call_override: Option<&'a str>,
    phase_override: Option<&'a str>,
    config_default: Option<&'a str>,
    phase_default: Option<&'a str>,
) -> &'a str {
    call_override
        .or(phase_override)
        .or(config_default)
        .or(phase_default)
        .unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_maps_to_low_and_xhigh_maps_to_max() {
        assert_eq!(normalize_effort_for_claude("minimal"), "low");
        assert_eq!(normalize_effort_for_claude("xhigh"), "max");
    }

    #[test]
    fn identity_for_shared_vocabulary() {
        for level in ["low", "medium", "high", "max"] {
            assert_eq!(normalize_effort_for_claude(level), level);
        }
    }

    #[test]
    fn normalization_is_idempotent_on_the_target_vocabulary() {
        for level in ["low", "medium", "high", "max"] {
            let once = normalize_effort_for_claude(level);
            let twice = normalize_effort_for_claude(&once);
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn priority_chain_prefers_call_override_first() {
        assert_eq!(
            resolve_effort(Some("high"), Some("low"), Some("medium"), Some("xhigh")),
            "high"
        );
        assert_eq!(
            resolve_effort(None, Some("low"), Some("medium"), Some("xhigh")),
            "low"
        );
        assert_eq!(resolve_effort(None, None, Some("medium"), Some("xhigh")), "medium");
        assert_eq!(resolve_effort(None, None, None, Some("xhigh")), "xhigh");
        assert_eq!(resolve_effort(None, None, None, None), "");
    }
}
