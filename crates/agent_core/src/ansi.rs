use once_cell::sync::Lazy;
use regex::Regex;

static ANSI_CSI_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new("\u{1b}\\[[0-9;]*[A-Za-z]").expect("static regex is valid")
});

/// Strips ANSI CSI escape sequences (`ESC [ ... letter`) from backend
/// output. Idempotent: running it twice yields the same string as once.
pub fn strip_ansi(text: &str) -> String {
    ANSI_CSI_RE.replace_all(text, "").into_owned()
}

const COPILOT_STATS_PREFIXES: &[&str] = &[
    "Total usage",
    "Total duration",
    "Total code changes",
    "Usage by model",
];

/// Copilot-specific cleanup: trims whitespace and drops trailing stats
/// lines the CLI appends after the actual response.
pub fn strip_copilot_stats(text: &str) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let mut cut = lines.len();
    for (index, line) in lines.iter().enumerate() {
        let trimmed = line.trim_start();
        if COPILOT_STATS_PREFIXES.iter().any(|prefix| trimmed.starts_with(prefix)) {
            cut = index;
            break;
        }
    }
    lines[..cut].join("\n").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_color_codes() {
        let colored = "\u{1b}[31mred\u{1b}[0m plain";
        assert_eq!(strip_ansi(colored), "red plain");
    }

    #[test]
    fn stripping_is_idempotent() {
        let colored = "\u{1b}[1;32mgreen\u{1b}[0m";
        let once = strip_ansi(colored);
        let twice = strip_ansi(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn copilot_stats_lines_are_dropped() {
        let text = "The answer is 42.\n\nTotal usage: 120 tokens\nTotal duration: 3s\n";
        assert_eq!(strip_copilot_stats(text), "The answer is 42.");
    }
}
