//! Importance scoring (§4.5): a cheap lexicon-based heuristic used to score
//! episodes that arrive without an explicit importance value.

const HIGH_INDICATORS: &[&str] = &[
    "error",
    "exception",
    "failed",
    "failure",
    "critical",
    "security",
    "vulnerability",
    "breach",
    "exploit",
    "decision:",
    "decided to",
    "choosing",
    "architectural",
    "breaking change",
    "deprecated",
    "removed",
    "user preference",
    "configuration",
    "setting",
    "bug",
    "fix",
    "patch",
    "workaround",
    "performance issue",
    "bottleneck",
    "optimization",
];

const LOW_INDICATORS: &[&str] = &[
    "debug:",
    "trace:",
    "verbose:",
    "status: ok",
    "success",
    "completed normally",
    "starting",
    "initialized",
    "loading",
    "info:",
    "running",
    "processing",
];

/// Score `content` in `[0, 1]` per §4.5's keyword-lexicon rule.
#[must_use]
pub fn score_importance(content: &str) -> f64 {
    let lowered = content.to_lowercase();
    let high = HIGH_INDICATORS.iter().filter(|w| lowered.contains(*w)).count().min(3);
    let low = LOW_INDICATORS.iter().filter(|w| lowered.contains(*w)).count().min(3);

    let mut base = if high > 0 {
        (0.7 + 0.1 * high as f64).min(1.0)
    } else if low > 0 {
        (0.3 - 0.1 * low as f64).max(0.0)
    } else {
        0.5
    };

    let len = content.chars().count();
    if len < 50 || len > 500 {
        base = (base + 0.1).min(1.0);
    }

    base.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_message_scores_high() {
        let score = score_importance("Error: null pointer in auth module");
        assert!(score >= 0.8, "expected >= 0.8, got {score}");
    }

    #[test]
    fn debug_message_scores_low() {
        let score = score_importance("debug: loaded config");
        assert!(score <= 0.3, "expected <= 0.3, got {score}");
    }

    #[test]
    fn short_neutral_message_gets_length_bonus() {
        // "Started." is 8 characters: base 0.5 (no indicators) + 0.1 length bonus.
        let score = score_importance("Started.");
        assert!((score - 0.6).abs() < 1e-9, "expected 0.6, got {score}");
    }

    #[test]
    fn indicator_counts_are_capped_at_three() {
        let many_errors = "error error error error error error";
        let few_errors = "error error error";
        assert_eq!(score_importance(many_errors), score_importance(few_errors));
    }
}
