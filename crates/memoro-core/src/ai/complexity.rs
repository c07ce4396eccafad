// Complexity estimates: parse a provider's structured reply, falling back to
// a local signal-based heuristic when the reply is not machine-readable.

use crate::types::{ComplexityEstimate, ComplexityLevel};

/// Parse the provider's response content as a ComplexityEstimate; on
/// malformed output, estimate locally from the request content instead.
pub fn parse_or_estimate(response_content: &str, request_content: &str) -> ComplexityEstimate {
    if let Ok(parsed) = serde_json::from_str::<ComplexityEstimate>(response_content) {
        return clamp(parsed);
    }
    estimate_from_content(request_content)
}

fn clamp(mut estimate: ComplexityEstimate) -> ComplexityEstimate {
    estimate.numeric_score = estimate.numeric_score.clamp(0.0, 10.0);
    estimate.confidence = estimate.confidence.clamp(0.0, 1.0);
    estimate
}

/// Heuristic estimate from task content: looks for signals of multi-step
/// work, code, integration, and breadth.
pub fn estimate_from_content(content: &str) -> ComplexityEstimate {
    let text = content.to_lowercase();
    let mut score: f64 = 2.0;
    let mut factors = Vec::new();

    if content.len() > 600 {
        score += 2.0;
        factors.push("long description".to_string());
    }

    let code_signals = [
        "implement", "refactor", "debug", "migrate", "algorithm", "optimize", "architecture",
    ];
    if code_signals.iter().any(|s| text.contains(s)) {
        score += 2.0;
        factors.push("engineering-heavy wording".to_string());
    }

    let integration_signals = ["api", "database", "protocol", "integration", "deploy", "auth"];
    if integration_signals.iter().any(|s| text.contains(s)) {
        score += 1.5;
        factors.push("external integration".to_string());
    }

    let multi_step = ["and then", "first", "second", "steps", "multiple", "several"];
    if multi_step.iter().any(|s| text.contains(s)) {
        score += 1.5;
        factors.push("multi-step plan".to_string());
    }

    let score = score.min(10.0);
    let overall = if score >= 7.0 {
        ComplexityLevel::High
    } else if score >= 4.0 {
        ComplexityLevel::Medium
    } else {
        ComplexityLevel::Low
    };

    ComplexityEstimate {
        overall,
        numeric_score: score,
        factors,
        estimated_hours: score * 0.75,
        // Heuristic output is a coarse fallback
        confidence: 0.4,
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structured_reply_is_parsed_and_clamped() {
        let raw = r#"{
            "overall": "high",
            "numeric_score": 14.0,
            "factors": ["many subsystems"],
            "estimated_hours": 20.0,
            "confidence": 1.4
        }"#;
        let estimate = parse_or_estimate(raw, "irrelevant");
        assert_eq!(estimate.overall, ComplexityLevel::High);
        assert_eq!(estimate.numeric_score, 10.0);
        assert_eq!(estimate.confidence, 1.0);
        assert_eq!(estimate.factors, vec!["many subsystems".to_string()]);
    }

    #[test]
    fn garbage_reply_falls_back_to_heuristic() {
        let estimate = parse_or_estimate("not json at all", "fix typo in readme");
        assert_eq!(estimate.overall, ComplexityLevel::Low);
        assert!(estimate.confidence < 0.5);
    }

    #[test]
    fn heuristic_scales_with_signals() {
        let trivial = estimate_from_content("fix typo");
        let heavy = estimate_from_content(
            "First, refactor the auth database integration. Second, implement the new \
             protocol and then migrate multiple services behind the api gateway.",
        );
        assert!(heavy.numeric_score > trivial.numeric_score);
        assert!(heavy.factors.len() >= 2);
        assert_eq!(trivial.overall, ComplexityLevel::Low);
    }
}
