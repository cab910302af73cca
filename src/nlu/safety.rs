use crate::config::SafetyRules;
use crate::models::chat::{ ClassificationResult, SafetyVerdict, Severity };

/// Derives the safety verdict for `text`.
///
/// A direct crisis pattern always flags; urgency markers raise it to high.
/// Crisis-adjacent vocabulary flags only together with a strongly negative
/// sentiment score.
pub fn safety_check(
    text: &str,
    classification: &ClassificationResult,
    rules: &SafetyRules
) -> SafetyVerdict {
    let normalized = text.trim().to_lowercase();

    if rules.matches_crisis_pattern(&normalized) {
        let severity = if rules.urgency_markers.matches(&normalized) {
            Severity::High
        } else {
            Severity::Medium
        };
        return SafetyVerdict::flagged(severity);
    }

    if
        rules.crisis_vocabulary.matches(&normalized) &&
        classification.compound() < rules.negative_sentiment_threshold
    {
        return SafetyVerdict::flagged(Severity::Medium);
    }

    SafetyVerdict::clear()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::chat::Sentiment;
    use crate::nlu::LexiconClassifier;
    use std::sync::Arc;

    fn verdict(text: &str) -> SafetyVerdict {
        let rules = Arc::new(SafetyRules::default());
        let classification = LexiconClassifier::new(rules.clone()).analyze(text);
        safety_check(text, &classification, &rules)
    }

    #[test]
    fn crisis_without_urgency_is_medium() {
        assert_eq!(verdict("I want to kill myself"), SafetyVerdict::flagged(Severity::Medium));
    }

    #[test]
    fn crisis_with_urgency_is_high() {
        assert_eq!(
            verdict("I want to kill myself tonight"),
            SafetyVerdict::flagged(Severity::High)
        );
        assert_eq!(
            verdict("I have a plan to end my life"),
            SafetyVerdict::flagged(Severity::High)
        );
    }

    #[test]
    fn greeting_is_clear() {
        assert_eq!(verdict("Hi, hello!"), SafetyVerdict::clear());
    }

    #[test]
    fn crisis_vocabulary_needs_negative_sentiment() {
        assert_eq!(verdict("I feel like I could die, so sad and hopeless"), SafetyVerdict::flagged(Severity::Medium));
        assert_eq!(verdict("this diet will make me die laughing"), SafetyVerdict::clear());
    }

    #[test]
    fn threshold_comes_from_rules() {
        let mut file = crate::config::SafetyRulesFile::default();
        file.negative_sentiment_threshold = -0.9;
        let rules = SafetyRules::compile(file).unwrap();
        let classification = ClassificationResult {
            sentiment: Some(Sentiment { neg: 2.0, pos: 1.0, compound: -0.33 }),
            ..ClassificationResult::neutral()
        };
        let v = safety_check("I could die", &classification, &rules);
        assert!(!v.flagged);
    }

    #[test]
    fn neutral_classification_still_catches_patterns() {
        let rules = SafetyRules::default();
        let v = safety_check("I'm going to kill myself", &ClassificationResult::neutral(), &rules);
        assert_eq!(v, SafetyVerdict::flagged(Severity::High));
    }
}
