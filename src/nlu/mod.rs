pub mod fallback;
pub mod safety;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::SafetyRules;
use crate::error::CapabilityError;
use crate::models::chat::{ ClassificationResult, HistoryTurn, Intent, Sentiment };

pub use fallback::FallbackGenerator;
pub use safety::safety_check;

const KNOWN_INTENT_CONFIDENCE: f64 = 0.7;

/// Intent and sentiment analysis of one inbound message.
///
/// Implementations must not fail on malformed input; a neutral result is
/// returned instead. `Err` is reserved for the capability itself being
/// unavailable, in which case the pipeline substitutes
/// [`ClassificationResult::neutral`].
#[async_trait]
pub trait SafetyClassifier: Send + Sync {
    async fn classify(
        &self,
        text: &str,
        history: &[HistoryTurn]
    ) -> Result<ClassificationResult, CapabilityError>;
}

/// Local keyword classifier driven by [`SafetyRules`].
#[derive(Clone)]
pub struct LexiconClassifier {
    rules: Arc<SafetyRules>,
}

impl LexiconClassifier {
    pub fn new(rules: Arc<SafetyRules>) -> Self {
        Self { rules }
    }

    pub fn analyze(&self, text: &str) -> ClassificationResult {
        let normalized = text.trim().to_lowercase();
        let rules = &self.rules;

        let (mut pos, mut neg) = (0u32, 0u32);
        for word in normalized.split(|c: char| !(c.is_ascii_lowercase() || c == '\'')) {
            if word.is_empty() {
                continue;
            }
            if rules.negative_words.contains(word) {
                neg += 1;
            }
            if rules.positive_words.contains(word) {
                pos += 1;
            }
        }
        let compound = if pos + neg > 0 {
            (f64::from(pos) - f64::from(neg)) / f64::from(pos + neg)
        } else {
            0.0
        };

        let word_count = normalized.split_whitespace().count();
        let intent = if rules.greetings.matches(&normalized) && word_count <= rules.greeting_max_words {
            Intent::Greeting
        } else if rules.help_phrases.matches(&normalized) {
            Intent::HelpRequest
        } else if rules.thanks_phrases.matches(&normalized) {
            Intent::Thanks
        } else if
            rules.matches_crisis_pattern(&normalized) ||
            rules.crisis_vocabulary.matches(&normalized)
        {
            Intent::Suicidal
        } else if compound > 0.2 {
            Intent::Positive
        } else if compound < -0.2 {
            Intent::Negative
        } else {
            Intent::Unknown
        };

        ClassificationResult {
            intent,
            confidence: if intent == Intent::Unknown { 0.0 } else { KNOWN_INTENT_CONFIDENCE },
            sentiment: Some(Sentiment {
                neg: f64::from(neg),
                pos: f64::from(pos),
                compound,
            }),
            entities: HashMap::new(),
        }
    }
}

#[async_trait]
impl SafetyClassifier for LexiconClassifier {
    async fn classify(
        &self,
        text: &str,
        _history: &[HistoryTurn]
    ) -> Result<ClassificationResult, CapabilityError> {
        Ok(self.analyze(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> LexiconClassifier {
        LexiconClassifier::new(Arc::new(SafetyRules::default()))
    }

    #[test]
    fn crisis_text_is_suicidal() {
        let res = classifier().analyze("I want to kill myself");
        assert_eq!(res.intent, Intent::Suicidal);
        assert_eq!(res.confidence, 0.7);
    }

    #[test]
    fn short_greeting() {
        assert_eq!(classifier().analyze("Hi, hello!").intent, Intent::Greeting);
    }

    #[test]
    fn long_greeting_is_not_a_greeting() {
        let res = classifier().analyze("hi there I have been feeling sad and lonely");
        assert_eq!(res.intent, Intent::Negative);
    }

    #[test]
    fn help_and_thanks() {
        assert_eq!(classifier().analyze("can you help me cope").intent, Intent::HelpRequest);
        assert_eq!(classifier().analyze("thanks a lot for this").intent, Intent::Thanks);
    }

    #[test]
    fn sentiment_compound() {
        let res = classifier().analyze("I feel sad and hopeless but a bit better");
        let sentiment = res.sentiment.unwrap();
        assert_eq!(sentiment.neg, 2.0);
        assert_eq!(sentiment.pos, 1.0);
        assert!((sentiment.compound - -1.0 / 3.0).abs() < 1e-9);
        assert_eq!(res.intent, Intent::Negative);
    }

    #[test]
    fn empty_and_garbage_are_unknown() {
        for text in ["", "   ", "@@@ ###", "🙂"] {
            let res = classifier().analyze(text);
            assert_eq!(res.intent, Intent::Unknown);
            assert_eq!(res.confidence, 0.0);
            assert_eq!(res.compound(), 0.0);
        }
    }

    #[tokio::test]
    async fn classify_never_fails() {
        let res = classifier().classify("\u{0}\u{1}", &[]).await;
        assert!(res.is_ok());
    }
}
