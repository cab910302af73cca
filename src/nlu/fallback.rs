use async_trait::async_trait;

use crate::error::CapabilityError;
use crate::llm::ReplyGenerator;
use crate::models::chat::{ ClassificationResult, HistoryTurn, Intent };

/// Deterministic local replies keyed on the classification.
#[derive(Debug, Clone, Copy, Default)]
pub struct FallbackGenerator;

impl FallbackGenerator {
    pub fn reply(&self, classification: &ClassificationResult) -> &'static str {
        let compound = classification.compound();
        match classification.intent {
            Intent::Suicidal =>
                "I'm genuinely concerned about what you've shared. Your safety is the priority. \
If you're in immediate danger, please reach out now: call or text your local crisis line, \
or contact emergency services right away.\n\n\
You deserve professional support right now. Would you like me to help you find resources or someone to talk to?",
            Intent::HelpRequest =>
                "I'm here and I want to help you through this. Here are some ways we can work together:\n\
- Talk through what's troubling you\n\
- Learn a quick calming or grounding technique\n\
- Connect with a human counselor or crisis support\n\n\
What feels right for you right now?",
            Intent::Thanks =>
                "I'm really glad I could help. Remember, I'm here whenever you need someone to listen or talk things through. \
You're doing great by reaching out. Keep that strength going.",
            Intent::Greeting =>
                "Hello! I'm so glad you're here. This is a safe space for us to talk about what's on your mind. \
How are you feeling right now? I'm all ears.",
            _ if compound <= -0.5 =>
                "I can sense you're really struggling right now, and I want you to know that's okay. \
When everything feels heavy like this, it helps to break things down. \
Tell me, what's the biggest weight on your shoulders right now? Let's tackle it together.",
            _ if compound < -0.2 =>
                "It sounds like you're dealing with some tough feelings, and I appreciate you being honest about that. \
Those emotions are completely valid. \
Do you want to talk more about what's causing this, or would a quick mindfulness exercise help you feel a bit lighter?",
            _ if compound < 0.0 =>
                "I hear you, and I'm listening. Whatever you're feeling right now is real and matters. \
Would it help to talk through it more, or would you like to try a grounding technique to create some space?",
            _ if compound >= 0.2 =>
                "That's wonderful to hear! I'm genuinely happy that you're experiencing some positive energy. \
What's been helping you feel better? Understanding what works can help you do more of it.",
            _ =>
                "Thank you for sharing that with me. I want to really understand what you're going through. \
Can you tell me a bit more? Or if you'd rather, we can try a specific coping technique together.",
        }
    }
}

#[async_trait]
impl ReplyGenerator for FallbackGenerator {
    fn name(&self) -> &str {
        "fallback"
    }

    async fn generate(
        &self,
        _text: &str,
        classification: &ClassificationResult,
        _history: &[HistoryTurn]
    ) -> Result<String, CapabilityError> {
        Ok(self.reply(classification).to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::chat::Sentiment;

    fn with(intent: Intent, compound: f64) -> ClassificationResult {
        ClassificationResult {
            intent,
            confidence: 0.7,
            sentiment: Some(Sentiment { neg: 0.0, pos: 0.0, compound }),
            entities: Default::default(),
        }
    }

    #[test]
    fn intent_takes_precedence_over_sentiment() {
        let g = FallbackGenerator;
        assert!(g.reply(&with(Intent::Greeting, -1.0)).starts_with("Hello!"));
        assert!(g.reply(&with(Intent::Thanks, -1.0)).starts_with("I'm really glad"));
    }

    #[test]
    fn sentiment_bands() {
        let g = FallbackGenerator;
        assert!(g.reply(&with(Intent::Negative, -0.5)).starts_with("I can sense"));
        assert!(g.reply(&with(Intent::Negative, -0.3)).starts_with("It sounds like"));
        assert!(g.reply(&with(Intent::Unknown, -0.1)).starts_with("I hear you"));
        assert!(g.reply(&with(Intent::Positive, 0.5)).starts_with("That's wonderful"));
        assert!(g.reply(&with(Intent::Unknown, 0.1)).starts_with("Thank you for sharing"));
    }

    #[test]
    fn neutral_default_is_deterministic() {
        let g = FallbackGenerator;
        let a = g.reply(&ClassificationResult::neutral());
        let b = g.reply(&ClassificationResult::neutral());
        assert_eq!(a, b);
        assert!(a.starts_with("Thank you for sharing"));
    }
}
