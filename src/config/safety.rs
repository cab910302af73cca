use log::info;
use regex::{ Regex, RegexSet };
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::sync::Arc;

use crate::error::ConfigError;

pub const DEFAULT_SAFETY_MESSAGE: &str =
    "I'm sorry you're feeling this way. If you are in immediate danger, please call your local emergency services now. \
If you'd like, we can provide resources or request a human to reach out.";

/// On-disk shape of the safety rules. Every field is optional; missing
/// fields fall back to the built-in lists.
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct SafetyRulesFile {
    pub crisis_patterns: Vec<String>,
    pub crisis_vocabulary: Vec<String>,
    pub urgency_markers: Vec<String>,
    pub greetings: Vec<String>,
    pub help_phrases: Vec<String>,
    pub thanks_phrases: Vec<String>,
    pub positive_words: Vec<String>,
    pub negative_words: Vec<String>,
    pub negative_sentiment_threshold: f64,
    pub greeting_max_words: usize,
    pub safety_message: String,
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl Default for SafetyRulesFile {
    fn default() -> Self {
        Self {
            crisis_patterns: strings(
                &[
                    r"\bkill myself\b",
                    r"\bi want to die\b",
                    r"\bi'm going to kill myself\b",
                    r"\bi want to end my life\b",
                    r"\bsuicid(e|al)\b",
                    r"\bend my life\b",
                    r"\bnot worth living\b",
                    r"\bhang myself\b",
                    r"\boverdose\b",
                ]
            ),
            crisis_vocabulary: strings(
                &[
                    "suicide",
                    "die",
                    "kill myself",
                    "end my life",
                    "hang myself",
                    "overdose",
                    "not worth living",
                ]
            ),
            urgency_markers: strings(
                &[
                    "now",
                    "today",
                    "immediately",
                    "right now",
                    "already",
                    "this minute",
                    "tonight",
                    "soon",
                    "plan",
                    "planned",
                    "going to",
                    "tomorrow",
                ]
            ),
            greetings: strings(
                &["hello", "hi", "hey", "good morning", "good evening", "good afternoon", "hiya"]
            ),
            help_phrases: strings(
                &["help", "cope", "support", "talk to someone", "talk to a human"]
            ),
            thanks_phrases: strings(&["thank", "thanks", "thank you"]),
            positive_words: strings(
                &["good", "happy", "great", "okay", "fine", "relieved", "better", "well", "ok"]
            ),
            negative_words: strings(
                &[
                    "sad",
                    "down",
                    "depressed",
                    "unhappy",
                    "hopeless",
                    "miserable",
                    "terrible",
                    "bad",
                    "alone",
                    "lonely",
                    "worthless",
                ]
            ),
            negative_sentiment_threshold: -0.3,
            greeting_max_words: 3,
            safety_message: DEFAULT_SAFETY_MESSAGE.to_string(),
        }
    }
}

/// Whole-word, case-insensitive matcher over a list of words or phrases.
#[derive(Debug, Clone)]
pub struct Lexicon {
    matcher: Option<Regex>,
}

impl Lexicon {
    pub fn new(entries: &[String]) -> Result<Self, ConfigError> {
        let alternatives: Vec<String> = entries
            .iter()
            .map(|e| e.trim())
            .filter(|e| !e.is_empty())
            .map(regex::escape)
            .collect();
        if alternatives.is_empty() {
            return Ok(Self { matcher: None });
        }
        let source = format!(r"(?i)\b(?:{})\b", alternatives.join("|"));
        let matcher = Regex::new(&source).map_err(|e| ConfigError::Pattern(source.clone(), e))?;
        Ok(Self { matcher: Some(matcher) })
    }

    pub fn matches(&self, text: &str) -> bool {
        self.matcher.as_ref().map(|m| m.is_match(text)).unwrap_or(false)
    }
}

/// Compiled rules shared by the classifier and the safety gate.
#[derive(Debug, Clone)]
pub struct SafetyRules {
    crisis_patterns: RegexSet,
    pub crisis_vocabulary: Lexicon,
    pub urgency_markers: Lexicon,
    pub greetings: Lexicon,
    pub help_phrases: Lexicon,
    pub thanks_phrases: Lexicon,
    pub positive_words: HashSet<String>,
    pub negative_words: HashSet<String>,
    pub negative_sentiment_threshold: f64,
    pub greeting_max_words: usize,
    pub safety_message: String,
}

impl SafetyRules {
    pub fn compile(file: SafetyRulesFile) -> Result<Self, ConfigError> {
        if !(-1.0..=1.0).contains(&file.negative_sentiment_threshold) {
            return Err(
                ConfigError::Invalid(
                    format!(
                        "negative_sentiment_threshold must be within [-1, 1], got {}",
                        file.negative_sentiment_threshold
                    )
                )
            );
        }
        let sources: Vec<String> = file.crisis_patterns
            .iter()
            .map(|p| format!("(?i){}", p))
            .collect();
        let crisis_patterns = RegexSet::new(&sources).map_err(|e|
            ConfigError::Pattern(file.crisis_patterns.join(" | "), e)
        )?;

        Ok(Self {
            crisis_patterns,
            crisis_vocabulary: Lexicon::new(&file.crisis_vocabulary)?,
            urgency_markers: Lexicon::new(&file.urgency_markers)?,
            greetings: Lexicon::new(&file.greetings)?,
            help_phrases: Lexicon::new(&file.help_phrases)?,
            thanks_phrases: Lexicon::new(&file.thanks_phrases)?,
            positive_words: file.positive_words
                .iter()
                .map(|w| w.to_lowercase())
                .collect(),
            negative_words: file.negative_words
                .iter()
                .map(|w| w.to_lowercase())
                .collect(),
            negative_sentiment_threshold: file.negative_sentiment_threshold,
            greeting_max_words: file.greeting_max_words,
            safety_message: file.safety_message,
        })
    }

    /// Loads rules from `path`, or the built-in rules when no path is given.
    pub fn load(path: Option<&str>) -> Result<Arc<Self>, ConfigError> {
        let file = match path {
            Some(p) => {
                let json_str = fs::read_to_string(p)?;
                let file: SafetyRulesFile = serde_json::from_str(&json_str)?;
                info!("Loaded safety rules from: {}", p);
                file
            }
            None => SafetyRulesFile::default(),
        };
        Ok(Arc::new(Self::compile(file)?))
    }

    pub fn matches_crisis_pattern(&self, text: &str) -> bool {
        self.crisis_patterns.is_match(text)
    }
}

impl Default for SafetyRules {
    fn default() -> Self {
        Self::compile(SafetyRulesFile::default()).expect("built-in safety rules compile")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lexicon_matches_whole_words_only() {
        let lex = Lexicon::new(&strings(&["now", "right now"])).unwrap();
        assert!(lex.matches("I will do it now"));
        assert!(lex.matches("RIGHT NOW"));
        assert!(!lex.matches("I know"));
    }

    #[test]
    fn empty_lexicon_never_matches() {
        let lex = Lexicon::new(&[]).unwrap();
        assert!(!lex.matches("anything"));
    }

    #[test]
    fn crisis_patterns_are_case_insensitive() {
        let rules = SafetyRules::default();
        assert!(rules.matches_crisis_pattern("I want to KILL MYSELF"));
        assert!(rules.matches_crisis_pattern("thinking about suicide"));
        assert!(!rules.matches_crisis_pattern("I had a long day"));
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let file: SafetyRulesFile = serde_json
            ::from_str(r#"{"negative_sentiment_threshold": -0.5}"#)
            .unwrap();
        let rules = SafetyRules::compile(file).unwrap();
        assert_eq!(rules.negative_sentiment_threshold, -0.5);
        assert!(rules.urgency_markers.matches("tonight"));
    }

    #[test]
    fn rejects_out_of_range_threshold() {
        let file = SafetyRulesFile {
            negative_sentiment_threshold: -4.0,
            ..Default::default()
        };
        assert!(matches!(SafetyRules::compile(file), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn rejects_bad_pattern() {
        let file = SafetyRulesFile {
            crisis_patterns: strings(&["(unclosed"]),
            ..Default::default()
        };
        assert!(matches!(SafetyRules::compile(file), Err(ConfigError::Pattern(_, _))));
    }
}
