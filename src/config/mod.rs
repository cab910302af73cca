pub mod safety;

pub use safety::{ Lexicon, SafetyRules, SafetyRulesFile };
