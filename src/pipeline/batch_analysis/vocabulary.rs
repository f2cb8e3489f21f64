//! Label vocabularies and prompt templates per analysis type.
//!
//! The vocabularies are the only thing the result validators trust: a model
//! answer is kept only if it names labels listed here.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::error::BatchError;
use super::types::AnalysisType;

const DEFAULT_ATTRIBUTES: &[&str] = &[
    "anger", "anticipation", "disgust", "fear", "joy", "sadness", "surprise", "trust",
    "sarcasm", "hope", "frustration", "pride",
];

const DEFAULT_PUBLISHER_TYPES: &[&str] = &[
    "individual",
    "news_media",
    "government",
    "political_party",
    "ngo",
    "business",
    "influencer",
    "academic",
    "automated_account",
    "other",
];

const DEFAULT_BELIEF_CATEGORIES: &[&str] = &[
    "religious",
    "political",
    "scientific",
    "conspiratorial",
    "moral",
    "none",
];

const DEFAULT_IDENTITY_LABELS: &[&str] = &[
    "gender",
    "ethnicity",
    "nationality",
    "religion",
    "age",
    "sexual_orientation",
    "disability",
    "class",
];

const DEFAULT_TOPICS: &[(&str, &[&str])] = &[
    ("Politics", &["Elections", "Government", "Legislation", "International Relations"]),
    ("Economy", &["Inflation", "Employment", "Markets", "Taxation"]),
    ("Society", &["Education", "Health", "Immigration", "Crime", "Religion"]),
    ("Environment", &["Climate", "Energy", "Natural Disasters"]),
    ("Technology", &["Artificial Intelligence", "Social Media", "Privacy"]),
    ("Culture", &["Sports", "Entertainment", "Media"]),
];

/// Label sets used to build prompts and to validate results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Vocabulary {
    pub sentiment_attributes: Vec<String>,
    /// Parent topic → allowed sub topics.
    pub topic_hierarchy: BTreeMap<String, Vec<String>>,
    pub publisher_types: Vec<String>,
    pub belief_categories: Vec<String>,
    pub identity_labels: Vec<String>,
}

impl Default for Vocabulary {
    fn default() -> Self {
        let owned = |labels: &[&str]| labels.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        Self {
            sentiment_attributes: owned(DEFAULT_ATTRIBUTES),
            topic_hierarchy: DEFAULT_TOPICS
                .iter()
                .map(|(parent, subs)| (parent.to_string(), owned(subs)))
                .collect(),
            publisher_types: owned(DEFAULT_PUBLISHER_TYPES),
            belief_categories: owned(DEFAULT_BELIEF_CATEGORIES),
            identity_labels: owned(DEFAULT_IDENTITY_LABELS),
        }
    }
}

impl Vocabulary {
    /// Load a vocabulary from a JSON file. Missing sections keep their defaults.
    pub fn load(path: &Path) -> Result<Self, BatchError> {
        let raw = std::fs::read_to_string(path)?;
        let vocab: Self = serde_json::from_str(&raw)?;
        vocab.validate()?;
        Ok(vocab)
    }

    pub fn validate(&self) -> Result<(), BatchError> {
        if self.sentiment_attributes.is_empty()
            || self.topic_hierarchy.is_empty()
            || self.publisher_types.is_empty()
        {
            return Err(BatchError::Config(
                "vocabulary must list attributes, topics and publisher types".into(),
            ));
        }
        Ok(())
    }

    pub fn is_attribute(&self, label: &str) -> bool {
        self.sentiment_attributes.iter().any(|a| a == label)
    }

    pub fn is_topic(&self, parent: &str, sub: &str) -> bool {
        self.topic_hierarchy
            .get(parent)
            .is_some_and(|subs| subs.iter().any(|s| s == sub))
    }

    pub fn is_publisher(&self, label: &str) -> bool {
        self.publisher_types.iter().any(|p| p == label)
    }

    pub fn is_belief(&self, label: &str) -> bool {
        self.belief_categories.iter().any(|b| b == label)
    }

    pub fn is_identity(&self, label: &str) -> bool {
        self.identity_labels.iter().any(|i| i == label)
    }

    /// System prompt for one analysis type.
    pub fn system_prompt(&self, analysis_type: AnalysisType) -> String {
        match analysis_type {
            AnalysisType::SentimentPolarity => "Rate the overall sentiment of the post on a scale \
from 1 (very negative) to 5 (very positive). Answer with the number only."
                .to_string(),
            AnalysisType::SentimentAttribute => format!(
                "List the emotional attributes expressed in the post. Use only these labels: {}. \
Answer with a JSON array of strings.",
                self.sentiment_attributes.join(", ")
            ),
            AnalysisType::TopicAnalysis => format!(
                "Assign the post to topics from this hierarchy:\n{}\nAnswer with a JSON array of \
objects with keys \"parent_topic\" and \"sub_topic\".",
                self.topic_hierarchy
                    .iter()
                    .map(|(parent, subs)| format!("- {parent}: {}", subs.join(", ")))
                    .collect::<Vec<_>>()
                    .join("\n")
            ),
            AnalysisType::PublisherAnalysis => format!(
                "Classify who published the post. Answer with exactly one of: {}.",
                self.publisher_types.join(", ")
            ),
            AnalysisType::BeliefCategory => format!(
                "Classify the belief system the post appeals to. Answer with exactly one of: {}.",
                self.belief_categories.join(", ")
            ),
            AnalysisType::IdentityClassification => format!(
                "List the identity dimensions the post refers to. Use only these labels: {}. \
Answer with a JSON array of strings.",
                self.identity_labels.join(", ")
            ),
        }
    }
}
