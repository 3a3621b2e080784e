pub mod firestore;
pub mod loader;
pub mod session;
pub mod special;
pub mod store;

use serde::Deserialize;
use serde_json::{Map, Value};

/// Number of questions in a previous-year paper.
pub const PYQ_QUESTION_COUNT: usize = 65;
/// Length of a previous-year paper, in minutes.
pub const PYQ_DURATION_MINUTES: u32 = 180;
pub const PYQ_TEST_TYPE: &str = "PYQ";

/// Session key the test parameters are handed over under.
pub const TEST_PARAMS_KEY: &str = "testParams";
/// Timer value before any test is loaded (3 hours).
pub const DEFAULT_REMAINING_SECONDS: u64 = 10_800;

/// A question as the provider gave it to us.
///
/// Only `id` is known to us, everything else is kept as-is in `fields`.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Question {
    pub id: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Question {
    pub fn new(id: String, fields: Map<String, Value>) -> Self {
        Self { id, fields }
    }

    /// Builds a question out of a stored document.
    /// An `id` field inside the document wins over the document's own id.
    pub fn from_document(document: store::Document) -> Self {
        let mut fields = document.fields;
        let id = match fields.remove("id") {
            Some(Value::String(id)) => id,
            Some(other) => other.to_string(),
            None => document.id,
        };
        return Self { id, fields };
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestParameters {
    // Missing or null questions are left to validation, not to the decoder
    #[serde(default, deserialize_with = "null_as_empty")]
    pub questions: Vec<Question>,
    /// Minutes
    pub duration: u32,
    pub test_type: String,
}

impl TestParameters {
    pub fn new(questions: Vec<Question>, duration: u32, test_type: String) -> Self {
        Self {
            questions,
            duration,
            test_type,
        }
    }
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<Question>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<Vec<Question>>::deserialize(deserializer)?.unwrap_or_default())
}

/// A recorded answer: either one option or several.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(untagged)]
pub enum Answer {
    Single(String),
    Multiple(Vec<String>),
}

impl Answer {
    /// "a, c" becomes `Multiple(["a", "c"])`, anything else is a single answer.
    /// Blank input (or only separators) is no answer at all.
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        if text.contains(',') {
            let options: Vec<String> = text
                .split(',')
                .map(|option| option.trim())
                .filter(|option| !option.is_empty())
                .map(|option| option.to_string())
                .collect();
            if options.is_empty() {
                return None;
            }
            return Some(Answer::Multiple(options));
        }
        if text.is_empty() {
            return None;
        }
        return Some(Answer::Single(text.to_string()));
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum QuestionStatus {
    #[default]
    NotVisited,
    NotAnswered,
    Answered,
    MarkedForReview,
    AnsweredMarkedForReview,
}
