//! Incremental extraction of one string field from a streamed, JSON-like model output.
//!
//! The model is asked to answer with a JSON object, but the text arrives as arbitrary token
//! fragments. [`FragmentExtractor`] accumulates those fragments and surfaces the best available
//! value of a single field while it is still being generated. Once the value is complete the
//! extractor is `captured` and stays silent for the rest of the stream.

use serde::{Deserialize, Serialize};

/// Separator that ends a string field followed by another field.
pub const FIELD_SEPARATOR: &str = "\",";

/// How the extractor decides that the field value is complete.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum Completion {
    /// The value is in progress while exactly `occurrence_index` markers have been seen since
    /// stream start, and complete once the count moves past it. Depends on the model laying out
    /// the object one field per line.
    LineCount {
        marker: String,
        occurrence_index: usize,
    },
    /// The value is complete at the first unescaped closing quote after the key.
    StringLiteral,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ExtractorConfig {
    /// Literal key marker including the opening quote of the value, e.g. `"thoughts": "`.
    pub key: String,
    pub completion: Completion,
    /// Ordered `(from, to)` replacements applied to the whole buffer after every append.
    #[serde(default)]
    pub normalize: Vec<(String, String)>,
}

impl ExtractorConfig {
    pub fn line_count(key: &str, marker: &str, occurrence_index: usize) -> Self {
        ExtractorConfig {
            key: key.to_string(),
            completion: Completion::LineCount {
                marker: marker.to_string(),
                occurrence_index,
            },
            normalize: Vec::new(),
        }
    }

    pub fn string_literal(key: &str) -> Self {
        ExtractorConfig {
            key: key.to_string(),
            completion: Completion::StringLiteral,
            normalize: Vec::new(),
        }
    }

    pub fn with_normalize(mut self, from: &str, to: &str) -> Self {
        self.normalize.push((from.to_string(), to.to_string()));
        self
    }

    /// `thoughts` of the database-execution answer, one field per line.
    pub fn primary_thoughts() -> Self {
        Self::line_count("\"thoughts\": \"", "\n", 1)
    }

    /// `suggestions_of_query` of the critic answer, four-space indented fields.
    pub fn critic_suggestions() -> Self {
        Self::line_count("\"suggestions_of_query\": \"", "\n    ", 3)
            .with_normalize("\n    \n    ", "\n    ")
            .with_normalize("\n\n", "\n")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionState {
    pub accumulated_text: String,
    pub target_key: String,
    pub occurrence_index: usize,
    pub captured: bool,
    last_value: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FragmentExtractor {
    config: ExtractorConfig,
    state: ExtractionState,
}

impl FragmentExtractor {
    pub fn new(config: ExtractorConfig) -> Self {
        let occurrence_index = match &config.completion {
            Completion::LineCount {
                occurrence_index, ..
            } => *occurrence_index,
            Completion::StringLiteral => 0,
        };
        let state = ExtractionState {
            accumulated_text: String::new(),
            target_key: config.key.clone(),
            occurrence_index,
            captured: false,
            last_value: None,
        };
        FragmentExtractor { config, state }
    }

    /// Appends `chunk` and returns the field value if it advanced.
    pub fn extract(&mut self, chunk: &str) -> Option<String> {
        self.state.accumulated_text.push_str(chunk);
        self.normalize();
        self.scan()
    }

    /// Like [`extract`](Self::extract) for backends whose chunks carry the full text so far.
    pub fn observe(&mut self, snapshot: &str) -> Option<String> {
        self.state.accumulated_text.clear();
        self.state.accumulated_text.push_str(snapshot);
        self.normalize();
        self.scan()
    }

    pub fn is_captured(&self) -> bool {
        self.state.captured
    }

    pub fn accumulated_text(&self) -> &str {
        &self.state.accumulated_text
    }

    /// Last value handed out, if any.
    pub fn last_value(&self) -> Option<&str> {
        self.state.last_value.as_deref()
    }

    fn normalize(&mut self) {
        for (from, to) in &self.config.normalize {
            if self.state.accumulated_text.contains(from.as_str()) {
                self.state.accumulated_text = self.state.accumulated_text.replace(from, to);
            }
        }
    }

    fn scan(&mut self) -> Option<String> {
        if self.state.captured {
            return None;
        }
        let text = &self.state.accumulated_text;
        let start = text.find(&self.config.key)? + self.config.key.len();
        let rest = &text[start..];

        let (value, complete) = match &self.config.completion {
            Completion::LineCount {
                marker,
                occurrence_index,
            } => {
                let count = text.matches(marker.as_str()).count();
                if count < *occurrence_index {
                    return None;
                }
                let complete = count > *occurrence_index;
                (field_value(rest, marker, complete), complete)
            }
            Completion::StringLiteral => string_literal(rest),
        };

        if complete {
            self.state.captured = true;
        }
        if value.is_empty() || self.state.last_value.as_deref() == Some(value.as_str()) {
            return None;
        }
        self.state.last_value = Some(value.clone());
        Some(value)
    }
}

fn field_value(rest: &str, marker: &str, complete: bool) -> String {
    let line = match rest.find(marker) {
        Some(end) => &rest[..end],
        None => rest,
    };
    let value = match line.find(FIELD_SEPARATOR) {
        Some(end) => &line[..end],
        None => {
            let line = if complete {
                line.trim_end().trim_end_matches(',')
            } else {
                line
            };
            match line.strip_suffix('"') {
                Some(inner) if !inner.ends_with('\\') => inner,
                _ => line,
            }
        }
    };
    value.to_string()
}

fn string_literal(rest: &str) -> (String, bool) {
    let mut escaped = false;
    for (i, c) in rest.char_indices() {
        match c {
            _ if escaped => escaped = false,
            '\\' => escaped = true,
            '"' => return (rest[..i].to_string(), true),
            _ => {}
        }
    }
    // a dangling backslash belongs to an escape that has not arrived yet
    let value = if escaped {
        &rest[..rest.len() - 1]
    } else {
        rest
    };
    (value.to_string(), false)
}
