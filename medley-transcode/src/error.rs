//! Per-job error object.
//!
//! Failures across a transcoding job accumulate into one category-keyed map
//! of human-readable messages. Presence of any key aborts the current step;
//! the job's completion callback observes a non-empty error object exactly
//! once on failure.

use std::collections::BTreeMap;
use std::fmt;

/// Well-known categories; free-form keys are allowed too.
pub const CATEGORY_STORAGE: &str = "storage";
pub const CATEGORY_TRANSCODER: &str = "transcoder";

#[derive(Debug, Default, Clone)]
pub struct JobError {
    entries: BTreeMap<String, String>,
}

impl JobError {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failure under `category`. A later message for the same
    /// category replaces the earlier one.
    pub fn set(&mut self, category: &str, message: impl Into<String>) {
        self.entries.insert(category.to_string(), message.into());
    }

    pub fn get(&self, category: &str) -> Option<&str> {
        self.entries.get(category).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (category, message) in &self.entries {
            if !first {
                write!(f, "; ")?;
            }
            write!(f, "[{category}] {message}")?;
            first = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulates_by_category() {
        let mut err = JobError::new();
        assert!(err.is_empty());
        err.set(CATEGORY_STORAGE, "failed to open local temp buffer");
        err.set(CATEGORY_TRANSCODER, "failed to decode next packet");
        assert_eq!(err.len(), 2);
        assert_eq!(
            err.get(CATEGORY_STORAGE),
            Some("failed to open local temp buffer")
        );
        let rendered = err.to_string();
        assert!(rendered.contains("[storage]"));
        assert!(rendered.contains("[transcoder]"));
    }
}
