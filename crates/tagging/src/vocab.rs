use crate::error::{Result, TaggerError};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// MagnaTagATune top-50 tags, in the column order of the label vectors.
pub const MTAT_TOP50_TAGS: [&str; 50] = [
    "guitar", "classical", "slow", "techno", "strings", "drums", "electronic", "rock", "fast",
    "piano", "ambient", "beat", "violin", "vocal", "synth", "female", "indian", "opera", "male",
    "singing", "vocals", "no vocals", "harpsichord", "loud", "quiet", "flute", "woman",
    "male vocal", "no vocal", "pop", "soft", "sitar", "solo", "man", "classic", "choir", "voice",
    "new age", "dance", "female vocal", "male voice", "beats", "harp", "cello", "no voice",
    "weird", "country", "female voice", "metal", "choral",
];

/// Downstream tagging task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Task {
    MtatTop50,
}

impl Task {
    pub fn n_classes(&self) -> usize {
        match self {
            Task::MtatTop50 => MTAT_TOP50_TAGS.len(),
        }
    }

    pub fn vocabulary(&self) -> TagVocabulary {
        match self {
            Task::MtatTop50 => TagVocabulary {
                tags: MTAT_TOP50_TAGS.iter().map(|t| t.to_string()).collect(),
            },
        }
    }
}

/// Ordered tag names.
///
/// Index `i` names column `i` of every logit and label vector and row/column
/// `i` of the confusion matrix, so the order must not change within a run
/// or between a checkpoint and the run that loads it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagVocabulary {
    tags: Vec<String>,
}

impl TagVocabulary {
    pub fn new(tags: Vec<String>) -> Result<Self> {
        if tags.is_empty() {
            return Err(TaggerError::Config("tag vocabulary is empty".to_string()));
        }
        let mut seen = HashSet::with_capacity(tags.len());
        for tag in &tags {
            if !seen.insert(tag.as_str()) {
                return Err(TaggerError::Config(format!("duplicate tag '{tag}'")));
            }
        }
        Ok(Self { tags })
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    pub fn name(&self, index: usize) -> Option<&str> {
        self.tags.get(index).map(String::as_str)
    }

    pub fn index_of(&self, tag: &str) -> Option<usize> {
        self.tags.iter().position(|t| t == tag)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.tags.iter().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mtat_top50_vocabulary() {
        let vocab = Task::MtatTop50.vocabulary();
        assert_eq!(vocab.len(), 50);
        assert_eq!(Task::MtatTop50.n_classes(), 50);
        assert_eq!(vocab.name(0), Some("guitar"));
        assert_eq!(vocab.name(49), Some("choral"));
        assert_eq!(vocab.index_of("no vocals"), Some(21));
    }

    #[test]
    fn test_mtat_tags_unique() {
        assert!(TagVocabulary::new(MTAT_TOP50_TAGS.iter().map(|t| t.to_string()).collect()).is_ok());
    }

    #[test]
    fn test_rejects_duplicates_and_empty() {
        let dup = TagVocabulary::new(vec!["rock".into(), "pop".into(), "rock".into()]);
        assert!(matches!(dup, Err(TaggerError::Config(_))));
        assert!(TagVocabulary::new(Vec::new()).is_err());
    }

    #[test]
    fn test_task_serde_name() {
        let task: Task = serde_json::from_str("\"mtat_top50\"").unwrap();
        assert_eq!(task, Task::MtatTop50);
    }
}
