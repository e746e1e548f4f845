use crate::{model_service::Candidate, runset::LabelableItem};

/// Confidence reported on every converted result. Detection strength is kept
/// on the individual regions instead.
pub const DEFAULT_CONFIDENCE: f32 = 0.0;

pub const POSITIVE: &str = "positive";
pub const NEGATIVE: &str = "negative";

#[derive(Debug, Clone, PartialEq)]
pub struct DetectionResult {
    pub item: LabelableItem,
    /// False when the item could not be processed; `outcome` then holds the diagnostic.
    pub has_label: bool,
    pub outcome: String,
    pub confidence: f32,
    pub regions: Vec<Candidate>,
}

impl DetectionResult {
    pub fn from_candidates(item: LabelableItem, candidates: Vec<Candidate>) -> Self {
        let outcome = if candidates.is_empty() {
            NEGATIVE
        } else {
            POSITIVE
        };
        Self {
            item,
            has_label: true,
            outcome: outcome.to_string(),
            confidence: DEFAULT_CONFIDENCE,
            regions: candidates,
        }
    }

    pub fn problem(item: LabelableItem, diagnostic: String) -> Self {
        Self {
            item,
            has_label: false,
            outcome: diagnostic,
            confidence: DEFAULT_CONFIDENCE,
            regions: Vec::new(),
        }
    }

    pub fn is_positive(&self) -> bool {
        self.has_label && self.outcome == POSITIVE
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultSet {
    pub results: Vec<DetectionResult>,
    pub cancelled: bool,
}

impl ResultSet {
    pub fn push(&mut self, result: DetectionResult) {
        self.results.push(result);
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DetectionResult> {
        self.results.iter()
    }

    pub fn problems(&self) -> usize {
        self.results.iter().filter(|r| !r.has_label).count()
    }

    pub fn positives(&self) -> usize {
        self.results.iter().filter(|r| r.is_positive()).count()
    }
}
