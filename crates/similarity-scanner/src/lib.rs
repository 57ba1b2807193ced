//! Similarity Scanner
//!
//! Finds historical windows whose shape matches the current window and
//! attaches what happened after each of them.

pub mod normalize;
pub mod outcome;
pub mod scanner;

pub use normalize::{cosine_similarity, normalize_base100};
pub use outcome::forward_outcome;
pub use scanner::{
    AgeDecay, CurrentWindowStats, ScanConfig, ScanRequest, ScanResult, SimilarityScanner,
};
