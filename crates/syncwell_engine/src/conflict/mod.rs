//! Conflict detection and resolution.

mod detector;
mod resolver;
mod similarity;

pub use detector::{classify, detect, Detection};
pub use resolver::{ConflictResolver, Verdict};
pub use similarity::{merge_payloads, similarity, text_similarity};
