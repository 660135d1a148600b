//! Classification — glob rules, receipt heuristics, and the store-aware
//! resolution layer that combines them.

pub mod heuristics;
pub mod pattern;
pub mod resolver;

pub use heuristics::ReceiptClassifier;
pub use resolver::{ClassificationResolver, DecisionSource, Resolution};
