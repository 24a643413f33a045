//! Model-service ports: LLM ticket analysis and spam classification.

pub mod analysis;
pub mod provider;
pub mod providers;
pub mod spam;

pub use analysis::{AnalysisGenerator, LlmAnalysis};
pub use provider::{LlmError, LlmProvider, Message, Role};
pub use spam::{HeuristicOutcome, LlmSpamClassifier, SpamClassifier, SpamHeuristic, SpamVerdict};
