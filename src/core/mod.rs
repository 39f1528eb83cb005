//! 核心层：错误类型、问题生命周期、组合根

pub mod engine;
pub mod error;
pub mod state;

pub use engine::{Answer, AnswerSource, Learner, LiveReasoner, RecipeEngine};
pub use error::{AnswerError, ApiError, ContextError, LearnError, LlmError, ReplayError, StepFailure};
pub use state::{IllegalTransition, QuestionLifecycle, QuestionPhase};
