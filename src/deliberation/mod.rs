//! Multi-agent deliberation engine: root cause analysis, dialectical lesson
//! synthesis, improvement generation, and effectiveness validation.

pub mod engine;
pub mod parsing;
pub mod types;

pub use engine::DeliberationEngine;
pub use types::{
    EffectivenessValidation, ImprovementRecommendations, LearningLesson, Recommendation,
    RootCauseAnalysis,
};
