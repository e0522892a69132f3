//! The two outer cycles driven by the deliberation core.

pub mod learning;
pub mod roadmap;

pub use learning::{LearningCycle, LearningCycleReport, LearningRecord, PatternsSummary};
pub use roadmap::{RoadmapCycle, RoadmapCycleReport};
