//! Member retention intelligence.
//!
//! Pulls memberships, check-ins and payments from a booking platform or a
//! spreadsheet export, scores each active member's churn risk and derives
//! fleet-wide retention analytics. Results are cached per source for a
//! configurable TTL and optionally refreshed in the background.

pub mod analytics;
pub mod cache;
pub mod error;
pub mod normalize;
pub mod outreach;
pub mod pipeline;
pub mod risk_engine;
pub mod scheduler;
pub mod services;
pub mod source;
pub mod state;
pub mod types;

pub use error::{EngineError, ErrorPayload};
pub use state::EngineState;
pub use types::{Config, Member, MemberFilter, RiskAssessment, RiskLevel, Stats};
