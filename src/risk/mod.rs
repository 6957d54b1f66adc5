//! Risk limits and the decision kernel.

mod config;
mod kernel;

pub use config::RiskConfig;
pub use kernel::{RiskDecision, RiskInput, RiskKernel, RiskRejection};
