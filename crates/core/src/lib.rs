//! Shared types, configuration, and error taxonomy for the KubeDoor agent.

#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod model;
pub mod notify;

pub mod prelude {
    pub use crate::config::AgentConfig;
    pub use crate::error::{KubedoorError, KubedoorResult};
    pub use crate::model::{
        AuditKind, AuditRecord, CronOp, DeploymentTarget, EventRecord, LongAnswer, NodeSchedulingStatus,
        PendingAdmission, PolicyAnswer, ShortAnswer, TunnelState, cronjob_name,
    };
}
