//! Reputation, approval and payload validation for Arbor nodes.

pub mod approval;
pub mod behavior;
pub mod validation;

pub use approval::{
    Approval, ApprovalConfig, ApprovalError, ApprovalService, CaptchaClientInfo, CaptchaOptions,
    SchemeKind, split_slices,
};
pub use behavior::{resolve_host_ip, BehaviorConfig, BehaviorEngine};
pub use validation::{schemas, Constraint, InputValidator, ValidationError, ValidationRule};
