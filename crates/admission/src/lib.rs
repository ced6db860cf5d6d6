//! Admission mutator: the `MutatingWebhookConfiguration` entry point that
//! decides whether a deployment create/update is allowed, scale-only, or
//! fully patched (pinned-node affinity, resources, rolling-update policy),
//! based on the master's policy answer relayed over the tunnel.

#![forbid(unsafe_code)]

pub mod patch;
pub mod policy;
pub mod routes;
pub mod server;
pub mod webhook;

pub use routes::AdmissionState;
