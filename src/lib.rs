//! kvela: application revision assembly, dispatch and rollout controller
//!
//! - [`controller::assemble`] turns an ApplicationRevision into manifests
//! - [`controller::dispatch`] applies them with ownership-aware garbage collection
//! - [`controller::approllout`] drives AppRollouts from a source to a target revision
//! - [`appfile`] generates chart-based components for revisions

pub mod appfile;
pub mod config;
pub mod controller;
pub mod crd;
pub mod server;
