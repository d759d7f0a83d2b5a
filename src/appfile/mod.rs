//! Application file parsing helpers
//!
//! Turns a parsed application workload into the Component and
//! ApplicationConfiguration entries an ApplicationRevision embeds. Chart-based
//! workloads are expanded into a chart release and repository; their traits
//! are rendered by a [`TemplateEvaluator`] and attached as labeled traits.

pub mod helm;
mod module;

pub use module::generate_component_from_helm_module;

use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppfileError {
    #[error("invalid chart module of {workload}: {source}")]
    InvalidModule {
        workload: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("chart module of {workload}: {field} must be a mapping")]
    NotAMapping { workload: String, field: &'static str },

    #[error("evaluate template trait={trait_name} app={workload}: {message}")]
    Evaluate {
        trait_name: String,
        workload: String,
        message: String,
    },

    #[error("evaluate trait={assist} template for component={component} app={app}: output is not an object")]
    InvalidAssist {
        assist: String,
        component: String,
        app: String,
    },
}

/// Trait attached to a workload in the application file
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkloadTrait {
    /// Trait type, e.g. `expose`
    pub name: String,
    pub params: Map<String, Value>,
}

/// Scope a workload joins
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkloadScope {
    pub name: String,
    pub api_version: String,
    pub kind: String,
}

/// Workload of the application file, after type resolution
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Workload {
    /// Service name within the application
    pub name: String,
    /// Module template; a YAML chart module for chart-based workloads
    pub template: String,
    /// Settings from the application, overriding template defaults
    pub params: Map<String, Value>,
    pub traits: Vec<WorkloadTrait>,
    pub scopes: Vec<WorkloadScope>,
}

/// Context a trait template is evaluated against
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessContext {
    pub app_name: String,
    pub namespace: String,
    pub component: String,
    /// Rendered workload, `{}` for chart-based workloads
    pub output: Value,
}

/// Auxiliary object produced by a trait template
#[derive(Debug, Clone, PartialEq)]
pub struct Assist {
    /// Trait type that produced it
    pub type_name: String,
    /// Resource name within the trait template; may be empty
    pub name: String,
    pub object: Value,
}

/// Result of evaluating one trait
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Evaluation {
    /// Patch to the workload output, if the trait produces one
    pub output: Option<Value>,
    pub assists: Vec<Assist>,
}

/// Evaluates trait templates
///
/// The template language lives outside this crate; implementations only need
/// to be deterministic for the same context and trait.
pub trait TemplateEvaluator: Send + Sync {
    fn evaluate(
        &self,
        context: &ProcessContext,
        workload_trait: &WorkloadTrait,
    ) -> Result<Evaluation, String>;
}

#[cfg(test)]
#[path = "appfile_test.rs"]
mod tests;
