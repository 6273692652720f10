//! Background-job integration
//!
//! A job type implements `TrackedJob` and runs its body through
//! `perform_tracked`, which wraps the execution in `FlowTrail::track` with
//! metadata describing the job.

use serde_json::Value;
use std::fmt;
use std::future::Future;

use crate::error::Error;
use crate::facade::{FlowTrail, TrackOptions, TrackResult};
use crate::model::Metadata;
use crate::tracker::Tracker;
use crate::truncate::{truncate, LoggableValue};
use crate::types::Category;

/// Number of leading job arguments recorded in flow metadata
pub const MAX_TRACKED_ARGUMENTS: usize = 5;

/// A unit of work that can describe itself to the tracker
pub trait TrackedJob: Send + Sync {
    /// Stable key of the process definition, e.g. `"Billing::InvoiceJob"`.
    fn identifier(&self) -> String;

    /// Defaults to the last segment of the identifier.
    fn display_name(&self) -> Option<String> {
        None
    }

    /// `None` falls back to the configured default category.
    fn category(&self) -> Option<Category> {
        None
    }

    fn job_id(&self) -> Option<String> {
        None
    }

    fn queue_name(&self) -> Option<String> {
        None
    }

    fn arguments(&self) -> Vec<LoggableValue> {
        Vec::new()
    }
}

/// Flow metadata for `job`: job id, queue and its first arguments, truncated.
pub fn job_metadata<J: TrackedJob + ?Sized>(job: &J) -> Metadata {
    let mut metadata = Metadata::new();
    if let Some(job_id) = job.job_id() {
        metadata.insert("job_id".into(), Value::String(job_id));
    }
    if let Some(queue) = job.queue_name() {
        metadata.insert("queue_name".into(), Value::String(queue));
    }

    let arguments = job.arguments();
    if !arguments.is_empty() {
        let rendered = arguments.iter().take(MAX_TRACKED_ARGUMENTS).map(truncate).collect();
        metadata.insert("arguments".into(), Value::Array(rendered));
    }
    metadata
}

/// Run `work` for `job` as a tracked execution.
///
/// The job id, when present, doubles as the correlation id and the queue
/// name as `triggered_by`.
pub async fn perform_tracked<J, F, Fut, T, E>(
    trail: &FlowTrail,
    job: &J,
    work: F,
) -> std::result::Result<TrackResult<T>, E>
where
    J: TrackedJob + ?Sized,
    F: FnOnce(Tracker) -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: From<Error> + fmt::Display + fmt::Debug,
{
    let mut options = TrackOptions::new(job.identifier()).with_metadata(job_metadata(job));
    options.category = job.category();
    options.name = job.display_name();
    options.correlation_id = job.job_id();
    options.triggered_by = job.queue_name();

    trail.track(options, work).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct ImportJob {
        args: Vec<LoggableValue>,
    }

    impl TrackedJob for ImportJob {
        fn identifier(&self) -> String {
            "Imports::CsvImportJob".into()
        }

        fn job_id(&self) -> Option<String> {
            Some("job-123".into())
        }

        fn queue_name(&self) -> Option<String> {
            Some("imports".into())
        }

        fn arguments(&self) -> Vec<LoggableValue> {
            self.args.clone()
        }
    }

    #[test]
    fn test_job_metadata() {
        let job = ImportJob {
            args: vec![
                "a".repeat(200).into(),
                json!([1, 2, 3, 4, 5]).into(),
                LoggableValue::Int(3),
                LoggableValue::Null,
                LoggableValue::Bool(true),
                LoggableValue::Str("dropped".into()),
            ],
        };
        let metadata = job_metadata(&job);
        assert_eq!(metadata["job_id"], json!("job-123"));
        assert_eq!(metadata["queue_name"], json!("imports"));

        let args = metadata["arguments"].as_array().unwrap();
        assert_eq!(args.len(), MAX_TRACKED_ARGUMENTS);
        assert_eq!(args[0].as_str().unwrap().chars().count(), 103);
        assert_eq!(args[1], json!([1, 2, 3]));
    }

    #[test]
    fn test_job_metadata_without_arguments() {
        let job = ImportJob { args: Vec::new() };
        assert!(!job_metadata(&job).contains_key("arguments"));
    }
}
