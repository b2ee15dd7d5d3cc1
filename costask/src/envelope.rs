//! The result envelope every task returns, and the log summary built from a set of them.
use crate::{CosTaskError, Result};
use serde::{ser::SerializeStruct, Serialize, Serializer};
use std::fmt::Write;

/// How many per-task detail messages a [`TaskSummary`] carries at most
const SUMMARY_DETAIL_LIMIT: usize = 20;

/// The outcome of running one task: the parameters it ran with, and either its result or the
/// error that stopped it.
///
/// Serializes as `{"params": ..., "result": ...}` or `{"params": ..., "error": "..."}`, with the
/// error rendered as its message followed by the messages of its sources.
#[derive(Debug)]
pub struct TaskOutcome<P, R> {
    pub params: P,
    pub outcome: Result<R>,
}

impl<P, R> TaskOutcome<P, R> {
    pub fn new(params: P, outcome: Result<R>) -> Self {
        Self { params, outcome }
    }

    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn result(&self) -> Option<&R> {
        self.outcome.as_ref().ok()
    }

    pub fn error(&self) -> Option<&CosTaskError> {
        self.outcome.as_ref().err()
    }
}

impl<P: Serialize, R: Serialize> Serialize for TaskOutcome<P, R> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("TaskOutcome", 2)?;
        state.serialize_field("params", &self.params)?;
        match &self.outcome {
            Ok(result) => state.serialize_field("result", result)?,
            Err(e) => state.serialize_field("error", &error_chain(e))?,
        }
        state.end()
    }
}

/// Render an error and all of its sources as one line
pub fn error_chain(error: &(dyn std::error::Error + 'static)) -> String {
    let mut message = error.to_string();
    let mut source = error.source();

    while let Some(e) = source {
        let _ = write!(message, ": {e}");
        source = e.source();
    }

    message
}

/// Overall status of a set of tasks
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SummaryStatus {
    Success,
    Fail,
}

/// A human-readable report on a set of task outcomes, suitable for logging.
///
/// The first message is the overall tally; it is followed by up to 20 per-task detail messages.
/// When there are more than 20 outcomes and any of them failed, only failures get details.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TaskSummary {
    pub status: SummaryStatus,
    pub messages: Vec<String>,
}

pub fn summarize<P: Serialize, R: Serialize>(
    name: &str,
    outcomes: &[TaskOutcome<P, R>],
) -> TaskSummary {
    let truncated = outcomes.len() > SUMMARY_DETAIL_LIMIT;
    let any_failed = outcomes.iter().any(|outcome| !outcome.is_ok());

    let mut details = Vec::new();
    let mut success = 0usize;

    for outcome in outcomes {
        let params = serde_json::to_string(&outcome.params).unwrap_or_default();

        match &outcome.outcome {
            Ok(result) => {
                success += 1;
                if details.len() < SUMMARY_DETAIL_LIMIT && !(truncated && any_failed) {
                    details.push(format!(
                        "TaskStatus: success\nParams: {params}\nResult: {}",
                        serde_json::to_string(result).unwrap_or_default()
                    ));
                }
            }
            Err(e) => {
                if details.len() < SUMMARY_DETAIL_LIMIT {
                    details.push(format!(
                        "TaskStatus: fail\nParams: {params}\nError: {}",
                        error_chain(e)
                    ));
                }
            }
        }
    }

    let total = outcomes.len();
    let status = if success == total {
        SummaryStatus::Success
    } else {
        SummaryStatus::Fail
    };
    let status_word = match status {
        SummaryStatus::Success => "success",
        SummaryStatus::Fail => "fail",
    };

    let mut messages = Vec::with_capacity(details.len() + 1);
    messages.push(format!(
        "Result: {name} {status_word}\nsuccess: {success}\ntotal: {total}"
    ));
    messages.extend(details);

    TaskSummary { status, messages }
}
