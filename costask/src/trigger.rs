//! Parsing of the events that start a task: COS object events, COS workflow events, timers, API
//! gateway requests, and direct invocations.
use crate::{objstore::ObjectLocation, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use snafu::prelude::*;
use tracing::{debug, info, warn};
use url::Url;

/// COS event name of an inventory report being written
const INVENTORY_REPORT_EVENT: &str = "cos:InventoryReportCreated:Put";

/// Where a COS workflow event's sources come from, if the event doesn't say
const DEFAULT_WORKFLOW_SOURCE: &str = "cosWorkflowObjectInfo";
const WORKFLOW_UPSTREAM_SOURCE: &str = "cosWorkflowUpstream";

/// What started a task
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TriggerType {
    CosTrigger,
    CosWorkflow,
    Timer,
    Apigateway,
    Invoke,
}

/// The parts of a trigger event a task cares about
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TriggerEvent {
    pub trigger_type: TriggerType,

    /// Objects the task operates on
    pub source_list: Vec<ObjectLocation>,

    /// Whether the task must refuse to write into a location that would trigger it again
    pub avoid_loop_risk: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEvent {
    #[serde(rename = "Time")]
    time: Option<Value>,
    #[serde(rename = "Records")]
    records: Option<Vec<CosRecord>>,
    #[serde(rename = "ObjectInfo")]
    object_info: Option<WorkflowObject>,
    #[serde(rename = "Upstream")]
    upstream: Option<WorkflowObject>,
    source_from: Option<Value>,
    #[serde(default)]
    source_list: Vec<Value>,
    avoid_loop_risk: Option<Value>,
    parent_request_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CosRecord {
    cos: CosRecordCos,
    event: Option<CosRecordEvent>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CosRecordCos {
    cos_object: CosRecordObject,
}

#[derive(Debug, Deserialize)]
struct CosRecordObject {
    url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CosRecordEvent {
    event_name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WorkflowObject {
    bucket_id: String,
    region: String,
    object: String,
}

impl TryFrom<WorkflowObject> for ObjectLocation {
    type Error = crate::CosTaskError;

    fn try_from(object: WorkflowObject) -> Result<Self> {
        let location = ObjectLocation::new(object.bucket_id, object.region, object.object);
        location.validate()?;

        Ok(location)
    }
}

impl TriggerEvent {
    pub fn parse_str(event: &str) -> Result<Self> {
        let event: Value =
            serde_json::from_str(event).context(crate::error::InvalidEventJsonSnafu)?;
        Self::parse(&event)
    }

    /// Interpret an event.
    ///
    /// If the event has a `body` (as API gateway events do), the body is parsed as JSON and its
    /// fields take precedence over those of the event itself.
    pub fn parse(event: &Value) -> Result<Self> {
        let event_fields = event.as_object().with_context(|| crate::error::MalformedEventSnafu {
            reason: "the event is not a JSON object",
        })?;

        let body = match event_fields.get("body") {
            None | Some(Value::Null) => None,
            Some(Value::String(body)) if body.is_empty() => None,
            Some(Value::String(body)) => Some(
                serde_json::from_str::<Value>(body).context(crate::error::InvalidEventJsonSnafu)?,
            ),
            Some(body) => Some(body.clone()),
        };

        let mut merged: Map<String, Value> = event_fields.clone();
        if let Some(body) = &body {
            let body = body.as_object().with_context(|| crate::error::MalformedEventSnafu {
                reason: "the request body is not a JSON object",
            })?;
            merged.extend(body.iter().map(|(name, value)| (name.clone(), value.clone())));
        }

        let raw: RawEvent = serde_json::from_value(Value::Object(merged))
            .context(crate::error::InvalidEventJsonSnafu)?;

        if let Some(parent_request_id) = &raw.parent_request_id {
            info!(%parent_request_id, "Triggered by a parent function");
        }

        let mut source_list = raw
            .source_list
            .iter()
            .map(parse_source)
            .collect::<Result<Vec<_>>>()?;

        let (trigger_type, default_avoid_loop_risk) = if let Some(records) = raw.records {
            info!(records = records.len(), "Triggered by COS");

            for record in records {
                if let Some(location) = parse_record(record)? {
                    source_list.push(location);
                }
            }

            (TriggerType::CosTrigger, true)
        } else if let Some(object_info) = raw.object_info {
            info!("Triggered by COS workflow");

            let source_from = parse_source_from(raw.source_from.as_ref());

            if source_from.iter().any(|from| from == WORKFLOW_UPSTREAM_SOURCE) {
                let upstream = raw
                    .upstream
                    .with_context(|| crate::error::MalformedEventSnafu {
                        reason: "the workflow event has no Upstream",
                    })?;
                source_list.push(upstream.try_into()?);
            }
            if source_from.iter().any(|from| from == DEFAULT_WORKFLOW_SOURCE) {
                source_list.push(object_info.try_into()?);
            }

            (TriggerType::CosWorkflow, true)
        } else if raw.time.is_some() {
            info!("Triggered by timer");
            (TriggerType::Timer, false)
        } else if body.is_some() {
            info!("Triggered by API gateway");
            (TriggerType::Apigateway, false)
        } else {
            info!("Triggered by direct invocation");
            (TriggerType::Invoke, false)
        };

        let avoid_loop_risk = match raw.avoid_loop_risk {
            None | Some(Value::Null) => default_avoid_loop_risk,
            Some(Value::Bool(value)) => value,
            Some(Value::String(value)) => value == "true",
            Some(_) => false,
        };

        debug!(
            ?trigger_type,
            sources = source_list.len(),
            avoid_loop_risk,
            "Parsed trigger event"
        );

        Ok(Self {
            trigger_type,
            source_list,
            avoid_loop_risk,
        })
    }
}

/// A source list entry is either an object URL or a `{bucket, region, key}` object
fn parse_source(source: &Value) -> Result<ObjectLocation> {
    match source {
        Value::String(url) => {
            let url = Url::parse(url).with_context(|_| crate::error::InvalidSourceUrlSnafu {
                source_url: url.clone(),
            })?;
            ObjectLocation::parse_cos_url(&url)
        }
        Value::Object(_) => {
            let location: ObjectLocation = serde_json::from_value(source.clone())
                .context(crate::error::InvalidEventJsonSnafu)?;
            location.validate()?;
            Ok(location)
        }
        other => crate::error::MalformedEventSnafu {
            reason: format!("unsupported source list entry {other}"),
        }
        .fail(),
    }
}

/// Returns the object a COS event record refers to.
///
/// Inventory report records announce a report about other objects, not an object to work on, so
/// they are skipped.
fn parse_record(record: CosRecord) -> Result<Option<ObjectLocation>> {
    let object = record.cos.cos_object;

    if let Some(CosRecordEvent {
        event_name: Some(event_name),
    }) = &record.event
    {
        if event_name == INVENTORY_REPORT_EVENT {
            warn!(url = %object.url, "Skipping inventory report record");
            return Ok(None);
        }
    }

    let url = Url::parse(&object.url).with_context(|_| crate::error::InvalidSourceUrlSnafu {
        source_url: object.url.clone(),
    })?;

    ObjectLocation::parse_cos_url(&url).map(Some)
}

/// `sourceFrom` may be a list, a JSON-encoded list, or a single name
fn parse_source_from(source_from: Option<&Value>) -> Vec<String> {
    let names = |values: &[Value]| {
        values
            .iter()
            .filter_map(|value| value.as_str().map(str::to_string))
            .collect::<Vec<_>>()
    };

    match source_from {
        Some(Value::Array(values)) => names(values),
        Some(Value::String(value)) => match serde_json::from_str::<Value>(value) {
            Ok(Value::Array(values)) => names(&values),
            Ok(Value::String(value)) => vec![value],
            _ => vec![value.clone()],
        },
        _ => vec![DEFAULT_WORKFLOW_SOURCE.to_string()],
    }
}
