use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

const CURRENT_PREFIX: &str = "current_";
const PREVIOUS_PREFIX: &str = "previous_";

/// A metered usage snapshot of one resource instance in one billing period
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageDoc {
    /// Start of the usage window, epoch milliseconds
    pub start: i64,

    /// End of the usage window, epoch milliseconds
    pub end: i64,

    pub organization_id: String,
    pub space_id: String,
    pub consumer_id: String,
    pub resource_id: String,
    pub plan_id: String,
    pub resource_instance_id: String,

    /// One entry per metric name, in submission order
    pub measured_usage: Vec<Measure>,

    /// Assigned by the collector on acceptance
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Assigned by the collector on acceptance
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed: Option<i64>,

    /// Assigned by the collector on acceptance
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_id: Option<String>,

    /// Fields the renewer does not interpret, passed through untouched
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A single named quantity of a usage document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measure {
    pub measure: String,
    pub quantity: f64,
}

impl Measure {
    pub fn new(measure: impl Into<String>, quantity: f64) -> Self {
        Self {
            measure: measure.into(),
            quantity,
        }
    }
}

/// Selects which half of a current/previous measure pair gets reset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UsageType {
    Previous,
    Current,
}

impl UsageType {
    fn prefix(&self) -> &'static str {
        match self {
            UsageType::Previous => PREVIOUS_PREFIX,
            UsageType::Current => CURRENT_PREFIX,
        }
    }
}

impl UsageDoc {
    /// Whether the document carries current/previous measure pairs and can be
    /// projected into the next billing period
    pub fn supports_carry_over(&self) -> bool {
        self.measured_usage.iter().any(|m| {
            m.measure.starts_with(CURRENT_PREFIX) || m.measure.starts_with(PREVIOUS_PREFIX)
        })
    }

    pub fn quantity(&self, measure: &str) -> Option<f64> {
        self.measured_usage
            .iter()
            .find(|m| m.measure == measure)
            .map(|m| m.quantity)
    }
}

/// Shifts the usage window forward by `millis_to_add`
pub fn refresh_usage(doc: &UsageDoc, millis_to_add: i64) -> UsageDoc {
    let mut refreshed = doc.clone();
    refreshed.start = doc.start.saturating_add(millis_to_add);
    refreshed.end = doc.end.saturating_add(millis_to_add);
    refreshed
}

/// Resets every measure of the given usage type to zero.
///
/// With [`UsageType::Previous`] the document becomes the opening state of a
/// new period: the `current_*` point-in-time values are carried forward and
/// the `previous_*` values they are compared against start from zero.
/// Measures outside the current/previous naming scheme are left alone.
pub fn zero_usage(doc: &UsageDoc, usage_type: UsageType) -> UsageDoc {
    let prefix = usage_type.prefix();
    let mut zeroed = doc.clone();
    for measure in zeroed.measured_usage.iter_mut() {
        if measure.measure.starts_with(prefix) {
            measure.quantity = 0.0;
        }
    }
    zeroed
}

/// Drops the bookkeeping fields the collector assigns on acceptance
pub fn sanitize_usage_doc(doc: &UsageDoc) -> UsageDoc {
    let mut sanitized = doc.clone();
    sanitized.id = None;
    sanitized.processed = None;
    sanitized.processed_id = None;
    sanitized
}

/// Builds the resubmission payload for a fetched snapshot.
///
/// The composition order is fixed: refresh, then zero the previous values,
/// then sanitize.
pub fn renewal_payload(fetched: &UsageDoc, millis_to_add: i64) -> UsageDoc {
    sanitize_usage_doc(&zero_usage(
        &refresh_usage(fetched, millis_to_add),
        UsageType::Previous,
    ))
}
