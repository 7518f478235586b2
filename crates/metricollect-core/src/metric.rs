//! Metric values and declarative metric definitions.
//!
//! A [`MetricDefinition`] is a plain record (namespace, name, role tags,
//! unit, dimensions, value source) built with ordinary method calls.
//! [`MetricDefinition::evaluate`] turns it into a finished [`Metric`].

use std::fmt;
use std::process::Command;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::MetricError;

/// Build a metric identifier from its parts.
#[must_use]
pub fn metric_id(namespace: &str, name: &str) -> String {
    if namespace.is_empty() {
        name.to_string()
    } else {
        format!("{namespace}/{name}")
    }
}

/// Unit attached to a metric value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Unit {
    #[default]
    Count,
    Percent,
    Seconds,
    Milliseconds,
    Bytes,
    Kilobytes,
    Megabytes,
    Gigabytes,
    None,
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Count => "count",
            Self::Percent => "percent",
            Self::Seconds => "seconds",
            Self::Milliseconds => "milliseconds",
            Self::Bytes => "bytes",
            Self::Kilobytes => "kilobytes",
            Self::Megabytes => "megabytes",
            Self::Gigabytes => "gigabytes",
            Self::None => "none",
        };
        f.write_str(label)
    }
}

/// Name/value pair qualifying a metric.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimension {
    pub name: String,
    pub value: String,
}

/// A finished, publishable metric value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metric {
    pub namespace: String,
    pub name: String,
    pub value: f64,
    pub unit: Unit,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dimensions: Vec<Dimension>,
}

impl Metric {
    #[must_use]
    pub fn id(&self) -> String {
        metric_id(&self.namespace, &self.name)
    }
}

/// Metrics compare by identifier only.
impl PartialEq for Metric {
    fn eq(&self, other: &Self) -> bool {
        self.namespace == other.namespace && self.name == other.name
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={} {}", self.id(), self.value, self.unit)?;
        if !self.dimensions.is_empty() {
            let dims: Vec<String> = self
                .dimensions
                .iter()
                .map(|d| format!("{}={}", d.name, d.value))
                .collect();
            write!(f, " [{}]", dims.join(", "))?;
        }
        Ok(())
    }
}

type ValueFn = dyn Fn() -> Result<f64, String> + Send + Sync;

/// Where a metric's value comes from at evaluation time.
#[derive(Clone)]
pub enum ValueSource {
    Constant(f64),
    /// Shell pipeline run with `sh -c`; stdout must parse as a number.
    Command(String),
    Function(Arc<ValueFn>),
}

impl fmt::Debug for ValueSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Constant(v) => f.debug_tuple("Constant").field(v).finish(),
            Self::Command(cmd) => f.debug_tuple("Command").field(cmd).finish(),
            Self::Function(_) => f.write_str("Function(..)"),
        }
    }
}

/// Declarative metric record.
#[derive(Debug, Clone)]
pub struct MetricDefinition {
    namespace: String,
    name: String,
    roles: Vec<String>,
    unit: Unit,
    dimensions: Vec<Dimension>,
    source: ValueSource,
}

impl MetricDefinition {
    #[must_use]
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            roles: Vec::new(),
            unit: Unit::Count,
            dimensions: Vec::new(),
            source: ValueSource::Constant(0.0),
        }
    }

    #[must_use]
    pub fn roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roles.extend(roles.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn unit(mut self, unit: Unit) -> Self {
        self.unit = unit;
        self
    }

    #[must_use]
    pub fn dimension(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.dimensions.push(Dimension {
            name: name.into(),
            value: value.into(),
        });
        self
    }

    #[must_use]
    pub fn value(mut self, value: f64) -> Self {
        self.source = ValueSource::Constant(value);
        self
    }

    #[must_use]
    pub fn command(mut self, command: impl Into<String>) -> Self {
        self.source = ValueSource::Command(command.into());
        self
    }

    #[must_use]
    pub fn value_fn<F>(mut self, f: F) -> Self
    where
        F: Fn() -> Result<f64, String> + Send + Sync + 'static,
    {
        self.source = ValueSource::Function(Arc::new(f));
        self
    }

    /// Prefix the namespace, e.g. `development` + `System` → `development/System`.
    #[must_use]
    pub fn prefixed(mut self, prefix: &str) -> Self {
        if !prefix.is_empty() {
            self.namespace = metric_id(prefix, &self.namespace);
        }
        self
    }

    #[must_use]
    pub fn id(&self) -> String {
        metric_id(&self.namespace, &self.name)
    }

    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn declared_roles(&self) -> &[String] {
        &self.roles
    }

    /// Role filter: a metric without roles matches everything, an empty
    /// request matches everything, otherwise the sets must intersect.
    #[must_use]
    pub fn matches_roles(&self, requested: &[String]) -> bool {
        if self.roles.is_empty() || requested.is_empty() {
            return true;
        }
        self.roles.iter().any(|role| requested.contains(role))
    }

    /// Produce the metric value, stamped with the current time.
    pub fn evaluate(&self) -> Result<Metric, MetricError> {
        let value = match &self.source {
            ValueSource::Constant(v) => *v,
            ValueSource::Command(cmd) => run_value_command(&self.id(), cmd)?,
            ValueSource::Function(f) => f().map_err(|reason| MetricError::InvalidValue {
                id: self.id(),
                reason,
            })?,
        };

        if !value.is_finite() {
            return Err(MetricError::InvalidValue {
                id: self.id(),
                reason: format!("{value} is not finite"),
            });
        }

        Ok(Metric {
            namespace: self.namespace.clone(),
            name: self.name.clone(),
            value,
            unit: self.unit,
            timestamp: Utc::now(),
            dimensions: self.dimensions.clone(),
        })
    }
}

fn run_value_command(id: &str, command: &str) -> Result<f64, MetricError> {
    let output = Command::new("sh")
        .args(["-c", command])
        .output()
        .map_err(|e| MetricError::CommandFailed {
            id: id.to_string(),
            reason: e.to_string(),
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(MetricError::CommandFailed {
            id: id.to_string(),
            reason: format!("{}: {}", output.status, stderr.trim()),
        });
    }

    parse_value(&String::from_utf8_lossy(&output.stdout)).map_err(|reason| {
        MetricError::InvalidValue {
            id: id.to_string(),
            reason,
        }
    })
}

/// Parse command output as a number; surrounding whitespace and a trailing
/// `%` are ignored (`df` style output).
pub fn parse_value(raw: &str) -> Result<f64, String> {
    let trimmed = raw.trim();
    let trimmed = trimmed.strip_suffix('%').unwrap_or(trimmed).trim();
    trimmed
        .parse::<f64>()
        .map_err(|e| format!("cannot parse {trimmed:?} as a number: {e}"))
}
