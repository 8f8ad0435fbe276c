//! Typed values carried by settings and metrics.
//!
//! A value is exactly one of string, float or bool. Integer counters coming
//! from statistics views are widened to `Float` at the record boundary.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Value of a setting or metric.
///
/// Serialized untagged, so JSON carries plain scalars (`"on"`, `4096.0`, `true`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TypedValue {
    Bool(bool),
    Float(f64),
    String(String),
}

impl TypedValue {
    pub fn is_numeric(&self) -> bool {
        matches!(self, TypedValue::Float(_))
    }
}

impl fmt::Display for TypedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypedValue::Bool(v) => write!(f, "{}", if *v { "on" } else { "off" }),
            TypedValue::Float(v) => write!(f, "{}", v),
            TypedValue::String(v) => write!(f, "{}", v),
        }
    }
}

impl From<f64> for TypedValue {
    fn from(v: f64) -> Self {
        TypedValue::Float(v)
    }
}

impl From<i64> for TypedValue {
    fn from(v: i64) -> Self {
        TypedValue::Float(v as f64)
    }
}

impl From<bool> for TypedValue {
    fn from(v: bool) -> Self {
        TypedValue::Bool(v)
    }
}

impl From<String> for TypedValue {
    fn from(v: String) -> Self {
        TypedValue::String(v)
    }
}

impl From<&str> for TypedValue {
    fn from(v: &str) -> Self {
        TypedValue::String(v.to_string())
    }
}

/// Instance-level configuration parameter ("knob").
///
/// Bounds exist only for numeric values. Use [`Setting::numeric`] to build a
/// bounded setting; [`Setting::new`] never carries bounds.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Setting {
    pub name: String,
    pub value: TypedValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
}

impl Setting {
    /// Creates an unbounded setting of any kind.
    pub fn new(name: impl Into<String>, value: impl Into<TypedValue>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            min: None,
            max: None,
        }
    }

    /// Creates a numeric setting with optional bounds.
    pub fn numeric(name: impl Into<String>, value: f64, min: Option<f64>, max: Option<f64>) -> Self {
        Self {
            name: name.into(),
            value: TypedValue::Float(value),
            min,
            max,
        }
    }

    /// Drops bounds from a non-numeric setting.
    ///
    /// Deserialized requests may carry bounds next to a string or bool value.
    pub fn normalized(mut self) -> Self {
        if !self.value.is_numeric() {
            self.min = None;
            self.max = None;
        }
        self
    }
}

/// Whether a metric is instance-wide or describes a single relation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum Scope {
    /// Never present on a produced metric; marks a failed collection.
    #[default]
    Unspecified,
    General,
    PerObject,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Unspecified => "unspecified",
            Scope::General => "general",
            Scope::PerObject => "table",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scope {
    type Err = std::convert::Infallible;

    /// Unknown text maps to `Unspecified`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "general" => Scope::General,
            "table" => Scope::PerObject,
            _ => Scope::Unspecified,
        })
    }
}

impl Serialize for Scope {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Scope {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(s.parse().unwrap_or_default())
    }
}

/// Named, typed, scope-tagged observed statistic.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub name: String,
    pub value: TypedValue,
    pub scope: Scope,
}

/// Explicit field list of a statistics record.
///
/// Field order is part of the observable output: metrics are emitted in the
/// order returned here. A `None` value (e.g. a NULL timestamp) is skipped.
pub trait MetricFields {
    fn fields(&self) -> Vec<(&'static str, Option<TypedValue>)>;
}

/// Flattens a record into one metric per field, each inheriting `scope`.
pub fn to_metrics<T: MetricFields + ?Sized>(record: &T, scope: Scope) -> Vec<Metric> {
    record
        .fields()
        .into_iter()
        .filter_map(|(name, value)| {
            value.map(|value| Metric {
                name: name.to_string(),
                value,
                scope,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Pair {
        a: i64,
        b: Option<String>,
    }

    impl MetricFields for Pair {
        fn fields(&self) -> Vec<(&'static str, Option<TypedValue>)> {
            vec![
                ("A", Some(self.a.into())),
                ("B", self.b.clone().map(TypedValue::from)),
            ]
        }
    }

    #[test]
    fn scope_text_round_trip() {
        for scope in [Scope::General, Scope::PerObject, Scope::Unspecified] {
            assert_eq!(scope.to_string().parse::<Scope>().unwrap(), scope);
        }
        assert_eq!("index".parse::<Scope>().unwrap(), Scope::Unspecified);
    }

    #[test]
    fn to_metrics_keeps_order_and_scope() {
        let metrics = to_metrics(
            &Pair {
                a: 7,
                b: Some("x".into()),
            },
            Scope::PerObject,
        );
        let names: Vec<&str> = metrics.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, ["A", "B"]);
        assert_eq!(metrics[0].value, TypedValue::Float(7.0));
        assert!(metrics.iter().all(|m| m.scope == Scope::PerObject));
    }

    #[test]
    fn to_metrics_skips_absent_fields() {
        let metrics = to_metrics(&Pair { a: 1, b: None }, Scope::General);
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].name, "A");
    }

    #[test]
    fn normalized_drops_bounds_from_non_numeric() {
        let mut s = Setting::new("wal_level", "replica");
        s.min = Some(1.0);
        s.max = Some(2.0);
        let s = s.normalized();
        assert_eq!(s.min, None);
        assert_eq!(s.max, None);

        let n = Setting::numeric("work_mem", 4096.0, Some(64.0), None).normalized();
        assert_eq!(n.min, Some(64.0));
    }

    #[test]
    fn typed_value_json_is_plain_scalar() {
        let s = Setting::numeric("work_mem", 4096.0, Some(64.0), Some(2147483647.0));
        let json = serde_json::to_string(&s).unwrap();
        assert_eq!(
            json,
            r#"{"name":"work_mem","value":4096.0,"min":64.0,"max":2147483647.0}"#
        );

        let parsed: Setting = serde_json::from_str(r#"{"name":"jit","value":false}"#).unwrap();
        assert_eq!(parsed.value, TypedValue::Bool(false));
        assert_eq!(parsed.min, None);
    }
}
