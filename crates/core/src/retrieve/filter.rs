//! Tag predicates for retrieval.
//!
//! A [`TagFilter`] holds `must` conditions (all must hold) and `must_not`
//! conditions (none may hold). Operators: `eq`, `ne`, `gt`, `lt`, `gte`,
//! `lte`, `in`. Ordering operators compare numerically; a missing tag never
//! satisfies a condition.

use crate::chunk::{TagValue, Tags};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TagFilter {
    #[serde(default)]
    pub must: Vec<TagCondition>,
    #[serde(default)]
    pub must_not: Vec<TagCondition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagCondition {
    pub field: String,
    pub op: TagOperator,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<Vec<serde_json::Value>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TagOperator {
    Eq,
    Ne,
    Gt,
    Lt,
    Gte,
    Lte,
    In,
}

impl TagCondition {
    pub fn new(field: &str, op: TagOperator, value: serde_json::Value) -> Self {
        Self {
            field: field.to_string(),
            op,
            value: Some(value),
            values: None,
        }
    }

    pub fn one_of(field: &str, values: Vec<serde_json::Value>) -> Self {
        Self {
            field: field.to_string(),
            op: TagOperator::In,
            value: None,
            values: Some(values),
        }
    }

    fn validate(&self) -> Result<()> {
        let bad = |why: &str| Err(Error::InvalidQuery(format!("tag filter on '{}': {}", self.field, why)));
        if self.field.trim().is_empty() {
            return Err(Error::InvalidQuery("tag filter with empty field name".into()));
        }
        match self.op {
            TagOperator::In => match &self.values {
                Some(values) if !values.is_empty() => Ok(()),
                _ => bad("'in' needs a non-empty 'values' list"),
            },
            TagOperator::Eq | TagOperator::Ne => match &self.value {
                Some(v) if !v.is_null() && !v.is_array() && !v.is_object() => Ok(()),
                _ => bad("needs a scalar 'value'"),
            },
            TagOperator::Gt | TagOperator::Lt | TagOperator::Gte | TagOperator::Lte => {
                match self.value.as_ref().and_then(|v| v.as_f64()) {
                    Some(_) => Ok(()),
                    None => bad("ordering operators need a numeric 'value'"),
                }
            }
        }
    }

    fn holds(&self, tags: &Tags) -> bool {
        let Some(tag) = tags.get(&self.field) else {
            return false;
        };
        let value = self.value.as_ref();
        match self.op {
            TagOperator::Eq => value.is_some_and(|v| tag_eq(tag, v)),
            TagOperator::Ne => value.is_some_and(|v| !tag_eq(tag, v)),
            TagOperator::Gt => value.and_then(|v| tag_cmp(tag, v)) == Some(Ordering::Greater),
            TagOperator::Lt => value.and_then(|v| tag_cmp(tag, v)) == Some(Ordering::Less),
            TagOperator::Gte => value
                .and_then(|v| tag_cmp(tag, v))
                .is_some_and(|o| o != Ordering::Less),
            TagOperator::Lte => value
                .and_then(|v| tag_cmp(tag, v))
                .is_some_and(|o| o != Ordering::Greater),
            TagOperator::In => self
                .values
                .as_ref()
                .is_some_and(|vs| vs.iter().any(|v| tag_eq(tag, v))),
        }
    }
}

impl TagFilter {
    pub fn is_empty(&self) -> bool {
        self.must.is_empty() && self.must_not.is_empty()
    }

    /// Reject malformed conditions up front, as `InvalidQuery`.
    pub fn validate(&self) -> Result<()> {
        self.must
            .iter()
            .chain(self.must_not.iter())
            .try_for_each(TagCondition::validate)
    }

    pub fn matches(&self, tags: &Tags) -> bool {
        self.must.iter().all(|c| c.holds(tags)) && !self.must_not.iter().any(|c| c.holds(tags))
    }
}

fn tag_eq(tag: &TagValue, json: &serde_json::Value) -> bool {
    match (tag, json) {
        (TagValue::String(s), serde_json::Value::String(js)) => s == js,
        (TagValue::Boolean(b), serde_json::Value::Bool(jb)) => b == jb,
        (TagValue::Integer(i), serde_json::Value::Number(n)) => {
            n.as_i64() == Some(*i) || n.as_f64().is_some_and(|f| (*i as f64 - f).abs() < f64::EPSILON)
        }
        (TagValue::Float(f), serde_json::Value::Number(n)) => {
            n.as_f64().is_some_and(|nf| (*f - nf).abs() < f64::EPSILON)
        }
        _ => false,
    }
}

fn tag_cmp(tag: &TagValue, json: &serde_json::Value) -> Option<Ordering> {
    let left = match tag {
        TagValue::Integer(i) => *i as f64,
        TagValue::Float(f) => *f,
        _ => return None,
    };
    left.partial_cmp(&json.as_f64()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tags() -> Tags {
        let mut t = Tags::new();
        t.insert("source".into(), TagValue::from("reports/q3.pdf"));
        t.insert("page_start".into(), TagValue::Integer(4));
        t.insert("element".into(), TagValue::from("table"));
        t.insert("reviewed".into(), TagValue::Boolean(true));
        t
    }

    #[test]
    fn test_eq_and_in() {
        let f = TagFilter {
            must: vec![
                TagCondition::new("element", TagOperator::Eq, json!("table")),
                TagCondition::one_of("source", vec![json!("a.pdf"), json!("reports/q3.pdf")]),
            ],
            must_not: vec![],
        };
        assert!(f.matches(&tags()));
    }

    #[test]
    fn test_numeric_ranges() {
        let t = tags();
        let gte = TagCondition::new("page_start", TagOperator::Gte, json!(4));
        let lt = TagCondition::new("page_start", TagOperator::Lt, json!(4));
        assert!(gte.holds(&t));
        assert!(!lt.holds(&t));
        assert!(TagCondition::new("page_start", TagOperator::Gt, json!(3.5)).holds(&t));
    }

    #[test]
    fn test_must_not_and_missing_field() {
        let f = TagFilter {
            must: vec![],
            must_not: vec![TagCondition::new("reviewed", TagOperator::Eq, json!(true))],
        };
        assert!(!f.matches(&tags()));
        let missing = TagCondition::new("section", TagOperator::Ne, json!("intro"));
        assert!(!missing.holds(&tags()));
    }

    #[test]
    fn test_validate_rejects_malformed_conditions() {
        let no_values = TagFilter {
            must: vec![TagCondition::one_of("source", vec![])],
            must_not: vec![],
        };
        assert!(matches!(no_values.validate(), Err(Error::InvalidQuery(_))));

        let text_range = TagFilter {
            must: vec![TagCondition::new("page_start", TagOperator::Gt, json!("four"))],
            must_not: vec![],
        };
        assert!(text_range.validate().is_err());

        let null_eq = TagFilter {
            must: vec![],
            must_not: vec![TagCondition::new("element", TagOperator::Eq, json!(null))],
        };
        assert!(null_eq.validate().is_err());
        assert!(TagFilter::default().validate().is_ok());
    }

    #[test]
    fn test_deserializes_from_json() {
        let f: TagFilter = serde_json::from_value(json!({
            "must": [{"field": "element", "op": "eq", "value": "text"}]
        }))
        .unwrap();
        assert_eq!(f.must[0].op, TagOperator::Eq);
        assert!(f.must_not.is_empty());
    }
}
