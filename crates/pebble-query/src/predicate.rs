//! Composable record predicates.

use std::fmt;
use std::ops::Bound;

use pebble_spatial::{Aabb, Point3};
use serde_json::Value;

use crate::value::{FieldPath, compare, equals};

/// Something a predicate can be evaluated against: a decoded payload plus
/// an optional position.
pub trait Subject {
    /// Value at `path` inside the payload, if present.
    fn field(&self, path: &FieldPath) -> Option<&Value>;

    /// Position of the record, if it has one.
    fn position(&self) -> Option<Point3>;
}

impl Subject for Value {
    fn field(&self, path: &FieldPath) -> Option<&Value> {
        path.resolve(self)
    }

    fn position(&self) -> Option<Point3> {
        None
    }
}

/// A boolean filter over record payload fields and positions.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// Matches every record.
    All,
    /// Field equals a value.
    Eq { field: FieldPath, value: Value },
    /// Field lies within bounds. Records whose field is missing or not
    /// comparable with a bound never match.
    Range {
        field: FieldPath,
        lower: Bound<Value>,
        upper: Bound<Value>,
    },
    /// Field is present (any value, including `null`).
    Exists { field: FieldPath },
    /// Record position is at most `radius` from `origin`.
    Within { origin: Point3, radius: f64 },
    /// Record position lies inside the box.
    Inside { region: Aabb },
    /// Every sub-predicate matches. An empty conjunction matches everything.
    And(Vec<Predicate>),
    /// At least one sub-predicate matches. An empty disjunction matches nothing.
    Or(Vec<Predicate>),
    /// The sub-predicate does not match.
    Not(Box<Predicate>),
}

impl Predicate {
    /// `field = value`
    #[must_use]
    pub fn eq(field: impl Into<FieldPath>, value: impl Into<Value>) -> Self {
        Self::Eq {
            field: field.into(),
            value: value.into(),
        }
    }

    /// Arbitrary bounds on `field`.
    #[must_use]
    pub fn range(field: impl Into<FieldPath>, lower: Bound<Value>, upper: Bound<Value>) -> Self {
        Self::Range {
            field: field.into(),
            lower,
            upper,
        }
    }

    /// `lo <= field <= hi`
    #[must_use]
    pub fn between(field: impl Into<FieldPath>, lo: impl Into<Value>, hi: impl Into<Value>) -> Self {
        Self::range(field, Bound::Included(lo.into()), Bound::Included(hi.into()))
    }

    /// `field > value`
    #[must_use]
    pub fn gt(field: impl Into<FieldPath>, value: impl Into<Value>) -> Self {
        Self::range(field, Bound::Excluded(value.into()), Bound::Unbounded)
    }

    /// `field >= value`
    #[must_use]
    pub fn ge(field: impl Into<FieldPath>, value: impl Into<Value>) -> Self {
        Self::range(field, Bound::Included(value.into()), Bound::Unbounded)
    }

    /// `field < value`
    #[must_use]
    pub fn lt(field: impl Into<FieldPath>, value: impl Into<Value>) -> Self {
        Self::range(field, Bound::Unbounded, Bound::Excluded(value.into()))
    }

    /// `field <= value`
    #[must_use]
    pub fn le(field: impl Into<FieldPath>, value: impl Into<Value>) -> Self {
        Self::range(field, Bound::Unbounded, Bound::Included(value.into()))
    }

    /// Field presence.
    #[must_use]
    pub fn exists(field: impl Into<FieldPath>) -> Self {
        Self::Exists { field: field.into() }
    }

    /// Sphere around `origin`.
    #[must_use]
    pub fn within(origin: impl Into<Point3>, radius: f64) -> Self {
        Self::Within {
            origin: origin.into(),
            radius,
        }
    }

    /// Axis-aligned box.
    #[must_use]
    pub fn inside(region: Aabb) -> Self {
        Self::Inside { region }
    }

    /// Conjunction, flattening nested `And`s.
    #[must_use]
    pub fn and(self, other: Self) -> Self {
        match (self, other) {
            (Self::All, p) | (p, Self::All) => p,
            (Self::And(mut a), Self::And(b)) => {
                a.extend(b);
                Self::And(a)
            }
            (Self::And(mut a), p) => {
                a.push(p);
                Self::And(a)
            }
            (p, Self::And(mut b)) => {
                b.insert(0, p);
                Self::And(b)
            }
            (a, b) => Self::And(vec![a, b]),
        }
    }

    /// Disjunction, flattening nested `Or`s.
    #[must_use]
    pub fn or(self, other: Self) -> Self {
        match (self, other) {
            (Self::Or(mut a), Self::Or(b)) => {
                a.extend(b);
                Self::Or(a)
            }
            (Self::Or(mut a), p) => {
                a.push(p);
                Self::Or(a)
            }
            (a, b) => Self::Or(vec![a, b]),
        }
    }

    /// Negation.
    #[must_use]
    pub fn negate(self) -> Self {
        match self {
            Self::Not(inner) => *inner,
            p => Self::Not(Box::new(p)),
        }
    }

    /// Evaluate against `subject`.
    pub fn matches<S: Subject + ?Sized>(&self, subject: &S) -> bool {
        match self {
            Self::All => true,
            Self::Eq { field, value } => subject.field(field).is_some_and(|v| equals(v, value)),
            Self::Range { field, lower, upper } => subject
                .field(field)
                .is_some_and(|v| satisfies_lower(v, lower) && satisfies_upper(v, upper)),
            Self::Exists { field } => subject.field(field).is_some(),
            Self::Within { origin, radius } => subject
                .position()
                .is_some_and(|p| origin.distance(&p) <= *radius),
            Self::Inside { region } => subject.position().is_some_and(|p| region.contains(&p)),
            Self::And(terms) => terms.iter().all(|t| t.matches(subject)),
            Self::Or(terms) => terms.iter().any(|t| t.matches(subject)),
            Self::Not(inner) => !inner.matches(subject),
        }
    }

    /// Whether evaluation needs the decoded payload. Pure position
    /// predicates can skip decoding entirely.
    #[must_use]
    pub fn needs_payload(&self) -> bool {
        match self {
            Self::All | Self::Within { .. } | Self::Inside { .. } => false,
            Self::Eq { .. } | Self::Range { .. } | Self::Exists { .. } => true,
            Self::And(terms) | Self::Or(terms) => terms.iter().any(Self::needs_payload),
            Self::Not(inner) => inner.needs_payload(),
        }
    }

    /// A sphere every match must lie in, if the predicate requires one at
    /// its top level. The tightest such sphere is returned.
    #[must_use]
    pub fn spatial_hint(&self) -> Option<(Point3, f64)> {
        match self {
            Self::Within { origin, radius } => Some((*origin, *radius)),
            Self::And(terms) => terms
                .iter()
                .filter_map(Self::spatial_hint)
                .min_by(|a, b| a.1.total_cmp(&b.1)),
            _ => None,
        }
    }
}

fn satisfies_lower(value: &Value, bound: &Bound<Value>) -> bool {
    match bound {
        Bound::Unbounded => true,
        Bound::Included(b) => compare(value, b).is_some_and(|o| o.is_ge()),
        Bound::Excluded(b) => compare(value, b).is_some_and(|o| o.is_gt()),
    }
}

fn satisfies_upper(value: &Value, bound: &Bound<Value>) -> bool {
    match bound {
        Bound::Unbounded => true,
        Bound::Included(b) => compare(value, b).is_some_and(|o| o.is_le()),
        Bound::Excluded(b) => compare(value, b).is_some_and(|o| o.is_lt()),
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => write!(f, "*"),
            Self::Eq { field, value } => write!(f, "{field} = {value}"),
            Self::Range { field, lower, upper } => {
                let lower = match lower {
                    Bound::Included(v) => Some(format!("{field} >= {v}")),
                    Bound::Excluded(v) => Some(format!("{field} > {v}")),
                    Bound::Unbounded => None,
                };
                let upper = match upper {
                    Bound::Included(v) => Some(format!("{field} <= {v}")),
                    Bound::Excluded(v) => Some(format!("{field} < {v}")),
                    Bound::Unbounded => None,
                };
                match (lower, upper) {
                    (Some(l), Some(u)) => write!(f, "({l} AND {u})"),
                    (Some(side), None) | (None, Some(side)) => write!(f, "{side}"),
                    (None, None) => write!(f, "has({field})"),
                }
            }
            Self::Exists { field } => write!(f, "has({field})"),
            Self::Within { origin, radius } => {
                write!(f, "within({:?}, {:?}, {:?}, {radius:?})", origin.x, origin.y, origin.z)
            }
            Self::Inside { region } => write!(
                f,
                "inside({:?}, {:?}, {:?}, {:?}, {:?}, {:?})",
                region.min.x, region.min.y, region.min.z, region.max.x, region.max.y, region.max.z
            ),
            Self::And(terms) => write_joined(f, terms, " AND ", "*"),
            Self::Or(terms) => write_joined(f, terms, " OR ", "NOT *"),
            Self::Not(inner) => write!(f, "NOT ({inner})"),
        }
    }
}

fn write_joined(f: &mut fmt::Formatter<'_>, terms: &[Predicate], sep: &str, empty: &str) -> fmt::Result {
    if terms.is_empty() {
        return write!(f, "{empty}");
    }

    write!(f, "(")?;
    for (i, term) in terms.iter().enumerate() {
        if i > 0 {
            write!(f, "{sep}")?;
        }
        write!(f, "{term}")?;
    }
    write!(f, ")")
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    struct Located {
        payload: Value,
        position: Option<Point3>,
    }

    impl Subject for Located {
        fn field(&self, path: &FieldPath) -> Option<&Value> {
            path.resolve(&self.payload)
        }

        fn position(&self) -> Option<Point3> {
            self.position
        }
    }

    #[test]
    fn test_equality_and_range() {
        let doc = json!({"faction": "red", "hp": 25});
        assert!(Predicate::eq("faction", "red").matches(&doc));
        assert!(!Predicate::eq("faction", "blue").matches(&doc));
        assert!(Predicate::between("hp", 10, 25).matches(&doc));
        assert!(!Predicate::lt("hp", 25).matches(&doc));
        assert!(Predicate::gt("hp", 24.5).matches(&doc));
        assert!(!Predicate::gt("missing", 0).matches(&doc));
    }

    #[test]
    fn test_conjunction_flattens() {
        let p = Predicate::eq("a", 1)
            .and(Predicate::eq("b", 2))
            .and(Predicate::eq("c", 3));
        let Predicate::And(terms) = &p else {
            panic!("expected conjunction");
        };
        assert_eq!(terms.len(), 3);
        assert!(p.matches(&json!({"a": 1, "b": 2, "c": 3})));
        assert!(!p.matches(&json!({"a": 1, "b": 2, "c": 4})));
        assert_eq!(Predicate::All.and(Predicate::eq("a", 1)), Predicate::eq("a", 1));
    }

    #[test]
    fn test_or_and_not() {
        let p = Predicate::eq("kind", "ship").or(Predicate::eq("kind", "station"));
        assert!(p.matches(&json!({"kind": "station"})));
        assert!(!p.matches(&json!({"kind": "asteroid"})));
        assert!(p.clone().negate().matches(&json!({"kind": "asteroid"})));
        assert_eq!(p.clone().negate().negate(), p);
        assert!(!Predicate::Or(Vec::new()).matches(&json!({})));
        assert!(Predicate::And(Vec::new()).matches(&json!({})));
    }

    #[test]
    fn test_position_predicates() {
        let near = Located {
            payload: json!({}),
            position: Some(Point3::new(3.0, 4.0, 0.0)),
        };
        let nowhere = Located {
            payload: json!({}),
            position: None,
        };

        assert!(Predicate::within(Point3::ORIGIN, 5.0).matches(&near));
        assert!(!Predicate::within(Point3::ORIGIN, 4.9).matches(&near));
        assert!(!Predicate::within(Point3::ORIGIN, 100.0).matches(&nowhere));

        let region = Aabb::from_corners(Point3::ORIGIN, Point3::new(3.0, 4.0, 1.0));
        assert!(Predicate::inside(region).matches(&near));
    }

    #[test]
    fn test_spatial_hint_picks_tightest_sphere() {
        let p = Predicate::within(Point3::ORIGIN, 50.0)
            .and(Predicate::eq("faction", "red"))
            .and(Predicate::within([1.0, 0.0, 0.0], 10.0));
        assert_eq!(p.spatial_hint(), Some((Point3::new(1.0, 0.0, 0.0), 10.0)));
        assert!(Predicate::eq("a", 1).spatial_hint().is_none());
        assert!(Predicate::within(Point3::ORIGIN, 1.0).negate().spatial_hint().is_none());
    }

    #[test]
    fn test_needs_payload() {
        assert!(!Predicate::within(Point3::ORIGIN, 1.0).needs_payload());
        assert!(!Predicate::All.needs_payload());
        assert!(
            Predicate::within(Point3::ORIGIN, 1.0)
                .and(Predicate::exists("x"))
                .needs_payload()
        );
    }
}
