//! Record predicates for the vault query engine.
//!
//! Predicates combine payload field filters with spatial filters. They can
//! be built in code or parsed from text.
//!
//! # Syntax
//!
//! ```text
//! faction = 'red'                      // field equality
//! hp >= 10 AND hp < 50                 // range, conjunction
//! kind = "ship" || kind = "station"    // disjunction
//! NOT has(cargo.0)                     // field presence, negation
//! within(0, 0, 0, 25.5)                // sphere around a point
//! inside(0, 0, 0, 10, 10, 10)          // axis-aligned box
//! *                                    // everything
//! ```
//!
//! # Examples
//!
//! ```
//! use pebble_query::{Predicate, parse_predicate};
//! use serde_json::json;
//!
//! let predicate = parse_predicate("faction = 'red' AND hp >= 10").unwrap();
//! assert!(predicate.matches(&json!({"faction": "red", "hp": 12})));
//! assert!(!predicate.matches(&json!({"faction": "red", "hp": 3})));
//!
//! let built = Predicate::eq("faction", "red").and(Predicate::ge("hp", 10));
//! assert_eq!(predicate, built);
//! ```

mod parser;
mod predicate;
mod value;

pub use parser::{ParseError, parse_predicate};
pub use predicate::{Predicate, Subject};
pub use value::{FieldPath, compare, equals};

#[cfg(test)]
mod tests {
    use std::ops::Bound;

    use pebble_spatial::{Aabb, Point3};
    use serde_json::json;

    use super::*;

    #[test]
    fn test_simple_equality() {
        let p = parse_predicate("faction = 'red'").unwrap();
        assert_eq!(p, Predicate::eq("faction", "red"));

        let p = parse_predicate(r#"faction == "red""#).unwrap();
        assert_eq!(p, Predicate::eq("faction", "red"));
    }

    #[test]
    fn test_comparison_operators() {
        assert_eq!(parse_predicate("hp < 5").unwrap(), Predicate::lt("hp", 5));
        assert_eq!(parse_predicate("hp <= 5").unwrap(), Predicate::le("hp", 5));
        assert_eq!(parse_predicate("hp > -2.5").unwrap(), Predicate::gt("hp", -2.5));
        assert_eq!(parse_predicate("hp >= 1e3").unwrap(), Predicate::ge("hp", 1000.0));
        assert_eq!(
            parse_predicate("hp != 0").unwrap(),
            Predicate::eq("hp", 0).negate()
        );
    }

    #[test]
    fn test_literals() {
        assert_eq!(parse_predicate("alive = true").unwrap(), Predicate::eq("alive", true));
        assert_eq!(parse_predicate("owner = null").unwrap(), Predicate::eq("owner", json!(null)));
        assert_eq!(
            parse_predicate(r"name = 'o\'neil'").unwrap(),
            Predicate::eq("name", "o'neil")
        );
        assert_eq!(
            parse_predicate(r#"name = "tab\there""#).unwrap(),
            Predicate::eq("name", "tab\there")
        );
    }

    #[test]
    fn test_precedence_and_grouping() {
        let p = parse_predicate("a = 1 OR b = 2 AND c = 3").unwrap();
        assert_eq!(
            p,
            Predicate::eq("a", 1).or(Predicate::eq("b", 2).and(Predicate::eq("c", 3)))
        );

        let p = parse_predicate("(a = 1 || b = 2) && c = 3").unwrap();
        assert_eq!(
            p,
            Predicate::eq("a", 1).or(Predicate::eq("b", 2)).and(Predicate::eq("c", 3))
        );

        let p = parse_predicate("a = 1, b = 2").unwrap();
        assert_eq!(p, Predicate::eq("a", 1).and(Predicate::eq("b", 2)));
    }

    #[test]
    fn test_keywords_are_case_insensitive() {
        let p = parse_predicate("not a = 1 and b = 2").unwrap();
        assert_eq!(p, Predicate::eq("a", 1).negate().and(Predicate::eq("b", 2)));

        // A field may start with a keyword.
        let p = parse_predicate("notes = 'x'").unwrap();
        assert_eq!(p, Predicate::eq("notes", "x"));
    }

    #[test]
    fn test_spatial_functions() {
        let p = parse_predicate("within(1, -2, 3.5, 10)").unwrap();
        assert_eq!(p, Predicate::within(Point3::new(1.0, -2.0, 3.5), 10.0));

        let p = parse_predicate("INSIDE(10, 0, 0, 0, 5, 5)").unwrap();
        assert_eq!(
            p,
            Predicate::inside(Aabb::from_corners(
                Point3::new(0.0, 0.0, 0.0),
                Point3::new(10.0, 5.0, 5.0)
            ))
        );

        let p = parse_predicate("!has(stats.hp)").unwrap();
        assert_eq!(p, Predicate::exists("stats.hp").negate());
    }

    #[test]
    fn test_wildcard() {
        assert_eq!(parse_predicate("*").unwrap(), Predicate::All);
        assert_eq!(parse_predicate("  *  ").unwrap(), Predicate::All);
    }

    #[test]
    fn test_errors_carry_position() {
        let err = parse_predicate("").unwrap_err();
        assert_eq!(err.position, 0);

        let err = parse_predicate("hp >").unwrap_err();
        assert_eq!(err.position, 4);

        let err = parse_predicate("hp = 1 )").unwrap_err();
        assert_eq!(err.position, 7);

        assert!(parse_predicate("within(0, 0, 0)").is_err());
        assert!(parse_predicate("within(0, 0, 0, -1)").is_err());
        assert!(parse_predicate("teleport(1)").is_err());
        assert!(parse_predicate("name = 'open").is_err());
        assert!(parse_predicate("(a = 1").is_err());
    }

    #[test]
    fn test_display_reparses() {
        let original = Predicate::eq("faction", "red")
            .and(Predicate::gt("hp", 10))
            .and(Predicate::within(Point3::new(0.5, 0.0, -1.0), 25.0))
            .and(Predicate::exists("cargo").negate())
            .or(Predicate::inside(Aabb::from_corners(
                Point3::ORIGIN,
                Point3::new(1.0, 1.0, 1.0),
            )));

        let reparsed = parse_predicate(&original.to_string()).unwrap();
        assert_eq!(reparsed, original);
    }

    #[test]
    fn test_two_sided_range_display_is_equivalent() {
        let range = Predicate::range("hp", Bound::Included(json!(1)), Bound::Excluded(json!(5)));
        let reparsed = parse_predicate(&range.to_string()).unwrap();

        for hp in 0..7 {
            let doc = json!({ "hp": hp });
            assert_eq!(range.matches(&doc), reparsed.matches(&doc), "hp = {hp}");
        }
    }
}
