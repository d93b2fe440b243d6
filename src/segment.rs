use serde::{Deserialize, Serialize};

use crate::rule::Clause;
use crate::user::{BucketPrefix, User};
use crate::variation::VariationWeight;

/// A named cohort of users, referenced from flag rules via the segment-match operator.
///
/// Membership is decided by the exclusion list, then the inclusion list, then the rules in
/// order.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    pub key: String,

    #[serde(default)]
    pub included: Vec<String>,
    #[serde(default)]
    pub excluded: Vec<String>,
    #[serde(default)]
    rules: Vec<SegmentRule>,
    #[serde(default)]
    salt: String,

    #[serde(default)]
    pub version: u64,
}

/// A rule within a segment. Unlike flag rules, segment rules carry no variation; a match means
/// membership, optionally diluted by a percentage weight.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
struct SegmentRule {
    clauses: Vec<Clause>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    weight: Option<VariationWeight>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    bucket_by: Option<String>,
}

impl Segment {
    pub fn contains(&self, user: &User) -> bool {
        let user_key = user.key().to_string();

        if self.excluded.contains(&user_key) {
            return false;
        }
        if self.included.contains(&user_key) {
            return true;
        }

        for rule in &self.rules {
            if rule.matches(user, &self.key, &self.salt) {
                return true;
            }
        }

        false
    }
}

impl SegmentRule {
    pub fn matches(&self, user: &User, key: &str, salt: &str) -> bool {
        // a rule matches if _all_ of its clauses do
        for clause in &self.clauses {
            if !clause.matches_non_segment(user) {
                return false;
            }
        }

        match self.weight {
            Some(weight) if weight >= 0.0 => {
                let bucket_by = self.bucket_by.as_deref();
                let prefix = BucketPrefix::KeyAndSalt(key, salt);
                let bucket = (100_000.0 * user.bucket(bucket_by, prefix)).trunc();
                bucket < weight
            }
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::user::AttributeValue;

    fn new_segment() -> Segment {
        Segment {
            key: "segkey".to_string(),
            included: vec![],
            excluded: vec![],
            rules: vec![],
            salt: "salty".to_string(),
            version: 1,
        }
    }

    fn jane_rule(weight: Option<f32>, bucket_by: Option<String>) -> SegmentRule {
        SegmentRule {
            clauses: vec![Clause::new_match(
                "name",
                AttributeValue::String("Jane".to_string()),
            )],
            weight,
            bucket_by,
        }
    }

    fn thirty_percent_rule(bucket_by: Option<String>) -> SegmentRule {
        SegmentRule {
            clauses: vec![Clause::new_match(
                "key",
                AttributeValue::String("key".to_string()),
            )],
            weight: Some(30_000.0),
            bucket_by,
        }
    }

    #[test]
    fn segment_rule_parse() {
        let rule: SegmentRule =
            serde_json::from_str(r#"{"clauses": [], "weight": null, "bucketBy": null}"#)
                .expect("should parse");
        assert_eq!(
            rule,
            SegmentRule {
                clauses: vec![],
                weight: None,
                bucket_by: None,
            }
        );

        let rule: SegmentRule = serde_json::from_str(
            r#"{
                "clauses":[{
                    "attribute": "name",
                    "negate": false,
                    "op": "in",
                    "values": ["xyz"]
                }],
                "weight": 10000,
                "bucketBy": "country"
            }"#,
        )
        .expect("should parse");
        assert_eq!(rule.weight, Some(10_000.0));
        assert_eq!(rule.bucket_by, Some("country".to_string()));
    }

    #[test]
    fn user_is_explicitly_included_in_segment() {
        let mut segment = new_segment();
        segment.included.push("foo".to_string());
        segment.included.push("bar".to_string());
        let user = User::with_key("bar").build();
        assert!(segment.contains(&user));
    }

    #[test]
    fn user_is_matched_by_segment_rule() {
        let mut segment = new_segment();
        segment.rules.push(jane_rule(None, None));
        let jane = User::with_key("foo").name("Jane").build();
        let joan = User::with_key("foo").name("Joan").build();
        assert!(segment.contains(&jane));
        assert!(!segment.contains(&joan));
    }

    #[test]
    fn user_is_explicitly_excluded_from_segment() {
        let mut segment = new_segment();
        segment.rules.push(jane_rule(None, None));
        segment.excluded.push("foo".to_string());
        segment.excluded.push("bar".to_string());
        let jane = User::with_key("foo").name("Jane").build();
        assert!(!segment.contains(&jane));
    }

    #[test]
    fn segment_excludes_override_includes() {
        let mut segment = new_segment();
        segment.included.push("bar".to_string());
        segment.excluded.push("bar".to_string());
        let user = User::with_key("bar").build();
        assert!(!segment.contains(&user));
    }

    #[test]
    fn segment_does_not_match_if_no_includes_or_rules_match() {
        let mut segment = new_segment();
        segment.rules.push(jane_rule(None, None));
        segment.included.push("key".to_string());
        let user = User::with_key("other-key").name("Bob").build();
        assert!(!segment.contains(&user));
    }

    #[test]
    fn segment_rule_can_match_user_with_percentage_rollout() {
        let mut segment = new_segment();
        segment.rules.push(jane_rule(Some(99_999.0), None));
        let user = User::with_key("key").name("Jane").build();
        assert!(segment.contains(&user));
    }

    #[test]
    fn segment_rule_can_not_match_user_with_percentage_rollout() {
        let mut segment = new_segment();
        segment.rules.push(jane_rule(Some(1.0), None));
        let user = User::with_key("key").name("Jane").build();
        assert!(!segment.contains(&user));
    }

    #[test]
    fn segment_rule_can_have_percentage_rollout() {
        let mut segment = new_segment();
        segment.rules.push(SegmentRule {
            clauses: vec![],
            weight: Some(30_000.0),
            bucket_by: None,
        });

        let user_a = User::with_key("userKeyA").build(); // bucket 0.14574753
        let user_z = User::with_key("userKeyZ").build(); // bucket 0.45679215
        assert!(segment.contains(&user_a));
        assert!(!segment.contains(&user_z));
    }

    #[test]
    fn segment_rule_can_have_percentage_rollout_by_any_attribute() {
        let mut segment = new_segment();
        segment
            .rules
            .push(thirty_percent_rule(Some("name".to_string())));
        let user_a = User::with_key("key").name("userKeyA").build(); // bucket 0.14574753
        let user_z = User::with_key("key").name("userKeyZ").build(); // bucket 0.45679215
        assert!(segment.contains(&user_a));
        assert!(!segment.contains(&user_z));
    }

    #[test]
    fn parse_ignores_unknown_fields() {
        let segment: Segment = serde_json::from_str(
            r#"{"key": "s", "included": [], "excluded": [], "rules": [],
                "salt": "x", "version": 3, "unbounded": true, "generation": 2}"#,
        )
        .unwrap();
        assert_eq!(segment.version, 3);
    }
}
