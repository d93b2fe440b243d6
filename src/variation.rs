use serde::{Deserialize, Serialize};

use crate::user::{BucketPrefix, User};

pub type VariationIndex = usize;

pub(crate) type VariationWeight = f32;

/// The outcome of resolving a variation or rollout for a particular user.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BucketResult {
    pub variation_index: VariationIndex,
    pub in_experiment: bool,
}

/// Either a fixed variation index or a percentage rollout over several variations.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(untagged)]
pub enum VariationOrRollout {
    Variation {
        variation: VariationIndex,
    },
    Rollout {
        rollout: Rollout,
    },
    /// Anything that parses as neither of the above. Kept rather than rejected so a single bad
    /// rule cannot poison an entire payload; resolving it fails the evaluation instead.
    Malformed(serde_json::Value),
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Rollout {
    #[serde(default)]
    kind: RolloutKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    bucket_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    seed: Option<i64>,
    variations: Vec<WeightedVariation>,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum RolloutKind {
    /// A plain percentage rollout.
    Rollout,
    /// An experiment: evaluation reasons carry `in_experiment` for tracked buckets.
    Experiment,
}

impl Default for RolloutKind {
    fn default() -> Self {
        RolloutKind::Rollout
    }
}

/// One slice of a rollout. Weights are in units of 0.001%, so they sum to 100000.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct WeightedVariation {
    pub variation: VariationIndex,
    pub weight: VariationWeight,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub untracked: bool,
}

impl WeightedVariation {
    fn result(&self, experiment_kind: bool) -> BucketResult {
        BucketResult {
            variation_index: self.variation,
            in_experiment: experiment_kind && !self.untracked,
        }
    }
}

impl VariationOrRollout {
    /// Resolve to a concrete variation index for the user, or None if this value is malformed
    /// (unparseable, or a rollout with no variations).
    pub(crate) fn variation(
        &self,
        flag_key: &str,
        user: &User,
        salt: &str,
    ) -> Option<BucketResult> {
        match self {
            VariationOrRollout::Variation { variation } => Some(BucketResult {
                variation_index: *variation,
                in_experiment: false,
            }),
            VariationOrRollout::Rollout { rollout } => {
                let experiment_kind = rollout.kind == RolloutKind::Experiment;
                let prefix = match rollout.seed {
                    Some(seed) => BucketPrefix::Seed(seed),
                    None => BucketPrefix::KeyAndSalt(flag_key, salt),
                };
                let bucket =
                    (100_000.0 * user.bucket(rollout.bucket_by.as_deref(), prefix)).trunc();

                let mut sum = 0.0;
                for weighted_variation in &rollout.variations {
                    sum += weighted_variation.weight;
                    if bucket < sum {
                        return Some(weighted_variation.result(experiment_kind));
                    }
                }
                // weights summing short of 100000 leave a gap; the last slice absorbs it
                rollout
                    .variations
                    .last()
                    .map(|weighted_variation| weighted_variation.result(experiment_kind))
            }
            VariationOrRollout::Malformed(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spectral::prelude::*;

    fn wv(variation: VariationIndex, weight: f32) -> WeightedVariation {
        WeightedVariation {
            variation,
            weight,
            untracked: false,
        }
    }

    #[test]
    fn parse_fixed_variation() {
        let parsed: VariationOrRollout = serde_json::from_str(r#"{"variation": 2}"#).unwrap();
        assert_that!(parsed).is_equal_to(VariationOrRollout::Variation { variation: 2 });
    }

    #[test]
    fn parse_rollout() {
        let parsed: VariationOrRollout = serde_json::from_str(
            r#"{"rollout": {"variations": [{"variation": 0, "weight": 60000},
                                           {"variation": 1, "weight": 40000}]}}"#,
        )
        .unwrap();
        assert_that!(parsed).is_equal_to(VariationOrRollout::Rollout {
            rollout: Rollout {
                kind: RolloutKind::Rollout,
                bucket_by: None,
                seed: None,
                variations: vec![wv(0, 60000.0), wv(1, 40000.0)],
            },
        });
    }

    #[test]
    fn parse_rollout_with_seed_and_bucket_by() {
        let parsed: VariationOrRollout = serde_json::from_str(
            r#"{"rollout": {"kind": "experiment", "seed": 61, "bucketBy": "team",
                            "variations": [{"variation": 0, "weight": 100000, "untracked": true}]}}"#,
        )
        .unwrap();
        if let VariationOrRollout::Rollout { rollout } = &parsed {
            assert_eq!(rollout.kind, RolloutKind::Experiment);
            assert_eq!(rollout.seed, Some(61));
            assert_eq!(rollout.bucket_by.as_deref(), Some("team"));
            assert!(rollout.variations[0].untracked);
        } else {
            panic!("expected rollout, got {:?}", parsed);
        }
    }

    #[test]
    fn parse_malformed_is_tolerated() {
        let parsed: VariationOrRollout = serde_json::from_str(r#"{"unrelated": true}"#).unwrap();
        assert!(matches!(parsed, VariationOrRollout::Malformed(_)));

        let user = User::with_key("x").build();
        assert_that!(parsed.variation("flag", &user, "salt")).is_none();
    }

    #[test]
    fn fixed_variation_is_never_an_experiment() {
        let vr = VariationOrRollout::Variation { variation: 1 };
        let user = User::with_key("x").build();
        assert_that!(vr.variation("flag", &user, "salt")).contains_value(BucketResult {
            variation_index: 1,
            in_experiment: false,
        });
    }

    #[test]
    fn rollout_buckets_split_by_weight() {
        // userKeyA buckets to 0.42157587, userKeyB to 0.6708485 under hashKey/saltyA
        let vr = VariationOrRollout::Rollout {
            rollout: Rollout {
                kind: RolloutKind::Rollout,
                bucket_by: None,
                seed: None,
                variations: vec![wv(0, 60000.0), wv(1, 40000.0)],
            },
        };
        let user_a = User::with_key("userKeyA").build();
        let user_b = User::with_key("userKeyB").build();
        assert_eq!(
            vr.variation("hashKey", &user_a, "saltyA")
                .map(|r| r.variation_index),
            Some(0)
        );
        assert_eq!(
            vr.variation("hashKey", &user_b, "saltyA")
                .map(|r| r.variation_index),
            Some(1)
        );
    }

    #[test]
    fn incomplete_weighting_defaults_to_last_variation() {
        // userKeyC buckets to 0.10343106; the weights cover only the first 0.3% of the space
        let vr = VariationOrRollout::Rollout {
            rollout: Rollout {
                kind: RolloutKind::Rollout,
                bucket_by: None,
                seed: None,
                variations: vec![wv(0, 100.0), wv(1, 100.0), wv(2, 100.0)],
            },
        };
        let user = User::with_key("userKeyC").build();
        assert_that!(vr.variation("hashKey", &user, "saltyA")).contains_value(BucketResult {
            variation_index: 2,
            in_experiment: false,
        });
    }

    #[test]
    fn empty_rollout_is_malformed() {
        let vr = VariationOrRollout::Rollout {
            rollout: Rollout {
                kind: RolloutKind::Rollout,
                bucket_by: None,
                seed: None,
                variations: vec![],
            },
        };
        let user = User::with_key("x").build();
        assert_that!(vr.variation("flag", &user, "salt")).is_none();
    }

    #[test]
    fn untracked_experiment_slice_is_not_in_experiment() {
        let vr = VariationOrRollout::Rollout {
            rollout: Rollout {
                kind: RolloutKind::Experiment,
                bucket_by: None,
                seed: None,
                variations: vec![WeightedVariation {
                    variation: 0,
                    weight: 100_000.0,
                    untracked: true,
                }],
            },
        };
        let user = User::with_key("x").build();
        assert_that!(vr.variation("flag", &user, "salt")).contains_value(BucketResult {
            variation_index: 0,
            in_experiment: false,
        });
    }

    #[test]
    fn serialization_round_trip() {
        let json = r#"{"rollout":{"kind":"experiment","seed":7,"variations":[{"variation":0,"weight":100000.0}]}}"#;
        let parsed: VariationOrRollout = serde_json::from_str(json).unwrap();
        let reparsed: VariationOrRollout =
            serde_json::from_str(&serde_json::to_string(&parsed).unwrap()).unwrap();
        assert_eq!(parsed, reparsed);
    }
}
