#![cfg(test)]

use std::cell::RefCell;
use std::collections::HashMap;

use serde_json::json;

use crate::eval::{PrerequisiteEvent, PrerequisiteEventRecorder};
use crate::flag::Flag;
use crate::segment::Segment;
use crate::store::{AllData, StorageItem, Store};

/// An on flag with two boolean variations, falling through to `true`.
pub fn basic_flag(key: &str) -> Flag {
    serde_json::from_value(json!({
        "key": key,
        "version": 1,
        "on": true,
        "targets": [],
        "rules": [],
        "prerequisites": [],
        "fallthrough": {"variation": 1},
        "offVariation": 0,
        "variations": [false, true],
        "clientSideAvailability": {
            "usingEnvironmentId": false,
            "usingMobileKey": false
        },
        "salt": "salty"
    }))
    .unwrap()
}

/// An off flag whose off variation returns `off_value`.
pub fn basic_off_flag(key: &str, off_value: bool) -> Flag {
    serde_json::from_value(json!({
        "key": key,
        "version": 1,
        "on": false,
        "targets": [],
        "rules": [],
        "prerequisites": [],
        "fallthrough": {"variation": 0},
        "offVariation": if off_value { 1 } else { 0 },
        "variations": [false, true],
        "clientSideAvailability": {
            "usingEnvironmentId": false,
            "usingMobileKey": false
        },
        "salt": "salty"
    }))
    .unwrap()
}

/// Like [basic_flag], with a single prerequisite on `prereq_key` requiring variation 1.
pub fn flag_with_prereq(key: &str, prereq_key: &str) -> Flag {
    let mut flag = basic_flag(key);
    flag.prerequisites = vec![serde_json::from_value(json!({
        "key": prereq_key,
        "variation": 1
    }))
    .unwrap()];
    flag
}

/// Like [basic_flag], with a rule matching members of `segment_key`.
pub fn flag_with_segment_match(key: &str, segment_key: &str) -> Flag {
    let mut flag = basic_flag(key);
    flag.rules = vec![serde_json::from_value(json!({
        "id": "match-rule",
        "clauses": [{
            "attribute": "segmentMatch",
            "op": "segmentMatch",
            "values": [segment_key],
            "negate": false
        }],
        "variation": 0,
        "trackEvents": false
    }))
    .unwrap()];
    flag
}

pub fn basic_segment(key: &str, version: u64) -> Segment {
    serde_json::from_value(json!({
        "key": key,
        "version": version,
        "included": [],
        "excluded": [],
        "rules": [],
        "salt": "salty"
    }))
    .unwrap()
}

pub fn all_data(flags: Vec<Flag>, segments: Vec<Segment>) -> AllData {
    AllData {
        flags: flags
            .into_iter()
            .map(|flag| (flag.key.clone(), StorageItem::Item(flag)))
            .collect(),
        segments: segments
            .into_iter()
            .map(|segment| (segment.key.clone(), StorageItem::Item(segment)))
            .collect(),
    }
}

/// A fixed dataset exercising every evaluation path.
///
/// The cast: `casey` is individually targeted and a member of the beta segment, `morgan` is
/// neither. The prerequisite flags form a small dependency tree rooted at `api.enabled`.
pub struct TestStore {
    flags: HashMap<String, Flag>,
    segments: HashMap<String, Segment>,
}

impl TestStore {
    pub fn new() -> Self {
        let flags = json!({
            // an off flag with an individual target, for the basic on/off/target paths
            "checkout.banner": {
                "key": "checkout.banner",
                "on": false,
                "version": 3,
                "targets": [{"values": ["casey"], "variation": 0}],
                "fallthrough": {"variation": 1},
                "offVariation": 0,
                "variations": [false, true],
                "salt": "b9d1"
            },
            // off flag with a clause rule; the rule and fallthrough both track events
            "search.ranker": {
                "key": "search.ranker",
                "on": false,
                "version": 9,
                "rules": [{
                    "id": "dept-rule",
                    "clauses": [{
                        "attribute": "department",
                        "op": "in",
                        "values": ["platform", "growth"],
                        "negate": false
                    }],
                    "variation": 0,
                    "trackEvents": true
                }],
                "fallthrough": {"variation": 1},
                "offVariation": 0,
                "variations": [false, true],
                "salt": "r4k2",
                "trackEventsFallthrough": true
            },
            // the root everything below depends on: morgan is pinned to the "off" variation
            "api.enabled": {
                "key": "api.enabled",
                "on": true,
                "version": 4,
                "targets": [{"values": ["morgan"], "variation": 0}],
                "fallthrough": {"variation": 1},
                "offVariation": 0,
                "variations": [false, true],
                "salt": "a7e3"
            },
            // a permanently-off dependency
            "api.legacy": {
                "key": "api.legacy",
                "on": false,
                "version": 2,
                "fallthrough": {"variation": 1},
                "offVariation": 0,
                "variations": [false, true],
                "salt": "a0l5"
            },
            "billing.v2": {
                "key": "billing.v2",
                "on": true,
                "version": 6,
                "prerequisites": [{"key": "api.enabled", "variation": 1}],
                "fallthrough": {"variation": 1},
                "offVariation": 0,
                "variations": [false, true],
                "salt": "b2v6"
            },
            "billing.v2.ui": {
                "key": "billing.v2.ui",
                "on": true,
                "version": 6,
                "prerequisites": [{"key": "billing.v2", "variation": 1}],
                "fallthrough": {"variation": 1},
                "offVariation": 0,
                "variations": [false, true],
                "salt": "b2u1"
            },
            "billing.missing-dep": {
                "key": "billing.missing-dep",
                "on": true,
                "version": 5,
                "prerequisites": [{"key": "nope", "variation": 1}],
                "fallthrough": {"variation": 1},
                "offVariation": 0,
                "variations": [false, true],
                "salt": "b5m0"
            },
            "billing.off-dep": {
                "key": "billing.off-dep",
                "on": true,
                "version": 5,
                "prerequisites": [{"key": "api.legacy", "variation": 1}],
                "fallthrough": {"variation": 1},
                "offVariation": 0,
                "variations": [false, true],
                "salt": "b5o1"
            },
            // two prerequisites, the second of which depends on the first
            "billing.diamond": {
                "key": "billing.diamond",
                "on": true,
                "version": 7,
                "prerequisites": [
                    {"key": "api.enabled", "variation": 1},
                    {"key": "billing.v2", "variation": 1}
                ],
                "fallthrough": {"variation": 1},
                "offVariation": 0,
                "variations": [false, true],
                "salt": "b7d2"
            },
            "search.beta": {
                "key": "search.beta",
                "on": true,
                "version": 8,
                "rules": [{
                    "id": "beta-rule",
                    "clauses": [{
                        "attribute": "segmentMatch",
                        "op": "segmentMatch",
                        "values": ["beta-users"],
                        "negate": false
                    }],
                    "variation": 0,
                    "trackEvents": false
                }],
                "fallthrough": {"variation": 1},
                "offVariation": 0,
                "variations": [false, true],
                "salt": "s8b3"
            },
            // a rule whose outcome is neither a variation nor a rollout
            "search.broken": {
                "key": "search.broken",
                "on": false,
                "version": 2,
                "rules": [{
                    "id": "crash-rule",
                    "clauses": [{
                        "attribute": "key",
                        "op": "in",
                        "values": ["crash"],
                        "negate": false
                    }],
                    "trackEvents": false
                }],
                "fallthrough": {"variation": 1},
                "offVariation": 0,
                "variations": [false, true],
                "salt": "s2x9"
            },
            // experiment over the default key attribute; the seed alone drives the buckets
            "checkout.cta": {
                "key": "checkout.cta",
                "on": true,
                "version": 12,
                "fallthrough": {
                    "rollout": {
                        "kind": "experiment",
                        "seed": 61,
                        "variations": [
                            {"variation": 0, "weight": 10000, "untracked": false},
                            {"variation": 1, "weight": 20000, "untracked": false},
                            {"variation": 0, "weight": 70000, "untracked": true}
                        ]
                    }
                },
                "offVariation": 0,
                "variations": [false, true],
                "salt": "c12t",
                "clientSideAvailability": {
                    "usingEnvironmentId": true,
                    "usingMobileKey": false
                }
            },
            // rule rollout bucketed by a custom attribute; the single full-weight slice makes
            // the outcome independent of the hash (distribution is pinned elsewhere)
            "checkout.theme": {
                "key": "checkout.theme",
                "on": true,
                "version": 11,
                "rules": [{
                    "id": "theme-rollout",
                    "clauses": [{
                        "attribute": "channel",
                        "op": "in",
                        "values": ["mobile", "web"],
                        "negate": false
                    }],
                    "rollout": {
                        "bucketBy": "account",
                        "variations": [{"variation": 1, "weight": 100000}]
                    },
                    "trackEvents": false
                }],
                "fallthrough": {"variation": 2},
                "offVariation": 0,
                "variations": ["control", "treatment", "holdout"],
                "salt": "c11h"
            }
        });
        let segments = json!({
            "beta-users": {
                "key": "beta-users",
                "version": 2,
                "included": ["casey"],
                "excluded": [],
                "rules": [],
                "salt": "q0s8"
            }
        });

        Self {
            flags: serde_json::from_value(flags).unwrap(),
            segments: serde_json::from_value(segments).unwrap(),
        }
    }

    pub fn new_from_json_str(flags_json: &str, segments_json: &str) -> Self {
        Self {
            flags: serde_json::from_str(flags_json).unwrap(),
            segments: serde_json::from_str(segments_json).unwrap(),
        }
    }

    pub fn update_flag(&mut self, flag_key: &str, fun: fn(&mut Flag) -> ()) {
        let flag = self.flags.get_mut(flag_key).unwrap();
        fun(flag);
    }
}

impl Store for TestStore {
    fn flag(&self, flag_key: &str) -> Option<Flag> {
        self.flags.get(flag_key).cloned()
    }

    fn segment(&self, segment_key: &str) -> Option<Segment> {
        self.segments.get(segment_key).cloned()
    }
}

pub struct InMemoryPrerequisiteEventRecorder {
    pub events: RefCell<Vec<PrerequisiteEvent>>,
}

impl PrerequisiteEventRecorder for InMemoryPrerequisiteEventRecorder {
    fn record(&self, event: PrerequisiteEvent) {
        self.events.borrow_mut().push(event);
    }
}
