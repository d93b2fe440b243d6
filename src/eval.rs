use std::collections::HashSet;

use log::warn;
use serde::Serialize;

use crate::flag::Flag;
use crate::flag_value::FlagValue;
use crate::store::Store;
use crate::user::User;
use crate::variation::{BucketResult, VariationIndex};

/// The result of an evaluation performed on a prerequisite flag.
pub struct PrerequisiteEvent {
    /// Key of the original flag whose prerequisites were being checked.
    pub target_flag_key: String,
    /// The user the evaluation ran against.
    pub user: User,
    /// The prerequisite flag that was evaluated.
    pub prerequisite_flag: Flag,
    /// The result of evaluating [PrerequisiteEvent::prerequisite_flag].
    pub prerequisite_result: Detail<FlagValue>,
}

/// Trait used by [evaluate] to report the result of prerequisite flag evaluations.
///
/// The evaluator knows nothing about analytics events; recording them (or anything else) is the
/// caller's business.
pub trait PrerequisiteEventRecorder {
    fn record(&self, event: PrerequisiteEvent);
}

const PREALLOCATED_PREREQUISITE_CHAIN_SIZE: usize = 20;

pub(crate) struct EvaluationStack {
    pub(crate) prerequisite_flag_chain: HashSet<String>,
}

impl EvaluationStack {
    fn new() -> Self {
        // Preallocate space so typical prerequisite depths never touch the heap again.
        Self {
            prerequisite_flag_chain: HashSet::with_capacity(PREALLOCATED_PREREQUISITE_CHAIN_SIZE),
        }
    }
}

impl Default for EvaluationStack {
    fn default() -> Self {
        Self::new()
    }
}

/// Evaluate a feature flag for the specified [User].
///
/// Evaluation never panics or returns an error to the caller: every failure path is expressed as
/// a [Detail] whose reason is [Reason::Error].
pub fn evaluate<'a>(
    store: &'a dyn Store,
    flag: &'a Flag,
    user: &'a User,
    prerequisite_event_recorder: Option<&dyn PrerequisiteEventRecorder>,
) -> Detail<&'a FlagValue> {
    if user.key().is_empty() {
        return Detail::err(Error::UserNotSpecified);
    }

    let mut evaluation_stack = EvaluationStack::default();
    evaluate_internal(
        store,
        flag,
        user,
        prerequisite_event_recorder,
        &mut evaluation_stack,
    )
}

fn evaluate_internal<'a>(
    store: &'a dyn Store,
    flag: &'a Flag,
    user: &'a User,
    prerequisite_event_recorder: Option<&dyn PrerequisiteEventRecorder>,
    evaluation_stack: &mut EvaluationStack,
) -> Detail<&'a FlagValue> {
    if !flag.on {
        // a flag that is off but has no off variation is misconfigured
        return flag
            .off_value(Reason::Off)
            .should_have_value(Error::MalformedFlag);
    }

    if evaluation_stack.prerequisite_flag_chain.contains(&flag.key) {
        warn!(
            "prerequisite relationship to {} caused a circular reference; this is probably a temporary condition due to an incomplete update",
            flag.key
        );
        return Detail::err(Error::MalformedFlag);
    }

    evaluation_stack
        .prerequisite_flag_chain
        .insert(flag.key.clone());

    for prereq in &flag.prerequisites {
        if let Some(prereq_flag) = store.flag(&prereq.key) {
            if evaluation_stack
                .prerequisite_flag_chain
                .contains(&prereq_flag.key)
            {
                return Detail::err(Error::MalformedFlag);
            }

            let prerequisite_result = evaluate_internal(
                store,
                &prereq_flag,
                user,
                prerequisite_event_recorder,
                evaluation_stack,
            );

            if let Detail {
                reason: Reason::Error { .. },
                ..
            } = prerequisite_result
            {
                return Detail::err(Error::MalformedFlag);
            }

            let variation_index = prerequisite_result.variation_index;

            if let Some(recorder) = prerequisite_event_recorder {
                recorder.record(PrerequisiteEvent {
                    target_flag_key: flag.key.clone(),
                    user: user.clone(),
                    prerequisite_flag: prereq_flag.clone(),
                    prerequisite_result: prerequisite_result.map(|v| v.clone()),
                });
            }

            if !prereq_flag.on || variation_index != Some(prereq.variation) {
                return flag.off_value(Reason::PrerequisiteFailed {
                    prerequisite_key: prereq.key.to_string(),
                });
            }
        } else {
            return flag.off_value(Reason::PrerequisiteFailed {
                prerequisite_key: prereq.key.to_string(),
            });
        }
    }

    evaluation_stack.prerequisite_flag_chain.remove(&flag.key);

    for target in &flag.targets {
        if target.values.iter().any(|k| k == user.key()) {
            return flag.variation(target.variation, Reason::TargetMatch);
        }
    }

    for (rule_index, rule) in flag.rules.iter().enumerate() {
        if rule.matches(user, store) {
            let result = flag.resolve_variation_or_rollout(&rule.variation_or_rollout, user);
            return match result {
                Ok(BucketResult {
                    variation_index,
                    in_experiment,
                }) => {
                    let reason = Reason::RuleMatch {
                        rule_index,
                        rule_id: rule.id.clone(),
                        in_experiment,
                    };
                    flag.variation(variation_index, reason)
                }
                Err(e) => Detail::err(e),
            };
        }
    }

    let result = flag.resolve_variation_or_rollout(&flag.fallthrough, user);
    match result {
        Ok(BucketResult {
            variation_index,
            in_experiment,
        }) => {
            let reason = Reason::Fallthrough { in_experiment };
            flag.variation(variation_index, reason)
        }
        Err(e) => Detail::err(e),
    }
}

/// A Detail instance is returned from [evaluate], combining the result of a flag evaluation with
/// an explanation of how it was calculated.
#[derive(Clone, Debug, PartialEq)]
pub struct Detail<T> {
    /// The result of the flag evaluation. This will be either one of the flag's variations or
    /// None if no appropriate fallback value was configured.
    pub value: Option<T>,

    /// The index of the returned value within the flag's list of variations, or None when the
    /// value did not come from a variation (e.g. the caller's default was served due to an
    /// error).
    pub variation_index: Option<VariationIndex>,

    /// The main factor that influenced the returned value.
    pub reason: Reason,
}

impl<T> Detail<T> {
    /// Returns a detail with value and variation_index of None.
    pub fn empty(reason: Reason) -> Detail<T> {
        Detail {
            value: None,
            variation_index: None,
            reason,
        }
    }

    /// Returns a detail carrying the caller-provided default and an error reason. The
    /// variation_index is None because the value did not come from the flag.
    pub fn err_default(error: Error, default: T) -> Detail<T> {
        Detail {
            value: Some(default),
            variation_index: None,
            reason: Reason::Error { error },
        }
    }

    /// Returns an empty detail with the provided error as the reason.
    pub fn err(error: Error) -> Detail<T> {
        Detail::empty(Reason::Error { error })
    }

    /// Returns a new instance of this detail with the provided function `f` applied to
    /// [Detail::value].
    pub fn map<U, F>(self, f: F) -> Detail<U>
    where
        F: FnOnce(T) -> U,
    {
        Detail {
            value: self.value.map(f),
            variation_index: self.variation_index,
            reason: self.reason,
        }
    }

    /// Replaces the reason with the provided error if this detail has no value.
    pub fn should_have_value(mut self, e: Error) -> Detail<T> {
        if self.value.is_none() {
            self.reason = Reason::Error { error: e };
        }
        self
    }

    /// Convert the value through `f`, falling back to `default` (with the reason intact) when
    /// there is no value, or to `default` with error `e` when the conversion fails.
    pub fn try_map<U, F>(self, f: F, default: U, e: Error) -> Detail<U>
    where
        F: FnOnce(T) -> Option<U>,
    {
        if self.value.is_none() {
            return Detail {
                value: Some(default),
                variation_index: self.variation_index,
                reason: self.reason,
            };
        }
        match f(self.value.unwrap()) {
            Some(v) => Detail {
                value: Some(v),
                variation_index: self.variation_index,
                reason: self.reason,
            },
            None => Detail::err_default(e, default),
        }
    }

    /// Set the value to `default` if it is absent. The reason is deliberately left untouched.
    pub fn or(mut self, default: T) -> Detail<T> {
        if self.value.is_none() {
            self.value = Some(default);
            self.variation_index = None;
        }
        self
    }

    /// Like [Detail::or], with the default produced lazily.
    pub fn or_else<F>(mut self, default: F) -> Detail<T>
    where
        F: Fn() -> T,
    {
        if self.value.is_none() {
            self.value = Some(default());
            self.variation_index = None;
        }
        self
    }
}

/// Reason describes how a flag evaluation arrived at its value.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", tag = "kind")]
pub enum Reason {
    /// The flag was off and therefore returned its configured off value.
    Off,
    /// The user's key was specifically targeted for this flag.
    TargetMatch,
    /// The user matched one of the flag's rules.
    #[serde(rename_all = "camelCase")]
    RuleMatch {
        /// Zero-based index of the matched rule.
        rule_index: usize,
        /// The id of the matched rule, if it has one.
        #[serde(skip_serializing_if = "String::is_empty")]
        rule_id: String,
        /// True if the variation came from an experiment rollout and the chosen bucket is
        /// tracked.
        #[serde(skip_serializing_if = "std::ops::Not::not")]
        in_experiment: bool,
    },
    /// The flag is considered off because at least one prerequisite flag was off or did not
    /// return the required variation.
    #[serde(rename_all = "camelCase")]
    PrerequisiteFailed {
        /// The key of the prerequisite flag that failed.
        prerequisite_key: String,
    },
    /// The flag was on but the user matched no target or rule.
    #[serde(rename_all = "camelCase")]
    Fallthrough {
        /// True if the variation came from an experiment rollout and the chosen bucket is
        /// tracked.
        #[serde(skip_serializing_if = "std::ops::Not::not")]
        in_experiment: bool,
    },
    /// The flag could not be evaluated, so the caller's default value was served instead.
    Error {
        /// The failure that stopped evaluation.
        #[serde(rename = "errorKind")]
        error: Error,
    },
}

impl Reason {
    /// Whether this reason marks the evaluation as part of an ongoing experiment.
    pub fn is_in_experiment(&self) -> bool {
        match self {
            Reason::RuleMatch { in_experiment, .. } => *in_experiment,
            Reason::Fallthrough { in_experiment } => *in_experiment,
            _ => false,
        }
    }
}

/// The ways in which a flag evaluation can fail. Carried inside [Reason::Error].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Error {
    /// Evaluation was attempted before the client had received any flag data.
    ClientNotReady,
    /// The flag key did not match any known flag.
    FlagNotFound,
    /// The flag data was internally inconsistent: a variation index out of range, an
    /// unparseable rule outcome, a missing off variation, or a prerequisite cycle.
    MalformedFlag,
    /// The user had no key.
    UserNotSpecified,
    /// The result value was not of the requested type, e.g. bool_variation was called but the
    /// variation is a string.
    WrongType,
    /// An unexpected error stopped flag evaluation; check the log for details.
    Exception,
}
