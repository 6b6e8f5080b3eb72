//! Condition management helpers following the OpenShift operator condition model

use chrono::{DateTime, SecondsFormat, Utc};

use crate::crd::{Condition, GenerationStatus};
use crate::error::{Error, Result};

/// Condition type suffixes; controllers prefix them with their own name
pub const CONDITION_TYPE_DEGRADED: &str = "Degraded";
pub const CONDITION_TYPE_PROGRESSING: &str = "Progressing";
pub const CONDITION_TYPE_AVAILABLE: &str = "Available";
pub const CONDITION_TYPE_UPGRADEABLE: &str = "Upgradeable";
pub const CONDITION_TYPE_REMOVED: &str = "Removed";

/// Standard condition statuses
pub const CONDITION_STATUS_TRUE: &str = "True";
pub const CONDITION_STATUS_FALSE: &str = "False";
pub const CONDITION_STATUS_UNKNOWN: &str = "Unknown";

pub const REASON_AS_EXPECTED: &str = "AsExpected";
pub const REASON_SYNC_ERROR: &str = "SyncError";
pub const REASON_OPERANDS_REMOVED: &str = "OperandsRemoved";

/// Source of transition timestamps
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that always returns the same instant
#[derive(Clone, Copy, Debug)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

pub fn format_time(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Merge `updates` into `existing` by type.
///
/// Every update must carry a type and a status. `lastTransitionTime` is taken from
/// `clock` when the status changes (or the condition is new) and kept otherwise.
/// The result is sorted by type.
pub fn apply_conditions(
    existing: &[Condition],
    updates: &[Condition],
    clock: &dyn Clock,
) -> Result<Vec<Condition>> {
    let mut merged: Vec<Condition> = existing.to_vec();
    for update in updates {
        if update.type_.is_empty() {
            return Err(Error::Precondition("condition type must not be empty".to_string()));
        }
        if update.status.is_empty() {
            return Err(Error::Precondition(format!(
                "condition {} has an empty status",
                update.type_
            )));
        }

        let mut next = update.clone();
        match merged.iter_mut().find(|c| c.type_ == update.type_) {
            Some(current) => {
                next.last_transition_time = if current.status != update.status
                    || current.last_transition_time.is_empty()
                {
                    format_time(clock.now())
                } else {
                    current.last_transition_time.clone()
                };
                *current = next;
            }
            None => {
                next.last_transition_time = format_time(clock.now());
                merged.push(next);
            }
        }
    }
    merged.sort_by(|a, b| a.type_.cmp(&b.type_));
    Ok(merged)
}

/// Find a condition by type
pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Check if a condition is true
pub fn is_condition_true(conditions: &[Condition], type_: &str) -> bool {
    find_condition(conditions, type_)
        .map(|c| c.status == CONDITION_STATUS_TRUE)
        .unwrap_or(false)
}

/// Remove every condition whose type starts with `prefix`
pub fn remove_conditions_with_prefix(conditions: &mut Vec<Condition>, prefix: &str) {
    conditions.retain(|c| !c.type_.starts_with(prefix));
}

pub fn degraded_condition(controller: &str, message: &str) -> Condition {
    Condition::new(
        &format!("{controller}{CONDITION_TYPE_DEGRADED}"),
        CONDITION_STATUS_TRUE,
        REASON_SYNC_ERROR,
        message,
    )
}

pub fn not_degraded_condition(controller: &str) -> Condition {
    Condition::new(
        &format!("{controller}{CONDITION_TYPE_DEGRADED}"),
        CONDITION_STATUS_FALSE,
        REASON_AS_EXPECTED,
        "",
    )
}

/// Marker recorded once a controller has deleted everything it owns
pub fn removed_condition(controller: &str) -> Condition {
    Condition::new(
        &format!("{controller}{CONDITION_TYPE_REMOVED}"),
        CONDITION_STATUS_TRUE,
        REASON_OPERANDS_REMOVED,
        "",
    )
}

/// True once every named controller carries its `Removed` marker
pub fn removal_complete(conditions: &[Condition], controllers: &[String]) -> bool {
    controllers
        .iter()
        .all(|c| is_condition_true(conditions, &format!("{c}{CONDITION_TYPE_REMOVED}")))
}

/// Insert or replace the generation memo for the same object
pub fn set_generation(generations: &mut Vec<GenerationStatus>, entry: GenerationStatus) {
    match generations.iter_mut().find(|g| g.same_object(&entry)) {
        Some(existing) => *existing = entry,
        None => generations.push(entry),
    }
}

pub fn find_generation<'a>(
    generations: &'a [GenerationStatus],
    group: &str,
    resource: &str,
    namespace: &str,
    name: &str,
) -> Option<&'a GenerationStatus> {
    generations.iter().find(|g| {
        g.group == group && g.resource == resource && g.namespace == namespace && g.name == name
    })
}
