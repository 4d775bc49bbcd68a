//! A small condition-set helper shared by every status writer: each handler names a condition
//! type and mutates status from the `Result` it returns. Grounded on the
//! teacher's `status::condition::operations::ClusterOperationsConditionBuilder`
//! (a fixed set of named conditions derived from current state), adapted
//! from a dedicated builder type to one free function per call site,
//! since Fleet's conditions are written one at a time by whichever
//! handler owns them rather than rebuilt as a full set on every pass.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};

/// Insert or update the condition named `type_` in `conditions`, setting
/// `lastTransitionTime` to `now` only when the status actually flips
/// (idempotent re-application of an unchanged condition is a no-op on
/// that field, so Monitor idempotence holds
/// byte-for-byte). `now` is threaded in by the caller rather than read
/// from the clock here, keeping this function pure and its tests
/// deterministic (the same convention `fleet_git::github_app` uses for
/// JWT signing).
pub fn set_condition(conditions: &mut Vec<Condition>, type_: &str, status: bool, reason: &str, message: String, observed_generation: i64, now: Time) {
    let status_str = if status { "True" } else { "False" }.to_owned();

    if let Some(existing) = conditions.iter_mut().find(|c| c.type_ == type_) {
        let transitioned = existing.status != status_str;
        existing.status = status_str;
        existing.reason = reason.to_owned();
        existing.message = message;
        existing.observed_generation = Some(observed_generation);
        if transitioned {
            existing.last_transition_time = now;
        }
        return;
    }

    conditions.push(Condition {
        type_: type_.to_owned(),
        status: status_str,
        reason: reason.to_owned(),
        message,
        observed_generation: Some(observed_generation),
        last_transition_time: now,
    });
}

pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

pub fn is_true(conditions: &[Condition], type_: &str) -> bool {
    find_condition(conditions, type_).is_some_and(|c| c.status == "True")
}

pub fn is_false(conditions: &[Condition], type_: &str) -> bool {
    find_condition(conditions, type_).is_some_and(|c| c.status == "False")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(seconds: i64) -> Time {
        Time(chrono::DateTime::from_timestamp(seconds, 0).expect("valid timestamp"))
    }

    #[test]
    fn new_condition_is_appended() {
        let mut conditions = Vec::new();
        set_condition(&mut conditions, "Ready", true, "AllGood", "ok".to_owned(), 1, t(0));
        assert_eq!(conditions.len(), 1);
        assert!(is_true(&conditions, "Ready"));
    }

    #[test]
    fn re_applying_the_same_status_is_idempotent() {
        let mut conditions = Vec::new();
        set_condition(&mut conditions, "Ready", true, "AllGood", "ok".to_owned(), 1, t(0));
        let first = conditions.clone();
        set_condition(&mut conditions, "Ready", true, "AllGood", "ok".to_owned(), 1, t(100));
        assert_eq!(first, conditions, "an unchanged status must not touch lastTransitionTime");
    }

    #[test]
    fn flipping_status_updates_in_place() {
        let mut conditions = Vec::new();
        set_condition(&mut conditions, "Ready", true, "AllGood", "ok".to_owned(), 1, t(0));
        set_condition(&mut conditions, "Ready", false, "Drifted", "drift detected".to_owned(), 2, t(100));
        assert_eq!(conditions.len(), 1);
        assert!(is_false(&conditions, "Ready"));
        assert_eq!(conditions[0].reason, "Drifted");
        assert_eq!(conditions[0].last_transition_time, t(100));
    }
}
