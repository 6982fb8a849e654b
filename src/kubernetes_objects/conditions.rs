use super::notebook_validation_job::{Condition, ConditionStatus, ConditionType, Reason};

/// Upserts a condition by type.
///
/// `last_transition_time` only moves when the status flips; reason and message
/// are always refreshed. Returns whether anything changed.
pub fn set_condition(
    conditions: &mut Vec<Condition>,
    type_: ConditionType,
    status: ConditionStatus,
    reason: Reason,
    message: impl Into<String>,
    now: &str,
) -> bool {
    let message = message.into();
    match conditions.iter_mut().find(|c| c.type_ == type_) {
        Some(existing) => {
            let before = existing.clone();
            if existing.status != status {
                existing.status = status;
                existing.last_transition_time = now.to_string();
            }
            existing.reason = reason;
            existing.message = message;
            *existing != before
        }
        None => {
            conditions.push(Condition {
                type_,
                status,
                reason,
                message,
                last_transition_time: now.to_string(),
            });
            true
        }
    }
}

pub fn find_condition(conditions: &[Condition], type_: ConditionType) -> Option<&Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

#[cfg(test)]
pub(crate) fn is_condition_true(conditions: &[Condition], type_: ConditionType) -> bool {
    find_condition(conditions, type_).is_some_and(|c| c.status == ConditionStatus::True)
}
