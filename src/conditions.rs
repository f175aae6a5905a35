use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition as K8sCondition, Time};
pub use operator_derive::Conditions as DeriveConditions;

pub static READY: &str = "Ready";
pub static REASON_RECONCILE_SUCCEEDED: &str = "ReconcileSucceeded";
pub static REASON_RECONCILE_FAILED: &str = "ReconcileFailed";

// Status types exposing a meta/v1 `conditions` list
pub trait Conditions {
    fn conditions(&self) -> &Option<Vec<K8sCondition>>;
    fn conditions_mut(&mut self) -> &mut Option<Vec<K8sCondition>>;

    fn get_condition(&self, type_: &str) -> Option<&K8sCondition> {
        self.conditions().as_ref()?.iter().find(|c| c.type_ == type_)
    }

    fn is_condition_true(&self, type_: &str) -> bool {
        self.get_condition(type_).is_some_and(|c| c.status == "True")
    }

    fn upsert_bool(
        &mut self,
        type_: &str,
        status: bool,
        reason: &str,
        message: Option<&str>,
        observed_generation: i64,
    ) {
        let cond = make_condition(type_, status, reason, message.unwrap_or(""), observed_generation);
        self.upsert_condition(cond);
    }

    fn clear_conditions(&mut self) {
        *self.conditions_mut() = None;
    }

    // Preserves last_transition_time when the status does not change
    fn upsert_condition(&mut self, new_cond: K8sCondition) {
        let target = self.conditions_mut().get_or_insert_with(Vec::new);
        match target.iter_mut().find(|c| c.type_ == new_cond.type_) {
            Some(existing) if existing.status == new_cond.status => {
                existing.reason = new_cond.reason;
                existing.message = new_cond.message;
                existing.observed_generation = new_cond.observed_generation;
            }
            Some(existing) => *existing = new_cond,
            None => target.push(new_cond),
        }
    }
}

pub fn make_condition(
    type_: &str,
    status: bool,
    reason: &str,
    message: &str,
    observed_generation: i64,
) -> K8sCondition {
    K8sCondition {
        type_: type_.to_string(),
        status: if status { "True" } else { "False" }.to_string(),
        reason: reason.to_string(),
        message: message.to_string(),
        observed_generation: Some(observed_generation),
        last_transition_time: Time(chrono::Utc::now()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::AKODeploymentConfigStatus;

    #[test]
    fn upsert_keeps_transition_time_for_same_status() {
        let mut status = AKODeploymentConfigStatus::default();
        status.upsert_bool(READY, false, REASON_RECONCILE_FAILED, Some("first"), 1);
        let first = status.get_condition(READY).expect("ready").last_transition_time.clone();

        status.upsert_bool(READY, false, REASON_RECONCILE_FAILED, Some("second"), 2);
        let cond = status.get_condition(READY).expect("ready");
        assert_eq!(cond.last_transition_time, first);
        assert_eq!(cond.message, "second");
        assert_eq!(cond.observed_generation, Some(2));

        status.upsert_bool(READY, true, REASON_RECONCILE_SUCCEEDED, None, 3);
        assert!(status.is_condition_true(READY));
        assert_eq!(status.conditions().as_ref().map(Vec::len), Some(1));

        status.clear_conditions();
        assert!(status.get_condition(READY).is_none());
    }
}
