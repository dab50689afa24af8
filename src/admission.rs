//! Tenant admission: bounds how many tenants may hold active work at once.
//!
//! Admission is decided at workflow submission time. A tenant already in the
//! active set is always admitted (no additional slot is reserved); a new
//! tenant is rejected outright when the set is full, so the cap is observable
//! at the API boundary instead of turning into indefinite queueing.

use std::collections::BTreeSet;

use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionDecision {
    Admitted,
    Rejected,
}

#[derive(Debug)]
pub struct AdmissionController {
    active: BTreeSet<String>,
    limit: usize,
}

impl AdmissionController {
    pub fn new(limit: usize) -> Self {
        Self {
            active: BTreeSet::new(),
            limit,
        }
    }

    pub fn try_admit(&mut self, tenant_id: &str) -> AdmissionDecision {
        if self.active.contains(tenant_id) {
            return AdmissionDecision::Admitted;
        }
        if self.active.len() < self.limit {
            self.active.insert(tenant_id.to_string());
            debug!(tenant_id, active = self.active.len(), "tenant admitted");
            return AdmissionDecision::Admitted;
        }
        debug!(tenant_id, limit = self.limit, "tenant rejected at cap");
        AdmissionDecision::Rejected
    }

    /// Drop the tenant from the active set. Called by the scheduler once the
    /// tenant has no pending or running jobs left.
    pub fn release(&mut self, tenant_id: &str) {
        if self.active.remove(tenant_id) {
            debug!(tenant_id, active = self.active.len(), "tenant released");
        }
    }

    pub fn is_active(&self, tenant_id: &str) -> bool {
        self.active.contains(tenant_id)
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_up_to_the_cap() {
        let mut admission = AdmissionController::new(2);
        assert_eq!(admission.try_admit("t1"), AdmissionDecision::Admitted);
        assert_eq!(admission.try_admit("t2"), AdmissionDecision::Admitted);
        assert_eq!(admission.try_admit("t3"), AdmissionDecision::Rejected);
        assert_eq!(admission.active_count(), 2);
    }

    #[test]
    fn readmission_of_active_tenant_is_free() {
        let mut admission = AdmissionController::new(1);
        assert_eq!(admission.try_admit("t1"), AdmissionDecision::Admitted);
        assert_eq!(admission.try_admit("t1"), AdmissionDecision::Admitted);
        assert_eq!(admission.active_count(), 1);
    }

    #[test]
    fn release_opens_a_slot() {
        let mut admission = AdmissionController::new(1);
        admission.try_admit("t1");
        assert_eq!(admission.try_admit("t2"), AdmissionDecision::Rejected);
        admission.release("t1");
        assert!(!admission.is_active("t1"));
        assert_eq!(admission.try_admit("t2"), AdmissionDecision::Admitted);
    }

    #[test]
    fn releasing_an_unknown_tenant_is_a_noop() {
        let mut admission = AdmissionController::new(1);
        admission.release("ghost");
        assert_eq!(admission.active_count(), 0);
    }
}
