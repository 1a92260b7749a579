//! # Admission Control
//!
//! Per-tenant daily quota gate. The quota and today's count are read from the status
//! sink on every call. Any read failure denies the request.

use crate::error::DenialReason;
use crate::models::{TaskKind, TenantId};
use crate::status_sink::StatusSink;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct AdmissionDecision {
    pub allowed: bool,
    /// Set whenever `allowed` is false
    pub reason: Option<DenialReason>,
    /// Effective quota, when it could be read
    pub quota: Option<u32>,
    /// Tasks admitted today before this request, when it could be read
    pub admitted_today: Option<u64>,
}

impl AdmissionDecision {
    fn allow(quota: u32, admitted_today: u64) -> Self {
        Self {
            allowed: true,
            reason: None,
            quota: Some(quota),
            admitted_today: Some(admitted_today),
        }
    }

    /// `Err` with the denial reason unless admitted
    pub fn into_result(self) -> Result<(), DenialReason> {
        match self.reason {
            Some(reason) if !self.allowed => Err(reason),
            _ => Ok(()),
        }
    }

    fn deny(reason: DenialReason) -> Self {
        let (quota, admitted_today) = match &reason {
            DenialReason::QuotaExceeded { count, quota } => (Some(*quota), Some(*count)),
            DenialReason::QuotaUnavailable { .. } => (None, None),
        };
        Self {
            allowed: false,
            reason: Some(reason),
            quota,
            admitted_today,
        }
    }
}

pub struct AdmissionController {
    sink: Arc<dyn StatusSink>,
    default_daily_quota: Option<u32>,
}

impl AdmissionController {
    pub fn new(sink: Arc<dyn StatusSink>, default_daily_quota: Option<u32>) -> Self {
        Self {
            sink,
            default_daily_quota,
        }
    }

    /// The tenant's configured quota, else the default. `Ok(None)` means neither exists.
    pub async fn effective_quota(&self, tenant_id: &TenantId) -> Result<Option<u32>, DenialReason> {
        match self.sink.get_quota(tenant_id).await {
            Ok(quota) => Ok(quota.or(self.default_daily_quota)),
            Err(e) => Err(DenialReason::QuotaUnavailable {
                message: e.to_string(),
            }),
        }
    }

    pub async fn admit(&self, tenant_id: &TenantId, kind: TaskKind) -> AdmissionDecision {
        let quota = match self.effective_quota(tenant_id).await {
            Ok(Some(quota)) => quota,
            Ok(None) => {
                warn!(tenant_id = %tenant_id, "No quota configured for tenant, denying");
                return AdmissionDecision::deny(DenialReason::QuotaUnavailable {
                    message: format!("no daily quota configured for tenant {tenant_id}"),
                });
            }
            Err(reason) => {
                warn!(tenant_id = %tenant_id, reason = %reason, "Quota read failed, denying");
                return AdmissionDecision::deny(reason);
            }
        };

        let count = match self.sink.count_tasks_today(tenant_id).await {
            Ok(count) => count,
            Err(e) => {
                warn!(tenant_id = %tenant_id, error = %e, "Task count read failed, denying");
                return AdmissionDecision::deny(DenialReason::QuotaUnavailable {
                    message: e.to_string(),
                });
            }
        };

        if count >= u64::from(quota) {
            debug!(tenant_id = %tenant_id, kind = %kind, count, quota, "Daily quota exhausted");
            return AdmissionDecision::deny(DenialReason::QuotaExceeded { count, quota });
        }

        debug!(tenant_id = %tenant_id, kind = %kind, count, quota, "Admitted");
        AdmissionDecision::allow(quota, count)
    }
}

impl std::fmt::Debug for AdmissionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionController")
            .field("default_daily_quota", &self.default_daily_quota)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewTask;
    use crate::status_sink::InMemoryStatusSink;

    async fn sink_with_tasks(quota: Option<u32>, existing: usize) -> Arc<InMemoryStatusSink> {
        let sink = Arc::new(InMemoryStatusSink::new());
        if let Some(quota) = quota {
            sink.set_quota("tenant-a", quota);
        }
        for _ in 0..existing {
            sink.create_task(NewTask::new("tenant-a", TaskKind::Acquire))
                .await
                .unwrap();
        }
        sink
    }

    #[tokio::test]
    async fn test_admits_under_quota() {
        let controller = AdmissionController::new(sink_with_tasks(Some(2), 1).await, None);
        let decision = controller.admit(&"tenant-a".into(), TaskKind::Acquire).await;
        assert!(decision.allowed);
        assert_eq!(decision.admitted_today, Some(1));
    }

    #[tokio::test]
    async fn test_denies_at_quota() {
        let controller = AdmissionController::new(sink_with_tasks(Some(2), 2).await, None);
        let decision = controller.admit(&"tenant-a".into(), TaskKind::Acquire).await;
        assert!(!decision.allowed);
        assert_eq!(
            decision.reason,
            Some(DenialReason::QuotaExceeded { count: 2, quota: 2 })
        );
    }

    #[tokio::test]
    async fn test_default_quota_fallback() {
        let sink = sink_with_tasks(None, 0).await;

        let controller = AdmissionController::new(sink.clone(), None);
        let decision = controller.admit(&"tenant-a".into(), TaskKind::Deliver).await;
        assert!(!decision.allowed);
        assert!(decision.reason.unwrap().is_retryable());

        let controller = AdmissionController::new(sink, Some(10));
        let decision = controller.admit(&"tenant-a".into(), TaskKind::Deliver).await;
        assert!(decision.allowed);
        assert_eq!(decision.quota, Some(10));
    }

    #[tokio::test]
    async fn test_zero_quota_denies() {
        let controller = AdmissionController::new(sink_with_tasks(Some(0), 0).await, None);
        let decision = controller.admit(&"tenant-a".into(), TaskKind::Acquire).await;
        assert_eq!(
            decision.reason,
            Some(DenialReason::QuotaExceeded { count: 0, quota: 0 })
        );
    }
}
