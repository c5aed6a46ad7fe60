use crate::{
    engine::SYSTEM_ACTOR,
    error::Result,
    repository::{AssignmentStore, GrantStore},
};
use audit_trail::{AuditEntry, AuditEvent, AuditSink};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// What one sweep pass announced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub assignments_expired: usize,
    pub grants_expired: usize,
}

/// Periodic observer of expiries, decoupled from the request path.
///
/// `decide` always re-checks expiry live; the sweep exists to put
/// `role.expired` / `acl.expired` entries on the audit trail exactly once
/// per newly expired row, for observability and expiry notifications. An
/// entry that cannot be recorded is retried on the next pass, since the row
/// is only marked announced after its entry persisted.
pub struct ExpirySweeper {
    assignments: Arc<dyn AssignmentStore>,
    grants: Arc<dyn GrantStore>,
    audit: Arc<dyn AuditSink>,
    interval: Duration,
}

impl ExpirySweeper {
    pub fn new(
        assignments: Arc<dyn AssignmentStore>,
        grants: Arc<dyn GrantStore>,
        audit: Arc<dyn AuditSink>,
        interval: Duration,
    ) -> Self {
        Self {
            assignments,
            grants,
            audit,
            interval,
        }
    }

    /// Run forever at the configured interval. Spawn on the runtime:
    /// `tokio::spawn(sweeper.run())`.
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            match self.sweep_once().await {
                Ok(report)
                    if report.assignments_expired > 0 || report.grants_expired > 0 =>
                {
                    info!(
                        assignments = report.assignments_expired,
                        grants = report.grants_expired,
                        "expiry sweep announced newly expired rows"
                    );
                }
                Ok(_) => {}
                Err(err) => warn!(%err, "expiry sweep failed, will retry next interval"),
            }
        }
    }

    /// One pass: announce every expired-but-unannounced assignment and
    /// grant, marking each row only after its audit entry persisted.
    pub async fn sweep_once(&self) -> Result<SweepReport> {
        let now = Utc::now();
        let mut report = SweepReport::default();

        for assignment in self.assignments.expired_unannounced(now).await? {
            let target = format!(
                "principal:{} role:{}",
                assignment.principal_id, assignment.role_id
            );
            let entry = AuditEntry::new(AuditEvent::RoleExpired, SYSTEM_ACTOR, target)
                .with_before(serde_json::to_value(&assignment).map_err(anyhow::Error::from)?);
            self.audit.record(entry).await?;
            self.assignments
                .mark_expiry_announced(&[assignment.id])
                .await?;
            report.assignments_expired += 1;
        }

        for grant in self.grants.expired_unannounced(now).await? {
            let target = format!(
                "principal:{} {} capability:{}",
                grant.principal_id, grant.resource, grant.capability
            );
            let entry = AuditEntry::new(AuditEvent::AclExpired, SYSTEM_ACTOR, target)
                .with_before(serde_json::to_value(&grant).map_err(anyhow::Error::from)?);
            self.audit.record(entry).await?;
            self.grants.mark_expiry_announced(&[grant.id]).await?;
            report.grants_expired += 1;
        }

        Ok(report)
    }
}
