//! `/health` report: database, session, memory and uptime checks.

use {
    parley_session::SessionState,
    serde::Serialize,
};

use crate::state::GatewayState;

/// System memory use above this share of total degrades health.
const MEMORY_PRESSURE_PERCENT: u64 = 90;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub ok: bool,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct MemoryCheck {
    pub ok: bool,
    pub process_bytes: u64,
    pub used_bytes: u64,
    pub total_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthChecks {
    pub database: CheckResult,
    pub session: CheckResult,
    pub memory: MemoryCheck,
    pub uptime: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub timestamp: u64,
    pub checks: HealthChecks,
}

/// Combine the individual checks into one status.
///
/// A failed session is unhealthy outright. Anything else short of a
/// connected session with a working database degrades.
pub fn overall_status(session: SessionState, database_ok: bool, memory_ok: bool) -> HealthStatus {
    match session {
        SessionState::Failed => HealthStatus::Unhealthy,
        SessionState::Connected if database_ok && memory_ok => HealthStatus::Healthy,
        _ => HealthStatus::Degraded,
    }
}

pub(crate) fn memory_check() -> MemoryCheck {
    let mut sys = sysinfo::System::new();
    sys.refresh_memory();
    let pid = sysinfo::get_current_pid().ok();
    if let Some(pid) = pid {
        sys.refresh_processes_specifics(
            sysinfo::ProcessesToUpdate::Some(&[pid]),
            false,
            sysinfo::ProcessRefreshKind::nothing().with_memory(),
        );
    }
    let process_bytes = pid
        .and_then(|p| sys.process(p))
        .map(|p| p.memory())
        .unwrap_or(0);
    let total_bytes = sys.total_memory();
    let used_bytes = sys.used_memory();
    // Some platforms report zero; treat unknown as fine.
    let ok = total_bytes == 0 || used_bytes.saturating_mul(100) / total_bytes < MEMORY_PRESSURE_PERCENT;
    MemoryCheck {
        ok,
        process_bytes,
        used_bytes,
        total_bytes,
    }
}

pub async fn report(state: &GatewayState) -> HealthReport {
    let database = match state.store.ping().await {
        Ok(()) => CheckResult {
            ok: true,
            detail: "ok".into(),
        },
        Err(e) => CheckResult {
            ok: false,
            detail: e.to_string(),
        },
    };
    let session_state = state.session.state();
    let session = CheckResult {
        ok: session_state == SessionState::Connected,
        detail: session_state.to_string(),
    };
    let memory = tokio::task::spawn_blocking(memory_check)
        .await
        .unwrap_or(MemoryCheck {
            ok: true,
            process_bytes: 0,
            used_bytes: 0,
            total_bytes: 0,
        });

    HealthReport {
        status: overall_status(session_state, database.ok, memory.ok),
        timestamp: parley_common::now_ms(),
        checks: HealthChecks {
            database,
            session,
            memory,
            uptime: state.uptime_ms(),
        },
    }
}
