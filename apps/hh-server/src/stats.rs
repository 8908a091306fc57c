use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use hh_core::{AppRecord, HealthGrade};
use serde::Serialize;

use crate::app_state::AppContext;
use crate::host::{HostStats, ProcessStats};
use crate::ports::PortStats;
use crate::ui_supervisor::UiStatus;

#[derive(Clone, Debug, Default, Serialize, PartialEq, Eq)]
pub struct AppStats {
    pub total: usize,
    pub services: usize,
    pub interactive: usize,
    pub invalid: usize,
    pub needs_reinstall: usize,
    pub by_state: BTreeMap<&'static str, usize>,
}

#[derive(Clone, Debug, Default, Serialize, PartialEq, Eq)]
pub struct HealthStats {
    pub good: usize,
    pub warning: usize,
    pub error: usize,
    pub unknown: usize,
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct EventStats {
    pub recent: usize,
    pub subscribers: usize,
}

#[derive(Clone, Debug, Serialize)]
pub struct SystemStats {
    pub generated_at: DateTime<Utc>,
    pub uptime_secs: i64,
    pub apps: AppStats,
    pub health: HealthStats,
    pub ports: PortStats,
    pub ui: UiStatus,
    pub events: EventStats,
    pub host: HostStats,
    pub processes: Vec<ProcessStats>,
}

pub fn app_stats(records: &[AppRecord]) -> AppStats {
    let mut stats = AppStats {
        total: records.len(),
        ..AppStats::default()
    };
    for record in records {
        if record.is_service() {
            stats.services += 1;
        } else if record.is_interactive() {
            stats.interactive += 1;
        } else {
            stats.invalid += 1;
        }
        if record.needs_reinstall {
            stats.needs_reinstall += 1;
        }
        *stats.by_state.entry(record.state.as_str()).or_default() += 1;
    }
    stats
}

/// Counts services by their current grade; stale observations count as unknown.
pub fn health_stats(records: &[AppRecord], now: DateTime<Utc>, staleness: Duration) -> HealthStats {
    let mut stats = HealthStats::default();
    for record in records.iter().filter(|record| record.is_service()) {
        match record.health.current(now, staleness).grade {
            HealthGrade::Good => stats.good += 1,
            HealthGrade::Warning => stats.warning += 1,
            HealthGrade::Error => stats.error += 1,
            HealthGrade::Unknown => stats.unknown += 1,
        }
    }
    stats
}

/// `(app_id, pid)` of every app the core believes has a live process.
pub fn tracked_pids(records: &[AppRecord]) -> Vec<(String, u32)> {
    records
        .iter()
        .filter_map(|record| record.pid.map(|pid| (record.app_id.clone(), pid)))
        .collect()
}

pub async fn collect(ctx: &AppContext) -> SystemStats {
    let now = Utc::now();
    let records = ctx.registry().list().await;
    let (host, processes) = ctx.host().snapshot(tracked_pids(&records)).await;
    SystemStats {
        generated_at: now,
        uptime_secs: (now - ctx.started_at()).num_seconds().max(0),
        apps: app_stats(&records),
        health: health_stats(&records, now, ctx.health().staleness()),
        ports: ctx.ports().stats().await,
        ui: ctx.ui().status().await,
        events: EventStats {
            recent: ctx.events().recent_len(),
            subscribers: ctx.events().subscriber_count(),
        },
        host,
        processes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{interactive_record, service_record};
    use hh_core::{AppState, HealthStatus};

    #[test]
    fn apps_are_counted_by_kind_and_state() {
        let mut running = service_record("a");
        running.state = AppState::Running;
        let mut flagged = service_record("b");
        flagged.needs_reinstall = true;
        let broken = AppRecord::invalid("c", "/srv/apps/c".into(), "bad manifest");
        let stats = app_stats(&[running, flagged, interactive_record("d"), broken]);
        assert_eq!(stats.total, 4);
        assert_eq!(stats.services, 2);
        assert_eq!(stats.interactive, 1);
        assert_eq!(stats.invalid, 1);
        assert_eq!(stats.needs_reinstall, 1);
        assert_eq!(stats.by_state.get("running"), Some(&1));
        assert_eq!(stats.by_state.get("registered"), Some(&2));
        assert_eq!(stats.by_state.get("failed"), Some(&1));
    }

    #[test]
    fn only_records_with_a_pid_are_sampled() {
        let mut running = service_record("a");
        running.pid = Some(4242);
        let stopped = service_record("b");
        let mut ui = interactive_record("ui");
        ui.pid = Some(5151);
        assert_eq!(
            tracked_pids(&[running, stopped, ui]),
            vec![("a".to_string(), 4242), ("ui".to_string(), 5151)]
        );
    }

    #[test]
    fn stale_or_missing_health_is_unknown() {
        let now = Utc::now();
        let mut fresh = service_record("fresh");
        fresh
            .health
            .push(HealthStatus::new(HealthGrade::Warning, "slow").at(now), 5);
        let mut stale = service_record("stale");
        stale.health.push(
            HealthStatus::new(HealthGrade::Good, "ok").at(now - chrono::Duration::minutes(10)),
            5,
        );
        let never = service_record("never");
        let records = [fresh, stale, never, interactive_record("ui")];
        let stats = health_stats(&records, now, Duration::from_secs(180));
        assert_eq!(
            stats,
            HealthStats {
                good: 0,
                warning: 1,
                error: 0,
                unknown: 2,
            }
        );
    }
}
