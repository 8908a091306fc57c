use std::collections::{BTreeMap, HashSet};
use std::ops::RangeInclusive;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use hh_core::config::PortsConfig;
use hh_core::{AppKind, AppRecord};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::persist::{self, PersistError};

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum PortError {
    #[error("no free port in {start}-{end}")]
    Exhausted { start: u16, end: u16 },
    #[error("interactive port {port} is held by `{holder}`")]
    SlotBusy { port: u16, holder: String },
    #[error("port {port} is already assigned to `{holder}`")]
    Taken { port: u16, holder: String },
    #[error("port {port} is outside {start}-{end}")]
    OutOfRange { port: u16, start: u16, end: u16 },
    #[error("failed to persist port map: {0}")]
    Persist(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
struct PortTable {
    services: BTreeMap<u16, String>,
    interactive_holder: Option<String>,
}

impl PortTable {
    fn port_of(&self, app_id: &str) -> Option<u16> {
        self.services
            .iter()
            .find_map(|(port, owner)| (owner == app_id).then_some(*port))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PortMapFile {
    version: String,
    last_updated: DateTime<Utc>,
    services: BTreeMap<u16, String>,
    #[serde(default)]
    interactive_port: Option<u16>,
    #[serde(default)]
    interactive_holder: Option<String>,
}

/// A disagreement between the persisted port map and the registry snapshot.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PortMismatch {
    pub app_id: String,
    pub registry_port: u16,
    pub port_map_port: Option<u16>,
    /// Port the app ends up with after recovery (0 if none).
    pub resolved_port: u16,
    pub resolution: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PortStats {
    pub range_start: u16,
    pub range_end: u16,
    pub total: usize,
    pub allocated: usize,
    pub available: usize,
    pub utilization_percent: f64,
    pub interactive_port: u16,
    pub interactive_holder: Option<String>,
    pub mismatches: usize,
}

/// Serialized owner of the service port range and the single interactive slot.
/// Every mutation is written to disk before it becomes visible.
pub struct PortAllocator {
    range: RangeInclusive<u16>,
    interactive_port: u16,
    path: Option<PathBuf>,
    table: Mutex<PortTable>,
    mismatches: parking_lot::Mutex<Vec<PortMismatch>>,
}

impl PortAllocator {
    pub fn new(config: &PortsConfig, path: Option<PathBuf>) -> Self {
        if (config.range_start..=config.range_end).contains(&config.interactive_port) {
            warn!(
                target: "homehelper::ports",
                port = config.interactive_port,
                "interactive port lies inside the service range; it will be skipped"
            );
        }
        Self {
            range: config.range_start..=config.range_end,
            interactive_port: config.interactive_port,
            path,
            table: Mutex::new(PortTable::default()),
            mismatches: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Restores the persisted map. Entries outside the configured range are dropped; an
    /// unreadable file starts an empty map.
    pub async fn load(config: &PortsConfig, path: PathBuf) -> Self {
        let allocator = Self::new(config, Some(path.clone()));
        match persist::read_json::<PortMapFile>(&path).await {
            Ok(Some(file)) => {
                let mut table = allocator.table.lock().await;
                for (port, owner) in file.services {
                    if allocator.range.contains(&port) && port != allocator.interactive_port {
                        table.services.insert(port, owner);
                    } else {
                        warn!(
                            target: "homehelper::ports",
                            port,
                            app = %owner,
                            "dropping persisted port outside configured range"
                        );
                    }
                }
                table.interactive_holder = file.interactive_holder;
                info!(
                    target: "homehelper::ports",
                    path = %path.display(),
                    allocated = table.services.len(),
                    "port map restored"
                );
            }
            Ok(None) => debug!(target: "homehelper::ports", path = %path.display(), "no port map yet"),
            Err(err) => warn!(
                target: "homehelper::ports",
                path = %path.display(),
                error = %err,
                "port map unreadable; starting empty"
            ),
        }
        allocator
    }

    pub fn interactive_port(&self) -> u16 {
        self.interactive_port
    }

    pub async fn allocate(&self, app_id: &str, kind: AppKind) -> Result<u16, PortError> {
        let mut table = self.table.lock().await;
        match kind {
            AppKind::Service => {
                if let Some(port) = table.port_of(app_id) {
                    return Ok(port);
                }
                let port = self
                    .range
                    .clone()
                    .filter(|port| *port != self.interactive_port)
                    .find(|port| !table.services.contains_key(port))
                    .ok_or(PortError::Exhausted {
                        start: *self.range.start(),
                        end: *self.range.end(),
                    })?;
                let mut next = table.clone();
                next.services.insert(port, app_id.to_string());
                self.commit(&mut table, next).await?;
                debug!(target: "homehelper::ports", app = %app_id, port, "service port allocated");
                Ok(port)
            }
            AppKind::Interactive => {
                match table.interactive_holder.as_deref() {
                    Some(holder) if holder == app_id => return Ok(self.interactive_port),
                    Some(holder) => {
                        return Err(PortError::SlotBusy {
                            port: self.interactive_port,
                            holder: holder.to_string(),
                        })
                    }
                    None => {}
                }
                let mut next = table.clone();
                next.interactive_holder = Some(app_id.to_string());
                self.commit(&mut table, next).await?;
                debug!(target: "homehelper::ports", app = %app_id, "interactive slot taken");
                Ok(self.interactive_port)
            }
        }
    }

    /// Pins `port` to `app_id`, used when restoring a previously persisted assignment.
    pub async fn reserve(&self, app_id: &str, port: u16) -> Result<(), PortError> {
        if !self.range.contains(&port) || port == self.interactive_port {
            return Err(PortError::OutOfRange {
                port,
                start: *self.range.start(),
                end: *self.range.end(),
            });
        }
        let mut table = self.table.lock().await;
        match table.services.get(&port) {
            Some(owner) if owner == app_id => return Ok(()),
            Some(owner) => {
                return Err(PortError::Taken {
                    port,
                    holder: owner.clone(),
                })
            }
            None => {}
        }
        let mut next = table.clone();
        next.services.retain(|_, owner| owner != app_id);
        next.services.insert(port, app_id.to_string());
        self.commit(&mut table, next).await
    }

    /// Frees every port held by `app_id`. Returns the released ports.
    pub async fn release(&self, app_id: &str) -> Result<Vec<u16>, PortError> {
        let mut table = self.table.lock().await;
        let mut released = Vec::new();
        let mut next = table.clone();
        next.services.retain(|port, owner| {
            let keep = owner != app_id;
            if !keep {
                released.push(*port);
            }
            keep
        });
        if next.interactive_holder.as_deref() == Some(app_id) {
            next.interactive_holder = None;
            released.push(self.interactive_port);
        }
        if released.is_empty() {
            return Ok(released);
        }
        self.commit(&mut table, next).await?;
        debug!(target: "homehelper::ports", app = %app_id, ?released, "ports released");
        Ok(released)
    }

    /// Frees the interactive slot if `app_id` holds it.
    pub async fn release_interactive(&self, app_id: &str) -> Result<bool, PortError> {
        let mut table = self.table.lock().await;
        if table.interactive_holder.as_deref() != Some(app_id) {
            return Ok(false);
        }
        let mut next = table.clone();
        next.interactive_holder = None;
        self.commit(&mut table, next).await?;
        Ok(true)
    }

    pub async fn port_of(&self, app_id: &str) -> Option<u16> {
        self.table.lock().await.port_of(app_id)
    }

    pub async fn interactive_holder(&self) -> Option<String> {
        self.table.lock().await.interactive_holder.clone()
    }

    /// Cross-checks the persisted map against registry records after a restart.
    ///
    /// The port map is written on every mutation, so it wins over the (debounced) registry
    /// snapshot, except that a registry port unknown to the map is re-reserved when free.
    /// Entries for apps the registry does not know are kept: the snapshot may be stale or
    /// lost, and discovery re-claims them through [`Self::allocate`]. The interactive slot is
    /// always freed since no UI process outlives the core. Every disagreement is returned and
    /// kept for stats.
    pub async fn reconcile(&self, records: &[AppRecord]) -> Result<Vec<PortMismatch>, PortError> {
        let mut table = self.table.lock().await;
        let mut next = table.clone();
        let mut mismatches = Vec::new();

        for record in records.iter().filter(|record| record.is_service()) {
            let mapped = next.port_of(&record.app_id);
            match (record.port, mapped) {
                (registry, Some(mapped)) if registry == mapped => {}
                (0, Some(mapped)) => mismatches.push(PortMismatch {
                    app_id: record.app_id.clone(),
                    registry_port: 0,
                    port_map_port: Some(mapped),
                    resolved_port: mapped,
                    resolution: "adopted port from port map".into(),
                }),
                (registry, Some(mapped)) => mismatches.push(PortMismatch {
                    app_id: record.app_id.clone(),
                    registry_port: registry,
                    port_map_port: Some(mapped),
                    resolved_port: mapped,
                    resolution: "registry port replaced by port map".into(),
                }),
                (0, None) => {}
                (registry, None) => {
                    let free = self.range.contains(&registry)
                        && registry != self.interactive_port
                        && !next.services.contains_key(&registry);
                    let resolved = if free {
                        next.services.insert(registry, record.app_id.clone());
                        registry
                    } else {
                        0
                    };
                    mismatches.push(PortMismatch {
                        app_id: record.app_id.clone(),
                        registry_port: registry,
                        port_map_port: None,
                        resolved_port: resolved,
                        resolution: if free {
                            "re-reserved registry port missing from port map".into()
                        } else {
                            "registry port unavailable; will reallocate on start".into()
                        },
                    });
                }
            }
        }

        if let Some(holder) = next.interactive_holder.take() {
            mismatches.push(PortMismatch {
                app_id: holder,
                registry_port: 0,
                port_map_port: Some(self.interactive_port),
                resolved_port: 0,
                resolution: "released stale interactive slot".into(),
            });
        }

        if next != *table {
            self.commit(&mut table, next).await?;
        }
        self.record_mismatches(&mismatches);
        Ok(mismatches)
    }

    /// Releases map entries whose owner is not a registered service. Run once discovery has
    /// settled the registry, so apps that merely lost their snapshot entry keep their port.
    pub async fn release_orphans(
        &self,
        records: &[AppRecord],
    ) -> Result<Vec<PortMismatch>, PortError> {
        let services = records
            .iter()
            .filter(|record| record.is_service())
            .map(|record| record.app_id.as_str())
            .collect::<HashSet<_>>();
        let mut table = self.table.lock().await;
        let mut next = table.clone();
        let mut mismatches = Vec::new();
        next.services.retain(|port, owner| {
            if services.contains(owner.as_str()) {
                return true;
            }
            mismatches.push(PortMismatch {
                app_id: owner.clone(),
                registry_port: 0,
                port_map_port: Some(*port),
                resolved_port: 0,
                resolution: "released port of unknown app".into(),
            });
            false
        });
        if mismatches.is_empty() {
            return Ok(mismatches);
        }
        self.commit(&mut table, next).await?;
        self.record_mismatches(&mismatches);
        Ok(mismatches)
    }

    fn record_mismatches(&self, mismatches: &[PortMismatch]) {
        for mismatch in mismatches {
            warn!(
                target: "homehelper::ports",
                app = %mismatch.app_id,
                registry_port = mismatch.registry_port,
                port_map_port = ?mismatch.port_map_port,
                resolved_port = mismatch.resolved_port,
                resolution = %mismatch.resolution,
                "port allocation mismatch"
            );
        }
        self.mismatches.lock().extend(mismatches.iter().cloned());
    }

    pub fn mismatches(&self) -> Vec<PortMismatch> {
        self.mismatches.lock().clone()
    }

    pub async fn stats(&self) -> PortStats {
        let table = self.table.lock().await;
        let total = self
            .range
            .clone()
            .filter(|port| *port != self.interactive_port)
            .count();
        let allocated = table.services.len();
        let utilization_percent = if total == 0 {
            0.0
        } else {
            ((allocated as f64 / total as f64) * 1000.0).round() / 10.0
        };
        PortStats {
            range_start: *self.range.start(),
            range_end: *self.range.end(),
            total,
            allocated,
            available: total.saturating_sub(allocated),
            utilization_percent,
            interactive_port: self.interactive_port,
            interactive_holder: table.interactive_holder.clone(),
            mismatches: self.mismatches.lock().len(),
        }
    }

    async fn commit(&self, table: &mut PortTable, next: PortTable) -> Result<(), PortError> {
        if let Some(path) = self.path.as_ref() {
            let file = PortMapFile {
                version: "1.0".into(),
                last_updated: Utc::now(),
                services: next.services.clone(),
                interactive_port: Some(self.interactive_port),
                interactive_holder: next.interactive_holder.clone(),
            };
            persist::write_json_atomic(path, &file)
                .await
                .map_err(|err: PersistError| PortError::Persist(err.to_string()))?;
        }
        *table = next;
        Ok(())
    }
}
