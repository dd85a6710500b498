//! The lease engine: allocation, renewal, release and reclamation over one
//! exclusively-locked reservation table.
//!
//! Every mutation takes the table's write lock for its whole read-decide-write
//! cycle and saves the full table before releasing it. Reads take the read lock
//! and see either the state before or after a mutation.

use chrono::{DateTime, Utc};
use portlease_common::{primary_port, MAIN_LABEL};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

use crate::config::PortRange;
use crate::error::EngineError;
use crate::liveness::Liveness;
use crate::probe::PortProbe;
use crate::reservation::{lease_deadline, Reservation, ReservationTable};
use crate::store::Store;

#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    pub range: PortRange,
    pub default_lease_secs: u64,
}

/// What a caller asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortRequest {
    /// One port labeled `main`, answered with a bare port number.
    Single { hint: Option<u16> },
    /// Label to optional preferred port.
    Named(BTreeMap<String, Option<u16>>),
    /// N ports labeled `"0"..="N-1"`.
    Count(usize),
}

impl PortRequest {
    fn validate(&self) -> Result<(), EngineError> {
        match self {
            PortRequest::Named(ports) if ports.is_empty() => Err(EngineError::InvalidRequest(
                "ports must name at least one label".to_string(),
            )),
            PortRequest::Count(0) => Err(EngineError::InvalidRequest(
                "count must be at least 1".to_string(),
            )),
            _ => Ok(()),
        }
    }

    /// Labels to resolve with their hints. `None` when a count cannot fit in `range`.
    fn labels(&self, range: PortRange) -> Option<Vec<(String, Option<u16>)>> {
        match self {
            PortRequest::Single { hint } => Some(vec![(MAIN_LABEL.to_string(), *hint)]),
            PortRequest::Named(ports) => Some(
                ports
                    .iter()
                    .map(|(label, hint)| (label.clone(), *hint))
                    .collect(),
            ),
            PortRequest::Count(n) if *n > range.size() => None,
            PortRequest::Count(n) => Some((0..*n).map(|i| (i.to_string(), None)).collect()),
        }
    }

    fn requested(&self) -> usize {
        match self {
            PortRequest::Single { .. } => 1,
            PortRequest::Named(ports) => ports.len(),
            PortRequest::Count(n) => *n,
        }
    }

    /// Shape `ports` the way this request expects its answer.
    fn project(&self, ports: BTreeMap<String, u16>) -> Allocation {
        match (self, primary_port(&ports)) {
            (PortRequest::Single { .. }, Some(port)) => Allocation::SinglePort(port),
            _ => Allocation::NamedPorts(ports),
        }
    }
}

/// Result of a successful allocation, tagged by the shape the caller used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Allocation {
    SinglePort(u16),
    NamedPorts(BTreeMap<String, u16>),
}

impl Allocation {
    pub fn primary_port(&self) -> Option<u16> {
        match self {
            Allocation::SinglePort(port) => Some(*port),
            Allocation::NamedPorts(ports) => primary_port(ports),
        }
    }
}

/// A reservation as seen by readers, with liveness computed at read time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationInfo {
    pub name: String,
    pub ports: BTreeMap<String, u16>,
    pub expires_at: DateTime<Utc>,
    pub owner_pid: Option<u32>,
    pub alive: bool,
}

/// What one sweep removed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    /// Reservations removed because their lease ran out.
    pub expired: Vec<String>,
    /// Reservations removed because every owning process died.
    pub abandoned: Vec<String>,
    /// Leases dropped from reservations that still have live leases.
    pub shrunk: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.expired.is_empty() && self.abandoned.is_empty() && self.shrunk == 0
    }
}

pub struct LeaseEngine {
    table: RwLock<ReservationTable>,
    store: Mutex<Store>,
    settings: EngineSettings,
    liveness: Arc<dyn Liveness>,
    probe: Arc<dyn PortProbe>,
}

impl LeaseEngine {
    /// Load the table from `store`, writing it straight back if any legacy
    /// records were migrated. An unreadable table starts empty.
    pub fn open(
        mut store: Store,
        settings: EngineSettings,
        liveness: Arc<dyn Liveness>,
        probe: Arc<dyn PortProbe>,
    ) -> Self {
        let table = match store.load() {
            Ok(loaded) => {
                if loaded.skipped > 0 {
                    warn!(skipped = loaded.skipped, "Dropped undecodable reservation records");
                }
                if loaded.migrated > 0 {
                    info!(migrated = loaded.migrated, "Migrated legacy single-port records");
                    if let Err(e) = store.save(&loaded.table) {
                        warn!(error = %e, "Failed to write migrated records back");
                    }
                }
                loaded.table
            }
            Err(e) => {
                warn!(error = %e, "Failed to load state, starting with an empty table");
                ReservationTable::new()
            }
        };
        info!(reservations = table.len(), "Lease table ready");

        Self {
            table: RwLock::new(table),
            store: Mutex::new(store),
            settings,
            liveness,
            probe,
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Reserve ports for `name`.
    ///
    /// A live reservation for `name` is returned unchanged whatever the request
    /// shape. Otherwise every requested label is resolved before anything is
    /// written, so a request either gets all its ports or none.
    pub fn allocate(
        &self,
        name: &str,
        request: &PortRequest,
        owner_pid: Option<u32>,
        lease_secs: Option<u64>,
    ) -> Result<Allocation, EngineError> {
        if name.trim().is_empty() {
            return Err(EngineError::InvalidRequest("name is required".to_string()));
        }
        request.validate()?;

        let now = Utc::now();
        let mut table = self.write_table();

        let mut discarded = false;
        if let Some(existing) = table.get(name) {
            if existing.is_alive(now, self.liveness.as_ref()) {
                debug!(service = name, ports = ?existing.ports(), "Returning existing reservation");
                return Ok(request.project(existing.ports()));
            }
            info!(
                service = name,
                ports = ?existing.ports(),
                "Owner gone or lease expired, discarding reservation"
            );
            table.remove(name);
            discarded = true;
        }

        let resolved = request
            .labels(self.settings.range)
            .and_then(|labels| self.resolve(&table, now, &labels));
        let Some(ports) = resolved else {
            if discarded {
                self.persist(&table);
            }
            let range = self.settings.range;
            warn!(service = name, requested = request.requested(), %range, "No free ports");
            return Err(EngineError::ResourceExhausted {
                name: name.to_string(),
                requested: request.requested(),
                low: range.low(),
                high: range.high(),
            });
        };

        let lease = lease_secs.unwrap_or(self.settings.default_lease_secs);
        table.insert(
            name.to_string(),
            Reservation::new(&ports, owner_pid, lease_deadline(now, lease)),
        );
        self.persist(&table);

        info!(service = name, ports = ?ports, lease, "Ports assigned");
        Ok(request.project(ports))
    }

    /// Pick a port for every label without touching the table. Hints go first,
    /// then the remaining labels share one ascending pass over the range.
    fn resolve(
        &self,
        table: &ReservationTable,
        now: DateTime<Utc>,
        labels: &[(String, Option<u16>)],
    ) -> Option<BTreeMap<String, u16>> {
        let mut taken: HashSet<u16> = table
            .values()
            .flat_map(|reservation| reservation.live_ports(now, self.liveness.as_ref()))
            .collect();

        let mut chosen = BTreeMap::new();
        let mut unresolved = Vec::new();
        for (label, hint) in labels {
            match hint {
                Some(port) if !taken.contains(port) && self.probe.is_bindable(*port) => {
                    taken.insert(*port);
                    chosen.insert(label.clone(), *port);
                }
                Some(port) => {
                    debug!(label = %label, port, "Hinted port unavailable, scanning range");
                    unresolved.push(label);
                }
                None => unresolved.push(label),
            }
        }

        let mut candidates = self.settings.range.iter();
        for label in unresolved {
            let port = candidates
                .by_ref()
                .find(|port| !taken.contains(port) && self.probe.is_bindable(*port))?;
            taken.insert(port);
            chosen.insert(label.clone(), port);
        }
        Some(chosen)
    }

    /// Extend the lease on `name` by the default lease. Unknown names are ignored.
    /// An expired reservation is only revived while none of its ports has been
    /// handed to another live lease; otherwise it is dropped.
    pub fn renew(&self, name: &str) -> bool {
        let now = Utc::now();
        let mut table = self.write_table();
        let Some(reservation) = table.get(name) else {
            debug!(service = name, "Heartbeat for unknown service");
            return false;
        };

        if reservation.is_expired(now) {
            let ports = reservation.ports();
            let claimed: HashSet<u16> = table
                .iter()
                .filter(|(other, _)| other.as_str() != name)
                .flat_map(|(_, other)| other.live_ports(now, self.liveness.as_ref()))
                .collect();
            if ports.values().any(|port| claimed.contains(port)) {
                info!(
                    service = name,
                    ports = ?ports,
                    "Heartbeat after expiry, ports already reassigned"
                );
                table.remove(name);
                self.persist(&table);
                return false;
            }
        }

        if let Some(reservation) = table.get_mut(name) {
            reservation.expires_at = lease_deadline(now, self.settings.default_lease_secs);
        }
        self.persist(&table);
        true
    }

    /// Release one labeled lease, or the whole reservation when `label` is `None`.
    /// Unknown names and labels are ignored.
    pub fn release(&self, name: &str, label: Option<&str>) -> bool {
        let mut table = self.write_table();
        let Some(reservation) = table.get_mut(name) else {
            return false;
        };

        match label {
            Some(label) => {
                let Some(lease) = reservation.port_map.remove(label) else {
                    debug!(service = name, label, "Release for unknown label");
                    return false;
                };
                info!(service = name, label, port = lease.port, "Port released");
                if reservation.port_map.is_empty() {
                    table.remove(name);
                }
            }
            None => {
                if let Some(reservation) = table.remove(name) {
                    info!(service = name, ports = ?reservation.ports(), "All ports released");
                }
            }
        }
        self.persist(&table);
        true
    }

    pub fn query(&self, name: &str) -> Option<ReservationInfo> {
        let now = Utc::now();
        let table = self.read_table();
        table.get(name).map(|reservation| self.describe(name, reservation, now))
    }

    pub fn list_all(&self) -> Vec<ReservationInfo> {
        let now = Utc::now();
        let table = self.read_table();
        table
            .iter()
            .map(|(name, reservation)| self.describe(name, reservation, now))
            .collect()
    }

    /// One reclamation pass: expired reservations go entirely, dead-owner leases
    /// are dropped individually. Saves once if anything changed.
    pub fn sweep(&self) -> SweepReport {
        let now = Utc::now();
        let mut table = self.write_table();
        let mut report = SweepReport::default();

        table.retain(|name, reservation| {
            if reservation.is_expired(now) {
                info!(service = %name, ports = ?reservation.ports(), "Lease expired");
                report.expired.push(name.clone());
                return false;
            }

            let dropped = reservation.drop_dead_leases(self.liveness.as_ref());
            if reservation.port_map.is_empty() {
                info!(
                    service = %name,
                    ports = ?dropped,
                    "All owning processes died, releasing ports"
                );
                report.abandoned.push(name.clone());
                return false;
            }
            if !dropped.is_empty() {
                info!(service = %name, ports = ?dropped, "Dropped leases of dead processes");
                report.shrunk += dropped.len();
            }
            true
        });

        if !report.is_empty() {
            self.persist(&table);
        }
        report
    }

    fn describe(
        &self,
        name: &str,
        reservation: &Reservation,
        now: DateTime<Utc>,
    ) -> ReservationInfo {
        ReservationInfo {
            name: name.to_string(),
            ports: reservation.ports(),
            expires_at: reservation.expires_at,
            owner_pid: reservation.owner_pid,
            alive: reservation.is_alive(now, self.liveness.as_ref()),
        }
    }

    /// Save failures are logged; the in-memory table stays authoritative.
    fn persist(&self, table: &ReservationTable) {
        let mut store = self.store.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = store.save(table) {
            warn!(error = %e, "Failed to save state, continuing from memory");
        }
    }

    fn read_table(&self) -> RwLockReadGuard<'_, ReservationTable> {
        self.table.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_table(&self) -> RwLockWriteGuard<'_, ReservationTable> {
        self.table.write().unwrap_or_else(PoisonError::into_inner)
    }
}
