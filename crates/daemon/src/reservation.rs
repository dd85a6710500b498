use chrono::{DateTime, Duration, Utc};
use portlease_common::{primary_port, MAIN_LABEL};
use std::collections::BTreeMap;

use crate::liveness::Liveness;

/// All reservations, keyed by service name.
pub type ReservationTable = BTreeMap<String, Reservation>;

/// One allocated port inside a reservation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortLease {
    pub port: u16,
    pub owner_pid: Option<u32>,
}

/// The set of leases held under one service name.
///
/// `port_map` is never empty for a reservation stored in the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub port_map: BTreeMap<String, PortLease>,
    pub expires_at: DateTime<Utc>,
    pub owner_pid: Option<u32>,
}

impl Reservation {
    /// Builds a reservation where every lease is owned by `owner_pid`.
    pub fn new(
        ports: &BTreeMap<String, u16>,
        owner_pid: Option<u32>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        let port_map = ports
            .iter()
            .map(|(label, port)| (label.clone(), PortLease { port: *port, owner_pid }))
            .collect();
        Self {
            port_map,
            expires_at,
            owner_pid,
        }
    }

    /// A single lease labeled `main`, the shape of a pre-multiport record.
    pub fn single(port: u16, owner_pid: Option<u32>, expires_at: DateTime<Utc>) -> Self {
        let mut ports = BTreeMap::new();
        ports.insert(MAIN_LABEL.to_string(), port);
        Self::new(&ports, owner_pid, expires_at)
    }

    pub fn ports(&self) -> BTreeMap<String, u16> {
        self.port_map
            .iter()
            .map(|(label, lease)| (label.clone(), lease.port))
            .collect()
    }

    pub fn primary_port(&self) -> Option<u16> {
        primary_port(&self.ports())
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Alive when unexpired and every recorded owner process still exists.
    pub fn is_alive(&self, now: DateTime<Utc>, liveness: &dyn Liveness) -> bool {
        !self.is_expired(now)
            && liveness.is_owner_alive(self.owner_pid)
            && self
                .port_map
                .values()
                .all(|lease| liveness.is_owner_alive(lease.owner_pid))
    }

    /// Ports still held by live leases. Nothing is live once the reservation has expired.
    pub fn live_ports<'a>(
        &'a self,
        now: DateTime<Utc>,
        liveness: &'a dyn Liveness,
    ) -> impl Iterator<Item = u16> + 'a {
        let expired = self.is_expired(now);
        self.port_map
            .values()
            .filter(move |lease| !expired && liveness.is_owner_alive(lease.owner_pid))
            .map(|lease| lease.port)
    }

    /// Removes leases whose owner process is gone, returning what was dropped.
    pub fn drop_dead_leases(&mut self, liveness: &dyn Liveness) -> Vec<(String, u16)> {
        let dead: Vec<(String, u16)> = self
            .port_map
            .iter()
            .filter(|(_, lease)| !liveness.is_owner_alive(lease.owner_pid))
            .map(|(label, lease)| (label.clone(), lease.port))
            .collect();
        for (label, _) in &dead {
            self.port_map.remove(label);
        }
        dead
    }
}

/// `now + secs`, saturating at the latest representable instant.
pub fn lease_deadline(now: DateTime<Utc>, secs: u64) -> DateTime<Utc> {
    i64::try_from(secs)
        .ok()
        .and_then(Duration::try_seconds)
        .and_then(|lease| now.checked_add_signed(lease))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// Liveness oracle where every pid is alive until killed.
    #[derive(Default)]
    pub struct FakeLiveness {
        dead: Mutex<HashSet<u32>>,
    }

    impl FakeLiveness {
        pub fn kill(&self, pid: u32) {
            self.dead.lock().unwrap().insert(pid);
        }
    }

    impl Liveness for FakeLiveness {
        fn is_alive(&self, pid: u32) -> bool {
            !self.dead.lock().unwrap().contains(&pid)
        }
    }

    fn sample(owner: Option<u32>) -> Reservation {
        let mut ports = BTreeMap::new();
        ports.insert("main".to_string(), 3000);
        ports.insert("api".to_string(), 3001);
        Reservation::new(&ports, owner, Utc::now() + Duration::seconds(60))
    }

    #[test]
    fn expired_reservation_holds_no_live_ports() {
        let liveness = FakeLiveness::default();
        let mut reservation = sample(None);
        let now = Utc::now();
        assert_eq!(reservation.live_ports(now, &liveness).count(), 2);

        reservation.expires_at = now - Duration::seconds(1);
        assert_eq!(reservation.live_ports(now, &liveness).count(), 0);
        assert!(!reservation.is_alive(now, &liveness));
    }

    #[test]
    fn dead_sub_lease_makes_reservation_stale() {
        let liveness = FakeLiveness::default();
        let mut reservation = sample(None);
        reservation.port_map.get_mut("api").unwrap().owner_pid = Some(42);
        assert!(reservation.is_alive(Utc::now(), &liveness));

        liveness.kill(42);
        assert!(!reservation.is_alive(Utc::now(), &liveness));
        assert_eq!(reservation.live_ports(Utc::now(), &liveness).collect::<Vec<_>>(), vec![3000]);
    }

    #[test]
    fn drop_dead_leases_keeps_survivors() {
        let liveness = FakeLiveness::default();
        let mut reservation = sample(None);
        reservation.port_map.get_mut("api").unwrap().owner_pid = Some(7);
        liveness.kill(7);

        let dropped = reservation.drop_dead_leases(&liveness);
        assert_eq!(dropped, vec![("api".to_string(), 3001)]);
        assert_eq!(reservation.ports().len(), 1);
        assert_eq!(reservation.primary_port(), Some(3000));
    }

    #[test]
    fn single_is_main_labeled() {
        let reservation = Reservation::single(3001, Some(1234), Utc::now());
        assert_eq!(reservation.ports().get("main"), Some(&3001));
        assert_eq!(reservation.port_map["main"].owner_pid, Some(1234));
    }

    #[test]
    fn huge_lease_saturates() {
        assert_eq!(lease_deadline(Utc::now(), u64::MAX), DateTime::<Utc>::MAX_UTC);
    }
}
