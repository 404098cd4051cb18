//! Path-vector routing table.
//!
//! Each endpoint floods versioned subscription advertisements. An advert
//! names its origin, the origin's filter, a per-origin version, and the path
//! of relays it traveled. Receiving endpoints keep at most one entry per
//! destination (best distance, tie-broken by the total order on endpoint
//! ids), rebroadcast improvements with split horizon, and answer explicit
//! withdrawals. Withdrawn `(destination, path)` pairs are blacklisted for a
//! bounded time to suppress flapping.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use tracing::{debug, trace};
use weft_core::protocol::{PathWithdrawal, SubscriptionAdvert};
use weft_core::topic::prefix_match;
use weft_core::types::version_newer;
use weft_core::{EndpointId, Error, Result, Topic};

/// Best-known route to one destination.
#[derive(Debug, Clone)]
pub struct RouteEntry {
    /// The directly-connected peer the advert arrived from.
    pub next_hop: EndpointId,
    /// Hop count to the destination.
    pub distance: usize,
    /// Version of the installed announcement.
    pub version: u64,
    /// Relay path as advertised, oldest first, ending at `next_hop`.
    pub path: Vec<EndpointId>,
    /// When the route was last confirmed.
    pub last_refresh: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct BlacklistEntry {
    dest: EndpointId,
    path: Vec<EndpointId>,
    first_seen: Instant,
}

/// Result of processing a subscription advertisement.
#[derive(Debug)]
pub enum AdvertOutcome {
    /// Stale version, echo of our own announcement, or blacklisted path.
    Ignored,
    /// Known route confirmed; the last-refresh timestamp moved.
    Refreshed,
    /// A new best route was installed and should be rebroadcast.
    Installed {
        /// The destination was previously unknown.
        newly_discovered: bool,
        /// The advert to flood to other peers, path already extended by the
        /// local endpoint.
        rebroadcast: SubscriptionAdvert,
    },
}

/// Result of processing a path withdrawal.
#[derive(Debug)]
pub struct WithdrawalOutcome {
    /// Destinations whose entry was removed because it routed via the sender.
    pub removed: Vec<EndpointId>,
    /// The withdrawal to flood onward, covering only what we removed.
    pub rebroadcast: Option<PathWithdrawal>,
}

/// The routing table owned by the dispatcher.
#[derive(Debug)]
pub struct RoutingTable {
    local: EndpointId,
    entries: HashMap<EndpointId, RouteEntry>,
    by_next_hop: HashMap<EndpointId, HashSet<EndpointId>>,
    direct: HashSet<EndpointId>,
    filters: HashMap<EndpointId, Vec<Topic>>,
    filter_versions: HashMap<EndpointId, u64>,
    seen_versions: HashMap<(EndpointId, EndpointId), u64>,
    blacklist: Vec<BlacklistEntry>,
    blacklist_max_age: Duration,
    local_version: u64,
}

impl RoutingTable {
    /// Create an empty table for the given local endpoint.
    pub fn new(local: EndpointId, blacklist_max_age: Duration) -> Self {
        Self {
            local,
            entries: HashMap::new(),
            by_next_hop: HashMap::new(),
            direct: HashSet::new(),
            filters: HashMap::new(),
            filter_versions: HashMap::new(),
            seen_versions: HashMap::new(),
            blacklist: Vec::new(),
            blacklist_max_age,
            local_version: 0,
        }
    }

    /// Bump and return the local announcement version.
    pub fn bump_version(&mut self) -> u64 {
        self.local_version = self.local_version.wrapping_add(1);
        self.local_version
    }

    /// Record a new direct connection.
    pub fn peer_connected(&mut self, peer: EndpointId) {
        self.direct.insert(peer);
    }

    /// Whether `peer` is directly connected.
    pub fn is_direct(&self, peer: EndpointId) -> bool {
        self.direct.contains(&peer)
    }

    /// Process a subscription advertisement received from the direct peer
    /// `sender`.
    ///
    /// # Errors
    /// Returns [`Error::ProtocolViolation`] for structurally inconsistent
    /// adverts; the caller closes the offending peer.
    pub fn handle_advert(
        &mut self,
        sender: EndpointId,
        advert: &SubscriptionAdvert,
        now: Instant,
    ) -> Result<AdvertOutcome> {
        self.check_flood(sender, advert.origin, &advert.path)?;
        if advert.origin == self.local || advert.path.contains(&self.local) {
            return Ok(AdvertOutcome::Ignored);
        }
        if !self.direct.contains(&sender) {
            // The peer raced its own disconnect; routing state for it is gone.
            return Ok(AdvertOutcome::Ignored);
        }
        let gate = (advert.origin, sender);
        if let Some(&seen) = self.seen_versions.get(&gate) {
            if !version_newer(advert.version, seen) {
                trace!(origin = %advert.origin, version = advert.version, "stale advert ignored");
                return Ok(AdvertOutcome::Ignored);
            }
        }
        self.seen_versions.insert(gate, advert.version);
        if self.blacklisted(advert.origin, &advert.path) {
            debug!(origin = %advert.origin, "advert for a blacklisted path ignored");
            return Ok(AdvertOutcome::Ignored);
        }

        // Track the freshest filter we have seen for the origin, independent
        // of whether the route improves.
        let filter_version = self.filter_versions.entry(advert.origin).or_insert(0);
        if *filter_version == 0 || version_newer(advert.version, *filter_version) {
            *filter_version = advert.version;
            self.filters.insert(advert.origin, advert.filter.clone());
        }

        let distance = advert.path.len() + 1;
        let current = self.entries.get(&advert.origin);
        let newly_discovered = current.is_none();
        let install = match current {
            None => true,
            Some(entry) => {
                distance < entry.distance
                    || (distance == entry.distance && sender < entry.next_hop)
            }
        };
        if !install {
            if let Some(entry) = self.entries.get_mut(&advert.origin) {
                entry.last_refresh = now;
            }
            return Ok(AdvertOutcome::Refreshed);
        }

        if let Some(old) = self.entries.insert(
            advert.origin,
            RouteEntry {
                next_hop: sender,
                distance,
                version: advert.version,
                path: advert.path.clone(),
                last_refresh: now,
            },
        ) {
            self.unindex(old.next_hop, advert.origin);
        }
        self.by_next_hop.entry(sender).or_default().insert(advert.origin);
        self.local_version = self.local_version.wrapping_add(1);
        debug!(
            origin = %advert.origin,
            via = %sender,
            distance,
            "installed route"
        );

        let mut rebroadcast = advert.clone();
        rebroadcast.path.push(self.local);
        Ok(AdvertOutcome::Installed { newly_discovered, rebroadcast })
    }

    /// Process a path withdrawal received from the direct peer `sender`.
    ///
    /// # Errors
    /// Returns [`Error::ProtocolViolation`] for structurally inconsistent
    /// withdrawals.
    pub fn handle_withdrawal(
        &mut self,
        sender: EndpointId,
        withdrawal: &PathWithdrawal,
        now: Instant,
    ) -> Result<WithdrawalOutcome> {
        self.check_flood(sender, withdrawal.origin, &withdrawal.path)?;
        if withdrawal.origin == self.local || withdrawal.path.contains(&self.local) {
            return Ok(WithdrawalOutcome { removed: Vec::new(), rebroadcast: None });
        }
        let gate = (withdrawal.origin, sender);
        if let Some(&seen) = self.seen_versions.get(&gate) {
            if !version_newer(withdrawal.version, seen) {
                return Ok(WithdrawalOutcome { removed: Vec::new(), rebroadcast: None });
            }
        }
        self.seen_versions.insert(gate, withdrawal.version);

        let mut removed = Vec::new();
        for dest in &withdrawal.destinations {
            if *dest == self.local {
                continue;
            }
            let Some(entry) = self.entries.get(dest) else { continue };
            if entry.next_hop != sender {
                // Our best path does not run through the withdrawing peer.
                continue;
            }
            self.remove_entry(*dest, now);
            removed.push(*dest);
        }
        let rebroadcast = if removed.is_empty() {
            None
        } else {
            let mut onward = withdrawal.clone();
            onward.destinations = removed.clone();
            onward.path.push(self.local);
            Some(onward)
        };
        Ok(WithdrawalOutcome { removed, rebroadcast })
    }

    /// Drop all state that depended on a disconnected direct peer. Returns
    /// the destinations that became unreachable, the peer itself included.
    pub fn peer_disconnected(&mut self, peer: EndpointId, now: Instant) -> Vec<EndpointId> {
        self.direct.remove(&peer);
        let mut removed: Vec<EndpointId> =
            self.by_next_hop.get(&peer).map(|dests| dests.iter().copied().collect()).unwrap_or_default();
        if self.entries.contains_key(&peer) && !removed.contains(&peer) {
            removed.push(peer);
        }
        for dest in &removed {
            self.remove_entry(*dest, now);
        }
        // Reset version gates involving the peer so a restarted instance can
        // re-announce from scratch.
        self.seen_versions.retain(|(origin, sender), _| *sender != peer && *origin != peer);
        for dest in &removed {
            self.seen_versions.retain(|(origin, _), _| origin != dest);
        }
        removed
    }

    fn remove_entry(&mut self, dest: EndpointId, now: Instant) {
        if let Some(entry) = self.entries.remove(&dest) {
            self.unindex(entry.next_hop, dest);
            self.blacklist.push(BlacklistEntry { dest, path: entry.path, first_seen: now });
        }
        self.filters.remove(&dest);
        self.filter_versions.remove(&dest);
    }

    fn unindex(&mut self, next_hop: EndpointId, dest: EndpointId) {
        if let Some(dests) = self.by_next_hop.get_mut(&next_hop) {
            dests.remove(&dest);
            if dests.is_empty() {
                self.by_next_hop.remove(&next_hop);
            }
        }
    }

    fn blacklisted(&self, dest: EndpointId, path: &[EndpointId]) -> bool {
        self.blacklist.iter().any(|e| e.dest == dest && e.path == path)
    }

    /// Drop blacklist entries older than the configured maximum age.
    /// Returns how many entries aged out.
    pub fn sweep_blacklist(&mut self, now: Instant) -> usize {
        let before = self.blacklist.len();
        let max_age = self.blacklist_max_age;
        self.blacklist.retain(|e| now.duration_since(e.first_seen) < max_age);
        before - self.blacklist.len()
    }

    /// Structural validation shared by adverts and withdrawals: the flood
    /// must have arrived from the last relay on its path, or straight from
    /// its origin.
    fn check_flood(
        &self,
        sender: EndpointId,
        origin: EndpointId,
        path: &[EndpointId],
    ) -> Result<()> {
        let consistent = match path.last() {
            None => sender == origin,
            Some(last) => *last == sender,
        };
        if consistent {
            Ok(())
        } else {
            Err(Error::protocol(format!(
                "flood from {sender} claims origin {origin} but names a different last relay"
            )))
        }
    }

    /// The next hop toward `dest`, if a route exists.
    pub fn next_hop(&self, dest: EndpointId) -> Option<EndpointId> {
        self.entries.get(&dest).map(|e| e.next_hop)
    }

    /// The full entry for `dest`.
    pub fn lookup(&self, dest: EndpointId) -> Option<&RouteEntry> {
        self.entries.get(&dest)
    }

    /// Whether a route to `dest` exists.
    pub fn reachable(&self, dest: EndpointId) -> bool {
        self.entries.contains_key(&dest)
    }

    /// All destinations whose advertised filter matches `topic`.
    pub fn destinations_matching<'a>(
        &'a self,
        topic: &'a Topic,
    ) -> impl Iterator<Item = EndpointId> + 'a {
        self.filters.iter().filter_map(move |(dest, prefixes)| {
            (self.entries.contains_key(dest) && prefix_match(prefixes, topic)).then_some(*dest)
        })
    }

    /// The advertised filter of `dest`, if known.
    pub fn filter_of(&self, dest: EndpointId) -> Option<&[Topic]> {
        self.filters.get(&dest).map(Vec::as_slice)
    }

    /// Adverts reproducing the full table, for synchronizing a new peer.
    pub fn snapshot_adverts(&self) -> Vec<SubscriptionAdvert> {
        self.entries
            .iter()
            .map(|(dest, entry)| {
                let mut path = entry.path.clone();
                path.push(self.local);
                SubscriptionAdvert {
                    origin: *dest,
                    filter: self.filters.get(dest).cloned().unwrap_or_default(),
                    version: self.filter_versions.get(dest).copied().unwrap_or(entry.version),
                    path,
                }
            })
            .collect()
    }

    /// Number of reachable destinations.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topic(s: &str) -> Topic {
        Topic::parse(s).unwrap()
    }

    fn advert(
        origin: EndpointId,
        filter: &[&str],
        version: u64,
        path: &[EndpointId],
    ) -> SubscriptionAdvert {
        SubscriptionAdvert {
            origin,
            filter: filter.iter().map(|s| topic(s)).collect(),
            version,
            path: path.to_vec(),
        }
    }

    fn table() -> (RoutingTable, EndpointId) {
        let local = EndpointId::generate();
        (RoutingTable::new(local, Duration::from_secs(300)), local)
    }

    #[test]
    fn direct_advert_installs_distance_one() {
        let (mut tbl, local) = table();
        let peer = EndpointId::generate();
        tbl.peer_connected(peer);

        let outcome = tbl.handle_advert(peer, &advert(peer, &["a"], 1, &[]), Instant::now());
        let AdvertOutcome::Installed { newly_discovered, rebroadcast } = outcome.unwrap() else {
            panic!("expected install");
        };
        assert!(newly_discovered);
        assert_eq!(rebroadcast.path, vec![local]);
        let entry = tbl.lookup(peer).unwrap();
        assert_eq!(entry.distance, 1);
        assert_eq!(entry.next_hop, peer);
        assert!(tbl.destinations_matching(&topic("a/b")).any(|d| d == peer));
    }

    #[test]
    fn stale_versions_are_ignored() {
        let (mut tbl, _) = table();
        let peer = EndpointId::generate();
        tbl.peer_connected(peer);
        let now = Instant::now();

        assert!(matches!(
            tbl.handle_advert(peer, &advert(peer, &["a"], 5, &[]), now).unwrap(),
            AdvertOutcome::Installed { .. }
        ));
        assert!(matches!(
            tbl.handle_advert(peer, &advert(peer, &["a"], 5, &[]), now).unwrap(),
            AdvertOutcome::Ignored
        ));
        assert!(matches!(
            tbl.handle_advert(peer, &advert(peer, &["a"], 4, &[]), now).unwrap(),
            AdvertOutcome::Ignored
        ));
    }

    #[test]
    fn loops_are_suppressed() {
        let (mut tbl, local) = table();
        let peer = EndpointId::generate();
        let origin = EndpointId::generate();
        tbl.peer_connected(peer);

        let looped = advert(origin, &["a"], 1, &[origin, local, peer]);
        assert!(matches!(
            tbl.handle_advert(peer, &looped, Instant::now()).unwrap(),
            AdvertOutcome::Ignored
        ));
        assert!(!tbl.reachable(origin));
    }

    #[test]
    fn shorter_path_wins_and_ties_break_on_id() {
        let (mut tbl, _) = table();
        let mut ids: Vec<EndpointId> = (0..3).map(|_| EndpointId::generate()).collect();
        ids.sort();
        let (low, high) = (ids[0], ids[1]);
        let origin = ids[2];
        tbl.peer_connected(low);
        tbl.peer_connected(high);
        let now = Instant::now();
        let relay = EndpointId::generate();

        // Two-hop route via the higher peer first.
        tbl.handle_advert(high, &advert(origin, &["a"], 1, &[relay, high]), now).unwrap();
        assert_eq!(tbl.lookup(origin).unwrap().distance, 3);

        // A shorter route replaces it.
        tbl.handle_advert(high, &advert(origin, &["a"], 2, &[high]), now).unwrap();
        assert_eq!(tbl.lookup(origin).unwrap().distance, 2);
        assert_eq!(tbl.next_hop(origin), Some(high));

        // Same distance through the lower-ordered peer wins the tie.
        tbl.handle_advert(low, &advert(origin, &["a"], 3, &[low]), now).unwrap();
        assert_eq!(tbl.next_hop(origin), Some(low));

        // Same distance through the higher-ordered peer does not.
        tbl.handle_advert(high, &advert(origin, &["a"], 4, &[high]), now).unwrap();
        assert_eq!(tbl.next_hop(origin), Some(low));
    }

    #[test]
    fn equal_distance_from_same_hop_refreshes() {
        let (mut tbl, _) = table();
        let peer = EndpointId::generate();
        tbl.peer_connected(peer);
        let now = Instant::now();
        tbl.handle_advert(peer, &advert(peer, &["a"], 1, &[]), now).unwrap();

        let later = now + Duration::from_secs(5);
        let outcome = tbl.handle_advert(peer, &advert(peer, &["a"], 2, &[]), later).unwrap();
        assert!(matches!(outcome, AdvertOutcome::Refreshed));
        let entry = tbl.lookup(peer).unwrap();
        assert_eq!(entry.distance, 1);
        assert_eq!(entry.last_refresh, later);
    }

    #[test]
    fn inconsistent_flood_is_a_violation() {
        let (mut tbl, _) = table();
        let peer = EndpointId::generate();
        let origin = EndpointId::generate();
        let impostor = EndpointId::generate();
        tbl.peer_connected(peer);

        let bad = advert(origin, &["a"], 1, &[impostor]);
        assert!(matches!(
            tbl.handle_advert(peer, &bad, Instant::now()),
            Err(Error::ProtocolViolation { .. })
        ));
    }

    #[test]
    fn withdrawal_removes_matching_entries_and_rebroadcasts() {
        let (mut tbl, local) = table();
        let peer = EndpointId::generate();
        let origin = EndpointId::generate();
        tbl.peer_connected(peer);
        let now = Instant::now();

        tbl.handle_advert(peer, &advert(peer, &["a"], 1, &[]), now).unwrap();
        tbl.handle_advert(peer, &advert(origin, &["b"], 1, &[peer]), now).unwrap();
        assert!(tbl.reachable(origin));

        let wd = PathWithdrawal {
            origin: peer,
            version: 2,
            destinations: vec![origin],
            path: vec![],
        };
        let outcome = tbl.handle_withdrawal(peer, &wd, now).unwrap();
        assert_eq!(outcome.removed, vec![origin]);
        let onward = outcome.rebroadcast.unwrap();
        assert_eq!(onward.destinations, vec![origin]);
        assert_eq!(onward.path, vec![local]);
        assert!(!tbl.reachable(origin));
        // The direct route to the withdrawing peer itself survives.
        assert!(tbl.reachable(peer));
    }

    #[test]
    fn blacklist_suppresses_reinstall_until_aged() {
        let (mut tbl, _) = table();
        let peer = EndpointId::generate();
        let origin = EndpointId::generate();
        tbl.peer_connected(peer);
        let now = Instant::now();

        tbl.handle_advert(peer, &advert(peer, &["a"], 1, &[]), now).unwrap();
        tbl.handle_advert(peer, &advert(origin, &["b"], 1, &[peer]), now).unwrap();
        let wd = PathWithdrawal {
            origin: peer,
            version: 2,
            destinations: vec![origin],
            path: vec![],
        };
        tbl.handle_withdrawal(peer, &wd, now).unwrap();

        // The same path re-advertised while blacklisted stays out.
        let again = advert(origin, &["b"], 3, &[peer]);
        assert!(matches!(
            tbl.handle_advert(peer, &again, now).unwrap(),
            AdvertOutcome::Ignored
        ));
        assert!(!tbl.reachable(origin));

        // After the aging sweep the path becomes installable again.
        let later = now + Duration::from_secs(301);
        assert_eq!(tbl.sweep_blacklist(later), 1);
        let fresh = advert(origin, &["b"], 4, &[peer]);
        assert!(matches!(
            tbl.handle_advert(peer, &fresh, later).unwrap(),
            AdvertOutcome::Installed { .. }
        ));
    }

    #[test]
    fn disconnect_drops_everything_via_the_peer() {
        let (mut tbl, _) = table();
        let peer = EndpointId::generate();
        let far = EndpointId::generate();
        let other = EndpointId::generate();
        tbl.peer_connected(peer);
        tbl.peer_connected(other);
        let now = Instant::now();

        tbl.handle_advert(peer, &advert(peer, &["a"], 1, &[]), now).unwrap();
        tbl.handle_advert(peer, &advert(far, &["b"], 1, &[peer]), now).unwrap();
        tbl.handle_advert(other, &advert(other, &["c"], 1, &[]), now).unwrap();

        let mut removed = tbl.peer_disconnected(peer, now);
        removed.sort();
        let mut expected = vec![peer, far];
        expected.sort();
        assert_eq!(removed, expected);
        assert!(!tbl.reachable(peer));
        assert!(!tbl.reachable(far));
        assert!(tbl.reachable(other));
        // No entry may keep the departed peer as its next hop.
        assert!(tbl.snapshot_adverts().iter().all(|a| a.origin == other));
    }

    #[test]
    fn snapshot_extends_paths_with_local_id() {
        let (mut tbl, local) = table();
        let peer = EndpointId::generate();
        tbl.peer_connected(peer);
        tbl.handle_advert(peer, &advert(peer, &["a"], 7, &[]), Instant::now()).unwrap();

        let snapshot = tbl.snapshot_adverts();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].origin, peer);
        assert_eq!(snapshot[0].version, 7);
        assert_eq!(snapshot[0].path, vec![local]);
    }
}
