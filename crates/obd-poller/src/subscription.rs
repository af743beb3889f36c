//! Per-ECU subscription sets and the active-ECU selection

use obd_protocol::EcuAddress;
use std::collections::{BTreeMap, BTreeSet};

/// PIDs enabled for polling, per ECU, plus the ECU currently serviced.
///
/// Owned by the poller; the controller only ever changes it through
/// queued commands.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Subscriptions {
    sets: BTreeMap<EcuAddress, BTreeSet<u8>>,
    active: Option<EcuAddress>,
}

impl Subscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable a PID; returns whether the set changed
    pub fn enable(&mut self, ecu: EcuAddress, pid: u8) -> bool {
        self.sets.entry(ecu).or_default().insert(pid)
    }

    /// Disable a PID; returns whether the set changed
    pub fn disable(&mut self, ecu: EcuAddress, pid: u8) -> bool {
        match self.sets.get_mut(&ecu) {
            Some(set) => set.remove(&pid),
            None => false,
        }
    }

    /// Empty one ECU's set, leaving every other ECU alone
    pub fn disable_all(&mut self, ecu: EcuAddress) {
        if let Some(set) = self.sets.get_mut(&ecu) {
            set.clear();
        }
    }

    /// Choose the ECU to poll, or none
    pub fn select(&mut self, ecu: Option<EcuAddress>) {
        self.active = ecu;
    }

    pub fn active(&self) -> Option<EcuAddress> {
        self.active
    }

    pub fn is_enabled(&self, ecu: EcuAddress, pid: u8) -> bool {
        self.sets.get(&ecu).is_some_and(|set| set.contains(&pid))
    }

    /// Enabled PIDs of one ECU in ascending order
    pub fn pids(&self, ecu: EcuAddress) -> Vec<u8> {
        self.sets
            .get(&ecu)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// What one poll cycle should read: the active ECU and its PIDs.
    ///
    /// `None` when no ECU is selected or its set is empty.
    pub fn snapshot(&self) -> Option<(EcuAddress, Vec<u8>)> {
        let ecu = self.active?;
        let pids = self.pids(ecu);
        if pids.is_empty() {
            None
        } else {
            Some((ecu, pids))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const ENGINE: EcuAddress = EcuAddress(0x7E8);
    const TRANSMISSION: EcuAddress = EcuAddress(0x7E9);

    #[test]
    fn test_enable_disable_idempotent() {
        let mut subs = Subscriptions::new();
        assert!(subs.enable(ENGINE, 0x0C));
        let before = subs.clone();
        assert!(!subs.enable(ENGINE, 0x0C));
        assert_eq!(subs, before);

        assert!(!subs.disable(ENGINE, 0x0D));
        assert!(!subs.disable(TRANSMISSION, 0x0C));
        assert_eq!(subs, before);

        assert!(subs.disable(ENGINE, 0x0C));
        assert!(!subs.is_enabled(ENGINE, 0x0C));
    }

    #[test]
    fn test_disable_all_only_touches_one_ecu() {
        let mut subs = Subscriptions::new();
        subs.enable(ENGINE, 0x0C);
        subs.enable(ENGINE, 0x0D);
        subs.enable(TRANSMISSION, 0x0D);

        subs.disable_all(ENGINE);
        assert!(subs.pids(ENGINE).is_empty());
        assert_eq!(subs.pids(TRANSMISSION), vec![0x0D]);
    }

    #[test]
    fn test_snapshot_follows_selection() {
        let mut subs = Subscriptions::new();
        subs.enable(ENGINE, 0x0D);
        subs.enable(ENGINE, 0x05);
        assert_eq!(subs.snapshot(), None);

        subs.select(Some(ENGINE));
        assert_eq!(subs.snapshot(), Some((ENGINE, vec![0x05, 0x0D])));

        subs.select(Some(TRANSMISSION));
        assert_eq!(subs.snapshot(), None);

        subs.select(None);
        assert_eq!(subs.active(), None);
        assert_eq!(subs.snapshot(), None);
    }

    proptest! {
        #[test]
        fn prop_repeated_commands_are_idempotent(
            pids in prop::collection::vec(any::<u8>(), 0..20),
            pid in any::<u8>(),
        ) {
            let mut subs = Subscriptions::new();
            for p in &pids {
                subs.enable(ENGINE, *p);
            }

            subs.enable(ENGINE, pid);
            let enabled = subs.clone();
            subs.enable(ENGINE, pid);
            prop_assert_eq!(&subs, &enabled);

            subs.disable(ENGINE, pid);
            let disabled = subs.clone();
            subs.disable(ENGINE, pid);
            prop_assert_eq!(&subs, &disabled);
            prop_assert!(!subs.is_enabled(ENGINE, pid));
        }
    }
}
