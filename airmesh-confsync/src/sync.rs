//! The confsync state machine.
//!
//! Edge-triggered and debounced: configuration changes force a new
//! REQUESTING round, state changes promote WAITING to VERIFYING, and a
//! retry timer keeps poking the driver until the diff comes back clean.

use std::collections::BTreeMap;

use airmesh_work::{Millis, Timer};
use tracing::{debug, info, trace, warn};

use crate::conf::ConfTree;
use crate::diff::build_drv_conf;
use crate::drv::DrvConf;
use crate::state::{ObservedTree, PhyState};
use crate::types::{DfsState, VifStatus};

pub const RETRY_MS_DEFAULT: Millis = 30_000;
pub const DEADLINE_MS_DEFAULT: Millis = 10_000;
pub const PHY_TREE_TIMEOUT_MS_DEFAULT: Millis = 60_000;

/// Starting up interfaces is not instantaneous: hostapd country updates
/// take up to 5s and remote WLAN CPUs another second or so. Suppressing
/// re-requests for this long keeps a mutator blip from interrupting a slow
/// bring-up and live-locking the configuration.
pub const ENABLE_PERIOD_MS: Millis = 10_000;

/// Environment variable disabling the "NOP suppresses network_changed"
/// shortcut in the station diff.
pub const STRICT_NETWORK_CHANGES_ENV: &str = "AIRMESH_CONFSYNC_STRICT_NETWORK_CHANGES";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Requesting,
    Waiting,
    Verifying,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Idle => "idle",
            SyncState::Requesting => "requesting",
            SyncState::Waiting => "waiting",
            SyncState::Verifying => "verifying",
        }
    }
}

/// What the synchronizer needs from its surroundings each round.
pub trait ConfsyncEnv {
    /// Build the desired tree (mutators applied).
    fn build_conf(&mut self, now: Millis) -> ConfTree;
    /// Current driver-observed state.
    fn observed(&self) -> &ObservedTree;
    /// Submit a plan to the driver mux; true when accepted.
    fn request_config(&mut self, conf: &DrvConf) -> bool;
}

#[derive(Debug)]
struct Defer {
    expiry: Timer,
    deferred: bool,
}

#[derive(Debug)]
struct CacPhy {
    timeout: Timer,
}

/// Gating context handed to the diff engine.
pub(crate) struct Gates<'a> {
    defers: &'a mut BTreeMap<String, Defer>,
    cac: &'a BTreeMap<String, CacPhy>,
    pub(crate) strict_network_changes: bool,
    now: Millis,
}

impl Gates<'_> {
    /// Start (or consult) the per-vif enable deferral. True while the
    /// deferral is running, meaning the vif's changes must be suppressed
    /// this round.
    pub(crate) fn defer_vif_enable_start(&mut self, vif_name: &str) -> bool {
        let key = format!("vif:{vif_name}");
        if let Some(defer) = self.defers.get_mut(&key) {
            if !defer.deferred {
                info!(defer = %key, "confsync: deferring request, will try later");
                defer.deferred = true;
            }
            return defer.expiry.is_armed() && !defer.expiry.is_expired(self.now);
        }
        debug!(defer = %key, "confsync: defer started");
        self.defers.insert(
            key,
            Defer {
                expiry: {
                    let mut t = Timer::disarmed();
                    t.arm_at(self.now + ENABLE_PERIOD_MS);
                    t
                },
                deferred: false,
            },
        );
        // Freshly started: this round's enable goes through; only
        // follow-up invalidations within the window are held back.
        false
    }

    pub(crate) fn cac_timed_out(&self, phy_name: &str) -> bool {
        match self.cac.get(phy_name) {
            Some(phy) => !phy.timeout.is_armed(),
            None => false,
        }
    }
}

type ChangedFn = Box<dyn FnMut(SyncState)>;

pub struct ConfSync {
    state: SyncState,
    settled: bool,
    work_pending: bool,
    defers: BTreeMap<String, Defer>,
    cac: BTreeMap<String, CacPhy>,
    last_tree: Option<ConfTree>,
    last_tree_timer: Timer,
    retry: Timer,
    deadline: Timer,
    retry_ms: Millis,
    deadline_ms: Millis,
    tree_cache_ms: Millis,
    strict_network_changes: bool,
    changed_fns: Vec<(u64, ChangedFn)>,
    next_sub: u64,
}

impl Default for ConfSync {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfSync {
    pub fn new() -> Self {
        Self {
            state: SyncState::Idle,
            settled: false,
            work_pending: false,
            defers: BTreeMap::new(),
            cac: BTreeMap::new(),
            last_tree: None,
            last_tree_timer: Timer::disarmed(),
            retry: Timer::disarmed(),
            deadline: Timer::disarmed(),
            retry_ms: RETRY_MS_DEFAULT,
            deadline_ms: DEADLINE_MS_DEFAULT,
            tree_cache_ms: PHY_TREE_TIMEOUT_MS_DEFAULT,
            strict_network_changes: std::env::var(STRICT_NETWORK_CHANGES_ENV).is_ok(),
            changed_fns: Vec::new(),
            next_sub: 0,
        }
    }

    pub fn with_strict_network_changes(mut self, strict: bool) -> Self {
        self.strict_network_changes = strict;
        self
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn is_settled(&self) -> bool {
        self.settled
    }

    /// Register a state-change subscriber. Fires immediately with the
    /// current state, then on every transition.
    pub fn register_changed_fn(&mut self, mut f: ChangedFn) -> u64 {
        self.next_sub += 1;
        f(self.state);
        self.changed_fns.push((self.next_sub, f));
        self.next_sub
    }

    pub fn unregister_changed_fn(&mut self, token: u64) {
        self.changed_fns.retain(|(t, _)| *t != token);
    }

    fn notify_changed(&mut self) {
        let state = self.state;
        let mut fns = std::mem::take(&mut self.changed_fns);
        for (_, f) in fns.iter_mut() {
            f(state);
        }
        // New registrations during callbacks keep their slot.
        fns.append(&mut self.changed_fns);
        self.changed_fns = fns;
    }

    fn defer_is_pending(&self) -> bool {
        !self.defers.is_empty()
    }

    fn defer_flush(&mut self) {
        for (key, defer) in self.defers.iter() {
            if defer.deferred {
                info!(defer = %key, "confsync: flushing, dropping request");
            } else {
                debug!(defer = %key, "confsync: flushing");
            }
        }
        self.defers.clear();
    }

    fn defer_flush_expired(&mut self, now: Millis) {
        self.defers
            .retain(|_, d| d.expiry.is_armed() && !d.expiry.is_expired(now));
    }

    /// Stop deferring once the driver reports the vif as up.
    pub fn defer_vif_enable_stop(&mut self, vif_name: &str, status: VifStatus) {
        if status != VifStatus::Enabled {
            return;
        }
        let key = format!("vif:{vif_name}");
        if let Some(defer) = self.defers.remove(&key) {
            if defer.deferred {
                info!(defer = %key, "confsync: disarming, configuration finished");
            }
        }
    }

    pub fn set_state(&mut self, s: SyncState, now: Millis) {
        trace!(from = self.state.as_str(), to = s.as_str(), "confsync: state");
        if self.state == s {
            return;
        }
        self.state = s;
        match self.state {
            SyncState::Idle => {
                self.defer_flush();
                if !self.settled {
                    info!("confsync: settled");
                }
                self.settled = true;
                self.retry.disarm();
                self.deadline.disarm();
                self.work_pending = false;
                self.last_tree = None;
                self.last_tree_timer.disarm();
            }
            SyncState::Requesting => {
                self.defer_flush_expired(now);
                self.retry.disarm();
                self.deadline.arm_at(now + self.deadline_ms);
                self.work_pending = true;
            }
            SyncState::Waiting => {
                if self.settled {
                    info!("confsync: unsettled");
                }
                self.settled = false;
                self.work_pending = false;
                self.deadline.disarm();
                self.retry.arm_at(now + self.retry_ms);
            }
            SyncState::Verifying => {
                self.work_pending = true;
                self.deadline.arm_at(now + self.deadline_ms);
            }
        }
        self.notify_changed();
    }

    /// A mutator or external configuration source changed the desired
    /// tree: always forces a new request round.
    pub fn on_conf_changed(&mut self, now: Millis) {
        self.set_state(SyncState::Requesting, now);
    }

    /// Driver/state store reported new state. Never moves the machine
    /// backwards; transient states on the way to a final report must not
    /// re-issue configuration.
    pub fn on_state_changed(&mut self, now: Millis) {
        match self.state {
            SyncState::Idle => self.set_state(SyncState::Requesting, now),
            SyncState::Requesting => (),
            SyncState::Waiting => self.set_state(SyncState::Verifying, now),
            SyncState::Verifying => (),
        }
    }

    pub fn on_vif_added(&mut self, vif_name: &str, status: VifStatus, now: Millis) {
        self.defer_vif_enable_stop(vif_name, status);
        self.on_conf_changed(now);
    }

    pub fn on_vif_changed(&mut self, vif_name: &str, status: VifStatus, now: Millis) {
        self.defer_vif_enable_stop(vif_name, status);
        self.on_state_changed(now);
    }

    pub fn on_vif_removed(&mut self, vif_name: &str, now: Millis) {
        self.defer_vif_enable_stop(vif_name, VifStatus::Enabled);
        self.on_conf_changed(now);
    }

    /// Entities appearing or disappearing fundamentally reshape the
    /// desired tree; treat them as configuration changes.
    pub fn on_phy_added(&mut self, phy_name: &str, phy: &PhyState, now: Millis) {
        self.cac_update(phy_name, phy, now);
        self.on_conf_changed(now);
    }

    pub fn on_phy_changed(&mut self, phy_name: &str, phy: &PhyState, now: Millis) {
        self.cac_update(phy_name, phy, now);
        self.on_state_changed(now);
    }

    pub fn on_phy_removed(&mut self, phy_name: &str, phy: &PhyState, now: Millis) {
        self.cac_update(phy_name, phy, now);
        self.on_conf_changed(now);
    }

    fn cac_max_time_ms(phy: &PhyState) -> Millis {
        let mut max = 0u64;
        for cs in &phy.channel_states {
            if cs.dfs == DfsState::CacInProgress {
                let freq = cs.channel.control_freq_mhz;
                let is_weather = (5580..=5660).contains(&freq);
                let secs = if is_weather { 600 } else { 60 };
                max = max.max(secs * 1000);
            }
        }
        max
    }

    fn cac_update(&mut self, phy_name: &str, phy: &PhyState, now: Millis) {
        let ongoing = phy
            .channel_states
            .iter()
            .any(|cs| cs.dfs == DfsState::CacInProgress);
        // Give buggy drivers twice the nominal CAC time before forcing
        // progress.
        let timeout_at = now + 2 * Self::cac_max_time_ms(phy);

        if !ongoing {
            if let Some(entry) = self.cac.remove(phy_name) {
                if entry.timeout.is_armed() && !entry.timeout.is_expired(now) {
                    info!(phy = %phy_name, "confsync: cac: completed");
                } else {
                    warn!(phy = %phy_name, "confsync: cac: completed after timeout");
                }
            }
        } else if !self.cac.contains_key(phy_name) {
            let mut timeout = Timer::disarmed();
            timeout.arm_at(timeout_at);
            self.cac.insert(phy_name.to_string(), CacPhy { timeout });
            info!(phy = %phy_name, until = timeout_at, "confsync: cac: started");
        } else if let Some(entry) = self.cac.get_mut(phy_name) {
            if !entry.timeout.is_armed() {
                entry.timeout.arm_at(timeout_at);
                warn!(phy = %phy_name, "confsync: cac: restarted before previous one finished");
            }
        }
    }

    /// Build the reconfiguration plan for the current round.
    pub fn build_plan(
        &mut self,
        tree: &ConfTree,
        observed: &ObservedTree,
        now: Millis,
    ) -> DrvConf {
        let mut gates = Gates {
            defers: &mut self.defers,
            cac: &self.cac,
            strict_network_changes: self.strict_network_changes,
            now,
        };
        build_drv_conf(tree, observed, &mut gates)
    }

    fn conf_is_synced(&mut self, env: &mut dyn ConfsyncEnv, now: Millis) -> bool {
        if self.defer_is_pending() {
            return false;
        }
        let tree = env.build_conf(now);
        let observed = env.observed().clone();
        let plan = self.build_plan(&tree, &observed, now);
        !plan.any_changed()
    }

    fn work(&mut self, env: &mut dyn ConfsyncEnv, now: Millis) {
        debug!("confsync: work");
        match self.state {
            SyncState::Idle | SyncState::Waiting => (),
            SyncState::Requesting => {
                let tree = env.build_conf(now);
                if self.last_tree.as_ref() == Some(&tree) {
                    info!("confsync: request identical to previous one, verifying");
                    self.set_state(SyncState::Verifying, now);
                    return;
                }
                self.last_tree = Some(tree.clone());
                self.last_tree_timer.arm_at(now + self.tree_cache_ms);

                let observed = env.observed().clone();
                let plan = self.build_plan(&tree, &observed, now);
                let requested = env.request_config(&plan);
                let next = if requested || self.defer_is_pending() {
                    SyncState::Waiting
                } else {
                    SyncState::Idle
                };
                self.set_state(next, now);
            }
            SyncState::Verifying => {
                let done = self.conf_is_synced(env, now);
                let next = if done {
                    SyncState::Idle
                } else {
                    SyncState::Waiting
                };
                self.set_state(next, now);
            }
        }
    }

    /// One loop pass. `idle` marks the end of an event batch; the deadline
    /// timer forces the work through a loop that never goes idle.
    pub fn poll(&mut self, now: Millis, idle: bool, env: &mut dyn ConfsyncEnv) {
        if self.retry.take_expired(now) {
            debug!("confsync: retry elapsed");
            self.set_state(SyncState::Requesting, now);
        }

        if self.last_tree_timer.take_expired(now) {
            trace!("confsync: cached request expired");
            self.last_tree = None;
        }

        let mut expired_defers = Vec::new();
        for (key, defer) in self.defers.iter_mut() {
            if defer.expiry.take_expired(now) {
                expired_defers.push(key.clone());
            }
        }
        for key in expired_defers {
            let deferred = self.defers.get(&key).map(|d| d.deferred).unwrap_or(false);
            info!(defer = %key, "confsync: defer expired");
            if deferred {
                debug!(defer = %key, "confsync: requesting, was deferred before");
                self.set_state(SyncState::Requesting, now);
            }
        }

        let mut timed_out = Vec::new();
        for (phy, cac) in self.cac.iter_mut() {
            if cac.timeout.take_expired(now) {
                timed_out.push(phy.clone());
            }
        }
        for phy in timed_out {
            warn!(phy = %phy, "confsync: cac: timed out");
            self.on_state_changed(now);
        }

        // Work may chain (REQUESTING can fall straight into VERIFYING);
        // keep draining it the way repeated idle callbacks would.
        let mut rounds = 0;
        while self.work_pending {
            let deadline_hit = self.deadline.is_expired(now);
            if !(idle || deadline_hit) {
                break;
            }
            if deadline_hit && !idle {
                warn!("confsync: work deadline reached, ignoring non-idle mainloop");
            }
            self.work_pending = false;
            self.deadline.disarm();
            self.work(env, now);
            rounds += 1;
            if rounds > 4 {
                warn!("confsync: work did not settle within one pass");
                break;
            }
        }
    }

    pub fn next_wakeup(&self) -> Option<Millis> {
        let timers = [
            self.retry.fires_at(),
            self.last_tree_timer.fires_at(),
            if self.work_pending {
                self.deadline.fires_at()
            } else {
                None
            },
        ];
        let defers = self.defers.values().map(|d| d.expiry.fires_at());
        let cacs = self.cac.values().map(|c| c.timeout.fires_at());
        timers
            .into_iter()
            .chain(defers)
            .chain(cacs)
            .flatten()
            .min()
    }
}
