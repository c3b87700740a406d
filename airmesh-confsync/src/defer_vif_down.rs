//! Grace-period mutator keeping a VIF up while stations remain.
//!
//! A rule watches one VIF. When the desired config would take it down (or
//! its phy down, or move it through a service-interrupting CSA), the rule
//! overrides the desired tree for a bounded grace period: the VIF and phy
//! stay enabled and every AP on the phy is pinned to the last observed
//! channel. Clearing the cause or losing the last station cancels the
//! override immediately.

use std::collections::BTreeMap;

use airmesh_work::{Millis, Timer};
use tracing::{debug, info, warn};

use crate::conf::{ConfMutator, ConfPhy, ConfTree, ConfVif, ConfVifKind};
use crate::state::{PhyState, VifState};
use crate::types::{channel_intersects_state, Channel, DfsState, VifType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferEvent {
    GraceStarted,
    GraceStopped,
}

type NotifyFn = Box<dyn FnMut(DeferEvent)>;

struct Observer {
    token: u64,
    vif_name: String,
    notify: NotifyFn,
}

struct Rule {
    vif_name: String,
    grace_ms: Millis,
    num_stations: usize,
    was_enabled: bool,
    timer: Timer,
    reason_phy: bool,
    reason_vif: bool,
    reason_csa: bool,
    phy_name: Option<String>,
    phy_state: Option<PhyState>,
    vif_state: Option<VifState>,
}

impl Rule {
    fn grace_active(&self, now: Millis) -> bool {
        self.timer.is_armed() && !self.timer.is_expired(now)
    }
}

pub struct DeferVifDown {
    rules: BTreeMap<String, Rule>,
    observers: Vec<Observer>,
    next_token: u64,
    /// Set when a mutation-relevant input changed; the embedding loop
    /// turns this into a conf-changed signal.
    invalidated: bool,
}

impl Default for DeferVifDown {
    fn default() -> Self {
        Self::new()
    }
}

impl DeferVifDown {
    pub fn new() -> Self {
        Self {
            rules: BTreeMap::new(),
            observers: Vec::new(),
            next_token: 0,
            invalidated: false,
        }
    }

    pub fn add_rule(&mut self, vif_name: &str, grace_period_secs: u64) -> bool {
        if self.rules.contains_key(vif_name) {
            warn!(vif = %vif_name, "defer_vif_down: rule already exists");
            return false;
        }
        info!(vif = %vif_name, grace_period_secs, "defer_vif_down: rule created");
        self.rules.insert(
            vif_name.to_string(),
            Rule {
                vif_name: vif_name.to_string(),
                grace_ms: grace_period_secs * 1000,
                num_stations: 0,
                was_enabled: false,
                timer: Timer::disarmed(),
                reason_phy: false,
                reason_vif: false,
                reason_csa: false,
                phy_name: None,
                phy_state: None,
                vif_state: None,
            },
        );
        true
    }

    pub fn remove_rule(&mut self, vif_name: &str, now: Millis) {
        if let Some(rule) = self.rules.remove(vif_name) {
            info!(vif = %vif_name, "defer_vif_down: rule freed");
            if rule.grace_active(now) {
                self.notify(vif_name, DeferEvent::GraceStopped);
            }
        }
    }

    pub fn register_observer(
        &mut self,
        vif_name: &str,
        mut notify: NotifyFn,
        now: Millis,
    ) -> u64 {
        self.next_token += 1;
        if let Some(rule) = self.rules.get(vif_name) {
            if rule.grace_active(now) {
                notify(DeferEvent::GraceStarted);
            }
        }
        self.observers.push(Observer {
            token: self.next_token,
            vif_name: vif_name.to_string(),
            notify,
        });
        self.next_token
    }

    pub fn unregister_observer(&mut self, token: u64, now: Millis) {
        if let Some(pos) = self.observers.iter().position(|o| o.token == token) {
            let mut obs = self.observers.remove(pos);
            let active = self
                .rules
                .get(&obs.vif_name)
                .map(|r| r.grace_active(now))
                .unwrap_or(false);
            if active {
                (obs.notify)(DeferEvent::GraceStopped);
            }
        }
    }

    fn notify(&mut self, vif_name: &str, ev: DeferEvent) {
        debug!(vif = %vif_name, event = ?ev, "defer_vif_down: notifying");
        for obs in self.observers.iter_mut() {
            if obs.vif_name == vif_name {
                (obs.notify)(ev);
            }
        }
    }

    pub fn remaining_ms(&self, vif_name: &str, now: Millis) -> Millis {
        self.rules
            .get(vif_name)
            .and_then(|r| {
                if r.grace_active(now) {
                    r.timer.remaining(now)
                } else {
                    None
                }
            })
            .unwrap_or(0)
    }

    pub fn grace_active(&self, vif_name: &str, now: Millis) -> bool {
        self.rules
            .get(vif_name)
            .map(|r| r.grace_active(now))
            .unwrap_or(false)
    }

    /// Did any input change since the last check? Reading clears the flag.
    pub fn take_invalidated(&mut self) -> bool {
        std::mem::take(&mut self.invalidated)
    }

    pub fn next_wakeup(&self) -> Option<Millis> {
        self.rules.values().filter_map(|r| r.timer.fires_at()).min()
    }

    // State observer inputs.

    pub fn on_vif_added(&mut self, vif_name: &str, phy_name: &str, phy: &PhyState, vif: &VifState) {
        if let Some(rule) = self.rules.get_mut(vif_name) {
            debug!(vif = %vif_name, phy = %phy_name, "defer_vif_down: latched to phy");
            rule.phy_name = Some(phy_name.to_string());
            rule.phy_state = Some(phy.clone());
            rule.vif_state = Some(vif.clone());
            self.invalidated = true;
        }
    }

    pub fn on_vif_changed(&mut self, vif_name: &str, vif: &VifState) {
        if let Some(rule) = self.rules.get_mut(vif_name) {
            rule.vif_state = Some(vif.clone());
            self.invalidated = true;
        }
    }

    pub fn on_vif_removed(&mut self, vif_name: &str) {
        if let Some(rule) = self.rules.get_mut(vif_name) {
            debug!(vif = %vif_name, "defer_vif_down: unlatched from phy");
            rule.vif_state = None;
            rule.phy_state = None;
            rule.phy_name = None;
            self.invalidated = true;
        }
    }

    pub fn on_phy_changed(&mut self, phy_name: &str, phy: &PhyState) {
        let mut touched = false;
        for rule in self.rules.values_mut() {
            if rule.phy_name.as_deref() == Some(phy_name) && rule.phy_state.is_some() {
                rule.phy_state = Some(phy.clone());
                touched = true;
            }
        }
        if touched {
            self.invalidated = true;
        }
    }

    pub fn on_phy_removed(&mut self, phy_name: &str) {
        let mut touched = false;
        for rule in self.rules.values_mut() {
            if rule.phy_name.as_deref() == Some(phy_name) {
                rule.phy_state = None;
                touched = true;
            }
        }
        if touched {
            self.invalidated = true;
        }
    }

    pub fn on_sta_connected(&mut self, vif_name: &str) {
        self.sta_count_update(vif_name, 1);
    }

    pub fn on_sta_disconnected(&mut self, vif_name: &str) {
        self.sta_count_update(vif_name, -1);
    }

    fn sta_count_update(&mut self, vif_name: &str, delta: isize) {
        if let Some(rule) = self.rules.get_mut(vif_name) {
            info!(vif = %vif_name, delta, "defer_vif_down: station count update");
            if delta < 0 && rule.num_stations < delta.unsigned_abs() {
                warn!(vif = %vif_name, "defer_vif_down: station count underflow");
                rule.num_stations = 0;
            } else {
                rule.num_stations = (rule.num_stations as isize + delta) as usize;
            }
            self.invalidated = true;
        }
    }

    /// Fire expired grace timers. The caller feeds `take_invalidated()`
    /// into a conf-changed signal so the override clears on the next
    /// reconcile.
    pub fn poll(&mut self, now: Millis) {
        let mut expired = Vec::new();
        for rule in self.rules.values_mut() {
            if rule.timer.take_expired(now) {
                expired.push(rule.vif_name.clone());
            }
        }
        for vif_name in expired {
            info!(vif = %vif_name, "defer_vif_down: grace period expired");
            self.invalidated = true;
            self.notify(&vif_name, DeferEvent::GraceStopped);
        }
    }

    fn csa_will_interrupt_service(vif: &ConfVif, rule: &Rule) -> bool {
        let phy_info = match &rule.phy_state {
            Some(p) => p,
            None => return false,
        };
        let vif_info = match &rule.vif_state {
            Some(v) => v,
            None => return false,
        };
        if vif_info.vif_type != VifType::Ap {
            return false;
        }
        let cap = match vif.ap() {
            Some(a) => a,
            None => return false,
        };
        if !vif.enabled {
            return false;
        }
        let c = &cap.channel;
        if c.control_freq_mhz == 0 {
            warn!(vif = %vif.vif_name, "defer_vif_down: configured channel is invalid");
            return false;
        }
        // Any 20MHz segment in an offending DFS state makes the CSA
        // destructive: it implies down time.
        let cs = &phy_info.channel_states;
        channel_intersects_state(cs, c, DfsState::CacPossible)
            || channel_intersects_state(cs, c, DfsState::CacInProgress)
            || channel_intersects_state(cs, c, DfsState::Nol)
    }

    fn observed_ap_channel(rule: &Rule) -> Option<Channel> {
        let vif_info = rule.vif_state.as_ref()?;
        match vif_info.vif_type {
            VifType::Ap => vif_info.ap().map(|ap| ap.channel),
            _ => None,
        }
    }

    fn mutate_phy_channel(phy: &mut ConfPhy, rule: &Rule) {
        let c = match Self::observed_ap_channel(rule) {
            Some(c) => c,
            None => return,
        };
        for vif in phy.vifs.values_mut() {
            if let ConfVifKind::Ap(ap) = &mut vif.kind {
                ap.channel = c;
            }
        }
    }

    fn rule_mutate(
        phy: &mut ConfPhy,
        vif_name: &str,
        rule: &mut Rule,
        now: Millis,
        events: &mut Vec<(String, DeferEvent)>,
    ) {
        let vif_exists = phy.vifs.contains_key(vif_name);
        if !vif_exists {
            if rule.grace_active(now) {
                info!(vif = %vif_name, "defer_vif_down: phy/vif disappeared");
                rule.timer.disarm();
                events.push((vif_name.to_string(), DeferEvent::GraceStopped));
            }
            return;
        }

        let csa_interrupt = {
            let vif = &phy.vifs[vif_name];
            Self::csa_will_interrupt_service(vif, rule)
        };
        let vif_enabled = phy.vifs[vif_name].enabled;
        let enabled = vif_enabled && phy.enabled && !csa_interrupt;
        let shutting_down = rule.was_enabled && !enabled;

        if shutting_down && !rule.grace_active(now) {
            rule.reason_phy = !phy.enabled;
            rule.reason_vif = !vif_enabled;
            rule.reason_csa = csa_interrupt;
            rule.timer.arm_at(now + rule.grace_ms);
            events.push((vif_name.to_string(), DeferEvent::GraceStarted));
        }

        rule.was_enabled = enabled;

        if rule.grace_active(now) {
            let cancelled = enabled;
            let unnecessary = rule.num_stations == 0;
            if cancelled || unnecessary {
                info!(
                    vif = %vif_name,
                    cancelled,
                    unnecessary,
                    "defer_vif_down: cancelling grace period"
                );
                rule.timer.disarm();
                events.push((vif_name.to_string(), DeferEvent::GraceStopped));
            } else {
                let first_mutation = rule.reason_phy || rule.reason_vif || rule.reason_csa;
                if first_mutation {
                    info!(
                        vif = %vif_name,
                        phy = rule.reason_phy,
                        vif_down = rule.reason_vif,
                        csa = rule.reason_csa,
                        "defer_vif_down: mutation started"
                    );
                    rule.reason_phy = false;
                    rule.reason_vif = false;
                    rule.reason_csa = false;
                }

                // If the vif is going down because the phy is, the phy has
                // to be held up too.
                phy.enabled = true;
                if let Some(vif) = phy.vifs.get_mut(vif_name) {
                    vif.enabled = true;
                }
                Self::mutate_phy_channel(phy, rule);
                debug!(vif = %vif_name, "defer_vif_down: deferring shutdown");
            }
        }
    }
}

impl ConfMutator for DeferVifDown {
    fn mutate(&mut self, tree: &mut ConfTree, now: Millis) {
        let mut events = Vec::new();
        for rule in self.rules.values_mut() {
            for phy in tree.phys.values_mut() {
                if phy.vifs.contains_key(&rule.vif_name) {
                    let vif_name = rule.vif_name.clone();
                    Self::rule_mutate(phy, &vif_name, rule, now, &mut events);
                }
            }
        }
        for (vif_name, ev) in events {
            self.notify(&vif_name, ev);
        }
    }
}
