//! Desired-vs-observed diff producing the minimum-sufficient driver plan.

use std::collections::BTreeMap;

use tracing::{debug, info};

use crate::conf::{ApConf, ConfPhy, ConfTree, ConfVif, ConfVifKind, StaConf};
use crate::drv::{
    ApConfig, DrvConf, PhyConfig, StaConfig, StaOperation, VifConfig, VifConfigKind,
};
use crate::state::{ApState, ObservedTree, PhyState, StaLink, StaState, VifState};
use crate::sync::Gates;
use crate::types::{
    channel_intersects_state, AclPolicy, ApMode, BeaconRate, Channel, DfsState, HwAddr, Neigh,
    Psk, Ssid, StaLinkStatus, StaNetwork, VifStatus, Wpa, RATE_UNSPEC,
};

fn ssid_changed(a: &Ssid, b: &Ssid) -> bool {
    a.len() != b.len() || a.0 != b.0
}

fn channel_changed(a: &Channel, b: &Channel) -> bool {
    a != b
}

fn wpa_changed(state: &Wpa, conf: &Wpa) -> bool {
    !state.eq_ignoring_rekey(conf)
}

/// SAE cannot multiplex PSKs by key_id, so a single-passphrase SAE setup
/// compares passphrases only.
fn psk_list_changed(conf: &BTreeMap<i32, String>, state: &[Psk], wpa: &Wpa) -> bool {
    if conf.len() != state.len() {
        return true;
    }
    if wpa.akm_sae && conf.len() == 1 {
        let p = &state[0];
        if let Some(q) = conf.values().next() {
            if p.psk == *q {
                return false;
            }
        }
    }
    for p in state {
        match conf.get(&p.key_id) {
            None => return true,
            Some(q) if *q != p.psk => return true,
            Some(_) => (),
        }
    }
    false
}

fn acl_changed(conf: &std::collections::BTreeSet<HwAddr>, state: &[HwAddr]) -> bool {
    if conf.len() != state.len() {
        return true;
    }
    state.iter().any(|mac| !conf.contains(mac))
}

/// An empty deny-list is the same as no policy at all.
fn acl_policy_changed(conf: &AclPolicy, state: &AclPolicy, state_acl: &[HwAddr]) -> bool {
    if conf == state {
        return false;
    }
    let none_vs_empty_deny = matches!(
        (conf, state),
        (AclPolicy::None, AclPolicy::DenyList) | (AclPolicy::DenyList, AclPolicy::None)
    );
    !(none_vs_empty_deny && state_acl.is_empty())
}

fn radius_list_changed(conf: &[crate::types::Radius], state: &[crate::types::Radius]) -> bool {
    conf.len() != state.len() || conf.iter().zip(state.iter()).any(|(a, b)| a != b)
}

fn neigh_list_changed(conf: &BTreeMap<HwAddr, Neigh>, state: &[Neigh]) -> bool {
    if conf.len() != state.len() {
        return true;
    }
    for p in state {
        match conf.get(&p.bssid) {
            None => return true,
            Some(q) => {
                if p.bssid_info != q.bssid_info
                    || p.op_class != q.op_class
                    || p.channel != q.channel
                    || p.phy_type != q.phy_type
                {
                    return true;
                }
            }
        }
    }
    false
}

fn wps_cred_list_changed(conf: &[crate::types::WpsCred], state: &[crate::types::WpsCred]) -> bool {
    if conf.len() != state.len() {
        return true;
    }
    state
        .iter()
        .any(|p| !conf.iter().any(|q| q.psk == p.psk))
}

/// Rate fields the driver reports as absent cannot be set; clear them on
/// both sides before comparing so the system can settle.
fn ap_mode_changed(state: &ApMode, conf: &ApMode) -> bool {
    let mut s = *state;
    let mut c = *conf;

    if c.supported_rates == 0 {
        s.supported_rates = 0;
    }
    if c.basic_rates == 0 {
        s.basic_rates = 0;
    }
    if c.beacon_rate == BeaconRate::Unspec {
        s.beacon_rate = BeaconRate::Unspec;
    }
    if c.mcast_rate == RATE_UNSPEC {
        s.mcast_rate = RATE_UNSPEC;
    }
    if c.mgmt_rate == RATE_UNSPEC {
        s.mgmt_rate = RATE_UNSPEC;
    }

    if s.supported_rates == 0
        && s.basic_rates == 0
        && s.beacon_rate == BeaconRate::Unspec
        && s.mcast_rate == RATE_UNSPEC
        && s.mgmt_rate == RATE_UNSPEC
    {
        c.supported_rates = 0;
        c.basic_rates = 0;
        c.beacon_rate = BeaconRate::Unspec;
        c.mcast_rate = RATE_UNSPEC;
        c.mgmt_rate = RATE_UNSPEC;
    }

    s != c
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NeighAction {
    Add,
    Del,
    Mod,
    Nop,
}

fn neigh_append(out: &mut Vec<Neigh>, n: &Neigh) {
    if let Some(slot) = out.iter_mut().find(|e| e.bssid == n.bssid) {
        *slot = *n;
    } else {
        out.push(*n);
    }
}

/// Classify neighbor entries into add/mod/del against the state list.
fn neigh_filter(conf: &BTreeMap<HwAddr, Neigh>, state: &[Neigh], want: NeighAction) -> Vec<Neigh> {
    let mut out = Vec::new();

    for sn in state {
        let cn = conf.get(&sn.bssid);
        let (action, n) = match cn {
            None => (NeighAction::Del, sn),
            Some(cn) if cn != sn => (NeighAction::Mod, cn),
            Some(_) => (NeighAction::Nop, sn),
        };
        if action == want {
            neigh_append(&mut out, n);
        }
    }

    for cn in conf.values() {
        let sn = state.iter().find(|s| s.bssid == cn.bssid);
        let action = match sn {
            None => NeighAction::Add,
            Some(sn) if sn != cn => NeighAction::Mod,
            Some(_) => NeighAction::Nop,
        };
        if action == want {
            neigh_append(&mut out, cn);
        }
    }

    out
}

fn vif_enabled_changed(status: VifStatus, enabled: bool) -> bool {
    match status {
        VifStatus::Unknown => false,
        VifStatus::Enabled => !enabled,
        VifStatus::Disabled => enabled,
        VifStatus::Broken => true,
    }
}

fn build_ap_config(
    cvif: &ConfVif,
    cap: &ApConf,
    sphy: &PhyState,
    svif: &VifState,
    allow_changed: bool,
    vif_type_changed: bool,
    dvif_enabled: bool,
    svif_status: VifStatus,
) -> (ApConfig, bool) {
    let default_state = ApState::default();
    let sap = svif.ap().unwrap_or(&default_state);

    let mut ap = ApConfig {
        bridge_if_name: cap.bridge_if_name.clone(),
        nas_identifier: cap.nas_identifier.clone(),
        ssid: cap.ssid.clone(),
        channel: cap.channel,
        beacon_interval_tu: cap.beacon_interval_tu,
        isolated: cap.isolated,
        ssid_hidden: cap.ssid_hidden,
        mcast2ucast: cap.mcast2ucast,
        mode: cap.mode,
        wpa: cap.wpa,
        wps_pbc: cap.wps_pbc,
        multi_ap: cap.multi_ap,
        mbss_mode: cap.mbss_mode,
        mbss_group: cap.mbss_group,
        acl_policy: cap.acl_policy,
        acl: cap.acl.iter().copied().collect(),
        psk_list: cap
            .psks
            .iter()
            .map(|(key_id, psk)| Psk {
                key_id: *key_id,
                psk: psk.clone(),
            })
            .collect(),
        neigh_list: cap.neighs.values().copied().collect(),
        wps_cred_list: cap.wps_creds.clone(),
        radius_list: cap.radius_list.clone(),
        acct_list: cap.acct_list.clone(),
        passpoint: cap.passpoint.clone(),
        ..Default::default()
    };

    // ACL deltas are always computed; they cost nothing when equal.
    for mac in &cap.acl {
        if !sap.acl.contains(mac) {
            ap.acl_add.push(*mac);
        }
    }
    for mac in &sap.acl {
        if !cap.acl.contains(mac) {
            ap.acl_del.push(*mac);
        }
    }

    let mut changed = false;
    if allow_changed {
        let all = vif_type_changed;
        ap.ssid_changed = all || ssid_changed(&cap.ssid, &sap.ssid);
        ap.psk_list_changed = all || psk_list_changed(&cap.psks, &sap.psk_list, &ap.wpa);
        ap.neigh_list_changed = all || neigh_list_changed(&cap.neighs, &sap.neigh_list);
        ap.wps_cred_list_changed =
            all || wps_cred_list_changed(&cap.wps_creds, &sap.wps_cred_list);
        ap.acl_changed = all || acl_changed(&cap.acl, &sap.acl);
        ap.channel_changed = all || channel_changed(&cap.channel, &sap.channel);
        ap.beacon_interval_tu_changed = all || (sap.beacon_interval_tu != cap.beacon_interval_tu);
        ap.isolated_changed = all || (sap.isolated != cap.isolated);
        ap.ssid_hidden_changed = all || (sap.ssid_hidden != cap.ssid_hidden);
        ap.mcast2ucast_changed = all || (sap.mcast2ucast != cap.mcast2ucast);
        ap.acl_policy_changed =
            all || acl_policy_changed(&cap.acl_policy, &sap.acl_policy, &sap.acl);
        ap.wpa_changed = all || wpa_changed(&sap.wpa, &cap.wpa);
        ap.mode_changed = all || ap_mode_changed(&sap.mode, &cap.mode);
        ap.bridge_if_name_changed = all || (sap.bridge_if_name != cap.bridge_if_name);
        ap.nas_identifier_changed = all || (sap.nas_identifier != cap.nas_identifier);
        ap.wps_pbc_changed = all || (sap.wps_pbc != cap.wps_pbc);
        ap.multi_ap_changed = all || (sap.multi_ap != cap.multi_ap);
        ap.mbss_mode_changed = all || (sap.mbss_mode != cap.mbss_mode);
        ap.mbss_group_changed = all || (sap.mbss_group != cap.mbss_group);
        ap.radius_list_changed = all || radius_list_changed(&cap.radius_list, &sap.radius_list);
        ap.acct_list_changed = all || radius_list_changed(&cap.acct_list, &sap.acct_list);
        ap.passpoint_changed = all || (cap.passpoint != sap.passpoint);

        changed = ap.ssid_changed
            || ap.psk_list_changed
            || ap.neigh_list_changed
            || ap.wps_cred_list_changed
            || ap.acl_changed
            || ap.channel_changed
            || ap.beacon_interval_tu_changed
            || ap.isolated_changed
            || ap.ssid_hidden_changed
            || ap.mcast2ucast_changed
            || ap.acl_policy_changed
            || ap.wpa_changed
            || ap.mode_changed
            || ap.bridge_if_name_changed
            || ap.nas_identifier_changed
            || ap.wps_pbc_changed
            || ap.multi_ap_changed
            || ap.mbss_mode_changed
            || ap.mbss_group_changed
            || ap.radius_list_changed
            || ap.acct_list_changed
            || ap.passpoint_changed;

        // CSA eligibility: a pure channel change on a running AP can ride
        // a channel-switch announcement, unless any of the current
        // channel's segments still owes (or is running) a CAC.
        if !all && dvif_enabled && ap.channel.control_freq_mhz != 0 && svif_status == VifStatus::Enabled
        {
            let cs = &sphy.channel_states;
            let current = &sap.channel;
            let cac_running = channel_intersects_state(cs, current, DfsState::CacInProgress);
            let cac_bugged = channel_intersects_state(cs, current, DfsState::CacPossible);
            let csa_eligible = ap.channel_changed && !ap.mode_changed;
            if csa_eligible && (cac_running || cac_bugged) {
                info!(
                    vif = %cvif.vif_name,
                    cac_running,
                    cac_bugged,
                    "confsync: csa impossible due to cac"
                );
            }
            ap.csa_required = csa_eligible && !(cac_running || cac_bugged);
        }

        if ap.neigh_list_changed {
            ap.neigh_add_list = neigh_filter(&cap.neighs, &sap.neigh_list, NeighAction::Add);
            ap.neigh_mod_list = neigh_filter(&cap.neighs, &sap.neigh_list, NeighAction::Mod);
            ap.neigh_del_list = neigh_filter(&cap.neighs, &sap.neigh_list, NeighAction::Del);
        }
    }

    (ap, changed)
}

fn sta_operation(
    networks: &[StaNetwork],
    link: &StaLink,
    network_changed: bool,
) -> StaOperation {
    let desired = if networks.is_empty() {
        StaLinkStatus::Disconnected
    } else {
        StaLinkStatus::Connected
    };

    match desired {
        StaLinkStatus::Connected => match link.status {
            StaLinkStatus::Unknown => (),
            // A live link is verified against the candidates below.
            StaLinkStatus::Connected => (),
            StaLinkStatus::Connecting => {
                return if network_changed {
                    StaOperation::Connect
                } else {
                    StaOperation::Nop
                };
            }
            StaLinkStatus::Disconnected => return StaOperation::Connect,
        },
        StaLinkStatus::Disconnected => match link.status {
            StaLinkStatus::Unknown => (),
            StaLinkStatus::Connected | StaLinkStatus::Connecting => {
                return StaOperation::Disconnect;
            }
            StaLinkStatus::Disconnected => return StaOperation::Nop,
        },
        _ => (),
    }

    for net in networks {
        let multi_ap_match = net.multi_ap == link.multi_ap;
        let bridge_match = net.bridge_if_name == link.bridge_if_name;
        let bssid_valid = !net.bssid.is_zero();
        let bssid_match = net.bssid == link.bssid;
        let ssid_match = net.ssid == link.ssid;
        let ccmp = net.wpa.pairwise_ccmp && link.wpa.pairwise_ccmp;
        let tkip = net.wpa.pairwise_tkip && link.wpa.pairwise_tkip;
        let wpa = net.wpa.wpa && link.wpa.wpa;
        let rsn = net.wpa.rsn && link.wpa.rsn;
        let psk = net.wpa.akm_psk && link.wpa.akm_psk;
        let sae = net.wpa.akm_sae && link.wpa.akm_sae;
        let crypto_match = (ccmp || tkip) && (wpa || rsn) && (psk || sae);
        let net_match = (bssid_valid && bssid_match) || (!bssid_valid && ssid_match);
        if net_match && crypto_match && multi_ap_match && bridge_match {
            return StaOperation::Nop;
        }
    }

    StaOperation::Reconnect
}

fn sta_net_list_changed(state: &StaState, desired: &[StaNetwork]) -> bool {
    for d in desired {
        if !state.networks.iter().any(|s| s.is_identical(d)) {
            return true;
        }
    }
    for s in &state.networks {
        if !desired.iter().any(|d| d.is_identical(s)) {
            return true;
        }
    }
    false
}

fn build_sta_config(
    csta: &StaConf,
    svif: &VifState,
    allow_changed: bool,
    strict_network_changes: bool,
) -> (StaConfig, bool) {
    let default_state = StaState::default();
    let ssta = svif.sta().unwrap_or(&default_state);

    let mut sta = StaConfig {
        networks: csta.networks.clone(),
        ..Default::default()
    };
    sta.network_changed = sta_net_list_changed(ssta, &sta.networks) && allow_changed;
    sta.operation = sta_operation(&sta.networks, &ssta.link, sta.network_changed);

    if sta.operation == StaOperation::Nop && !strict_network_changes {
        // The interface is already associated with an acceptable target;
        // pushing network blocks at the driver would only churn it.
        sta.network_changed = false;
    }

    let changed =
        (sta.network_changed || sta.operation != StaOperation::Nop) && allow_changed;
    (sta, changed)
}

fn cac_is_planned(sphy: &PhyState, dvif_enabled: bool, dvif_changed: bool, channel: &Channel) -> bool {
    if !dvif_enabled {
        return false;
    }
    let cs = &sphy.channel_states;
    let cac_running = channel_intersects_state(cs, channel, DfsState::CacInProgress);
    let cac_needed = channel_intersects_state(cs, channel, DfsState::CacPossible);
    let cac_completed = channel_intersects_state(cs, channel, DfsState::CacCompleted);
    let cac_discarded = cac_completed && dvif_changed;
    cac_running || cac_needed || cac_discarded
}

fn build_phy_config(cphy: &ConfPhy, sphy: &PhyState) -> PhyConfig {
    let mut dphy = PhyConfig {
        phy_name: cphy.phy_name.clone(),
        enabled: cphy.enabled,
        tx_chainmask: cphy.tx_chainmask,
        radar: cphy.radar,
        reg_domain: cphy.reg_domain,
        ..Default::default()
    };

    let skip = !dphy.enabled && !sphy.enabled;
    if !skip {
        dphy.enabled_changed = cphy.enabled != sphy.enabled;
        dphy.tx_chainmask_changed = cphy.tx_chainmask != sphy.tx_chainmask;
        dphy.radar_changed = cphy.radar != sphy.radar;
        dphy.reg_domain_changed = cphy.reg_domain != sphy.reg_domain;
        dphy.changed = dphy.enabled_changed
            || dphy.tx_chainmask_changed
            || dphy.radar_changed
            || dphy.reg_domain_changed;
    }
    dphy
}

/// Build the per-phy reconfiguration plan. `gates` carries the deferral and
/// CAC bookkeeping that suppresses changes which must not fire this round.
pub(crate) fn build_drv_conf(
    tree: &ConfTree,
    observed: &ObservedTree,
    gates: &mut Gates<'_>,
) -> DrvConf {
    let mut drv = DrvConf::default();

    for (phy_name, cphy) in &tree.phys {
        let default_phy = PhyState::default();
        let (sphy, svifs) = match observed.phy(phy_name) {
            Some(info) => (&info.state, Some(&info.vifs)),
            None => (&default_phy, None),
        };

        let mut dphy = build_phy_config(cphy, sphy);
        let cac_ongoing = sphy
            .channel_states
            .iter()
            .any(|cs| cs.dfs == DfsState::CacInProgress)
            && !gates.cac_timed_out(phy_name);
        let mut cac_planned = false;

        for (vif_name, cvif) in &cphy.vifs {
            let default_vif = VifState::default();
            let svif = svifs
                .and_then(|m| m.get(vif_name))
                .unwrap_or(&default_vif);

            let enabled = cvif.enabled && cphy.enabled;
            let enabling = svif.status != VifStatus::Enabled && enabled;
            let deferred = enabling && gates.defer_vif_enable_start(vif_name);
            let config_is_disabled = !enabled;
            let state_is_disabled =
                matches!(svif.status, VifStatus::Disabled | VifStatus::Unknown);
            let skip = (config_is_disabled && state_is_disabled)
                || cac_ongoing
                || cac_planned
                || deferred;

            if cac_planned {
                debug!(phy = %phy_name, vif = %vif_name, "confsync: skipping, another vif will run cac");
            }
            if cac_ongoing {
                debug!(phy = %phy_name, vif = %vif_name, "confsync: skipping, phy is running cac");
            }

            let mut dvif = VifConfig {
                vif_name: vif_name.clone(),
                enabled,
                vif_type: cvif.vif_type(),
                tx_power_dbm: cvif.tx_power_dbm,
                ..Default::default()
            };

            if !skip {
                dvif.enabled_changed = vif_enabled_changed(svif.status, dvif.enabled);
                dvif.vif_type_changed = cvif.vif_type() != svif.vif_type;
                dvif.tx_power_dbm_changed = cvif.tx_power_dbm != svif.tx_power_dbm;
                dvif.changed = dvif.enabled_changed || dvif.vif_type_changed;
                dphy.changed |= dvif.tx_power_dbm_changed;
            }

            match &cvif.kind {
                ConfVifKind::Undefined | ConfVifKind::ApVlan => (),
                ConfVifKind::Ap(cap) => {
                    let (ap, ap_changed) = build_ap_config(
                        cvif,
                        cap,
                        sphy,
                        svif,
                        !skip,
                        dvif.vif_type_changed,
                        dvif.enabled,
                        svif.status,
                    );
                    dvif.changed |= ap_changed;
                    let channel = ap.channel;
                    dvif.kind = VifConfigKind::Ap(Box::new(ap));
                    if !skip && cac_is_planned(sphy, dvif.enabled, dvif.changed, &channel) {
                        cac_planned = true;
                    }
                }
                ConfVifKind::Sta(csta) => {
                    let (sta, sta_changed) =
                        build_sta_config(csta, svif, !skip, gates.strict_network_changes);
                    dvif.changed |= sta_changed;
                    dvif.kind = VifConfigKind::Sta(sta);
                }
            }

            if dvif.enabled_changed {
                info!(
                    phy = %phy_name,
                    vif = %vif_name,
                    status = ?svif.status,
                    enabled = cvif.enabled,
                    "confsync: enabled changing"
                );
            }

            if skip {
                dvif.changed = false;
            }

            dphy.vif_list.push(dvif);
        }

        drv.phy_list.push(dphy);
    }

    drv
}
