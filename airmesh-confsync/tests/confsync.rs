use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use airmesh_confsync::conf::ConfMutator;
use airmesh_confsync::types::{
    Channel, ChannelState, DfsState, HwAddr, Ssid, StaLinkStatus, StaNetwork, VifStatus, VifType,
    Wpa,
};
use airmesh_confsync::{
    ApConf, ApState, ConfPhy, ConfSync, ConfTree, ConfVif, ConfVifKind, ConfsyncEnv, DeferEvent,
    DeferVifDown, DrvConf, ObservedTree, PhyInfo, PhyState, StaConf, StaOperation, StaState,
    SyncState, VifState, VifStateKind,
};

fn chan(freq: u32, width: u32, center: u32) -> Channel {
    Channel {
        control_freq_mhz: freq,
        center_freq0_mhz: center,
        width_mhz: width,
    }
}

fn ap_conf(ssid: &str, channel: Channel) -> ApConf {
    ApConf {
        ssid: Ssid::from_str(ssid),
        channel,
        beacon_interval_tu: 100,
        ..Default::default()
    }
}

fn ap_state(ssid: &str, channel: Channel) -> ApState {
    ApState {
        ssid: Ssid::from_str(ssid),
        channel,
        beacon_interval_tu: 100,
        ..Default::default()
    }
}

fn conf_tree_one_ap(phy: &str, vif: &str, ap: ApConf) -> ConfTree {
    let mut vifs = BTreeMap::new();
    vifs.insert(
        vif.to_string(),
        ConfVif {
            vif_name: vif.to_string(),
            enabled: true,
            tx_power_dbm: 0,
            kind: ConfVifKind::Ap(Box::new(ap)),
        },
    );
    let mut phys = BTreeMap::new();
    phys.insert(
        phy.to_string(),
        ConfPhy {
            phy_name: phy.to_string(),
            enabled: true,
            ..Default::default()
        },
    );
    let mut tree = ConfTree { phys };
    tree.phys.get_mut(phy).unwrap().vifs = vifs;
    tree
}

fn observed_one_ap(
    phy: &str,
    vif: &str,
    ap: ApState,
    channel_states: Vec<ChannelState>,
) -> ObservedTree {
    let mut vifs = BTreeMap::new();
    vifs.insert(
        vif.to_string(),
        VifState {
            status: VifStatus::Enabled,
            vif_type: VifType::Ap,
            tx_power_dbm: 0,
            kind: VifStateKind::Ap(Box::new(ap)),
        },
    );
    let mut phys = BTreeMap::new();
    phys.insert(
        phy.to_string(),
        PhyInfo {
            state: PhyState {
                exists: true,
                enabled: true,
                channel_states,
                ..Default::default()
            },
            vifs,
        },
    );
    ObservedTree { phys }
}

struct TestEnv {
    conf: ConfTree,
    observed: ObservedTree,
    defer: Option<Rc<RefCell<DeferVifDown>>>,
    accept: bool,
    requests: Vec<DrvConf>,
}

impl TestEnv {
    fn new(conf: ConfTree, observed: ObservedTree) -> Self {
        Self {
            conf,
            observed,
            defer: None,
            accept: true,
            requests: Vec::new(),
        }
    }
}

impl ConfsyncEnv for TestEnv {
    fn build_conf(&mut self, now: u64) -> ConfTree {
        let mut tree = self.conf.clone();
        if let Some(defer) = &self.defer {
            defer.borrow_mut().mutate(&mut tree, now);
        }
        tree
    }

    fn observed(&self) -> &ObservedTree {
        &self.observed
    }

    fn request_config(&mut self, conf: &DrvConf) -> bool {
        self.requests.push(conf.clone());
        self.accept
    }
}

#[test]
fn converged_plan_has_no_changes_and_is_idempotent() {
    let c = chan(5180, 40, 5190);
    let conf = conf_tree_one_ap("phy0", "home-ap-5", ap_conf("HomeWifi", c));
    let observed = observed_one_ap("phy0", "home-ap-5", ap_state("HomeWifi", c), vec![]);

    let mut cs = ConfSync::new().with_strict_network_changes(false);
    let plan1 = cs.build_plan(&conf, &observed, 0);
    assert!(!plan1.any_changed(), "converged tree produces no changes");

    let plan2 = cs.build_plan(&conf, &observed, 0);
    assert_eq!(format!("{plan1:?}"), format!("{plan2:?}"), "diff is idempotent");
}

#[test]
fn ssid_change_marks_vif_changed() {
    let c = chan(5180, 40, 5190);
    let conf = conf_tree_one_ap("phy0", "home-ap-5", ap_conf("NewWifi", c));
    let observed = observed_one_ap("phy0", "home-ap-5", ap_state("HomeWifi", c), vec![]);

    let mut cs = ConfSync::new().with_strict_network_changes(false);
    let plan = cs.build_plan(&conf, &observed, 0);
    let vif = plan.phy("phy0").unwrap().vif("home-ap-5").unwrap();
    assert!(vif.changed);
    let ap = vif.ap().unwrap();
    assert!(ap.ssid_changed);
    assert!(!ap.channel_changed);
}

#[test]
fn csa_denied_while_current_channel_owes_cac() {
    // The AP sits on a DFS channel whose segments still owe a CAC; a
    // width change there cannot ride a CSA.
    let current = chan(5260, 40, 5270);
    let desired = chan(5260, 80, 5290);
    let conf = conf_tree_one_ap("phy0", "home-ap-5", ap_conf("HomeWifi", desired));
    let observed = observed_one_ap(
        "phy0",
        "home-ap-5",
        ap_state("HomeWifi", current),
        vec![ChannelState {
            channel: chan(5260, 20, 5260),
            dfs: DfsState::CacPossible,
        }],
    );

    let mut cs = ConfSync::new().with_strict_network_changes(false);
    let plan = cs.build_plan(&conf, &observed, 0);
    let ap = plan
        .phy("phy0")
        .unwrap()
        .vif("home-ap-5")
        .unwrap()
        .ap()
        .unwrap();
    assert!(ap.channel_changed);
    assert!(!ap.csa_required, "CSA must fall back to full reconfig");
}

#[test]
fn csa_allowed_on_cac_completed_channel() {
    let current = chan(5180, 40, 5190);
    let desired = chan(5180, 80, 5210);
    let conf = conf_tree_one_ap("phy0", "home-ap-5", ap_conf("HomeWifi", desired));
    let observed = observed_one_ap(
        "phy0",
        "home-ap-5",
        ap_state("HomeWifi", current),
        vec![ChannelState {
            channel: chan(5180, 20, 5180),
            dfs: DfsState::CacCompleted,
        }],
    );

    let mut cs = ConfSync::new().with_strict_network_changes(false);
    let plan = cs.build_plan(&conf, &observed, 0);
    let ap = plan
        .phy("phy0")
        .unwrap()
        .vif("home-ap-5")
        .unwrap()
        .ap()
        .unwrap();
    assert!(ap.channel_changed);
    assert!(ap.csa_required);
}

#[test]
fn ongoing_cac_skips_every_vif_on_the_phy() {
    let c = chan(5260, 40, 5270);
    let conf = conf_tree_one_ap("phy0", "home-ap-5", ap_conf("Changed", c));
    let observed = observed_one_ap(
        "phy0",
        "home-ap-5",
        ap_state("HomeWifi", c),
        vec![ChannelState {
            channel: chan(5260, 20, 5260),
            dfs: DfsState::CacInProgress,
        }],
    );

    let mut cs = ConfSync::new().with_strict_network_changes(false);
    let plan = cs.build_plan(&conf, &observed, 0);
    let vif = plan.phy("phy0").unwrap().vif("home-ap-5").unwrap();
    assert!(!vif.changed, "vif untouched while the phy runs a CAC");
}

#[test]
fn enable_deferral_suppresses_followup_rounds() {
    let c = chan(5180, 40, 5190);
    let conf = conf_tree_one_ap("phy0", "home-ap-5", ap_conf("HomeWifi", c));
    let mut observed = observed_one_ap("phy0", "home-ap-5", ap_state("HomeWifi", c), vec![]);
    observed
        .phys
        .get_mut("phy0")
        .unwrap()
        .vifs
        .get_mut("home-ap-5")
        .unwrap()
        .status = VifStatus::Disabled;

    let mut cs = ConfSync::new().with_strict_network_changes(false);

    // First round: the enable goes out and starts the deferral window.
    let plan = cs.build_plan(&conf, &observed, 0);
    let vif = plan.phy("phy0").unwrap().vif("home-ap-5").unwrap();
    assert!(vif.changed);
    assert!(vif.enabled_changed);

    // Second round inside the window: suppressed.
    let plan = cs.build_plan(&conf, &observed, 1_000);
    let vif = plan.phy("phy0").unwrap().vif("home-ap-5").unwrap();
    assert!(!vif.changed, "bring-up in progress must not be interrupted");

    // Past the window the change flows again.
    let plan = cs.build_plan(&conf, &observed, 11_000);
    let vif = plan.phy("phy0").unwrap().vif("home-ap-5").unwrap();
    assert!(vif.changed);
}

#[test]
fn deferral_clears_when_driver_reports_enabled() {
    let c = chan(5180, 40, 5190);
    let conf = conf_tree_one_ap("phy0", "home-ap-5", ap_conf("HomeWifi", c));
    let mut observed = observed_one_ap("phy0", "home-ap-5", ap_state("HomeWifi", c), vec![]);
    observed
        .phys
        .get_mut("phy0")
        .unwrap()
        .vifs
        .get_mut("home-ap-5")
        .unwrap()
        .status = VifStatus::Disabled;

    let mut cs = ConfSync::new().with_strict_network_changes(false);
    let _ = cs.build_plan(&conf, &observed, 0);
    cs.defer_vif_enable_stop("home-ap-5", VifStatus::Enabled);

    // The window is gone; the enable is re-evaluated normally.
    let plan = cs.build_plan(&conf, &observed, 1_000);
    let vif = plan.phy("phy0").unwrap().vif("home-ap-5").unwrap();
    assert!(vif.changed);
}

fn sta_conf_tree(networks: Vec<StaNetwork>) -> ConfTree {
    let mut vifs = BTreeMap::new();
    vifs.insert(
        "bhaul-sta-5".to_string(),
        ConfVif {
            vif_name: "bhaul-sta-5".to_string(),
            enabled: true,
            tx_power_dbm: 0,
            kind: ConfVifKind::Sta(StaConf { networks }),
        },
    );
    let mut phys = BTreeMap::new();
    phys.insert(
        "phy0".to_string(),
        ConfPhy {
            phy_name: "phy0".to_string(),
            enabled: true,
            vifs,
            ..Default::default()
        },
    );
    ConfTree { phys }
}

fn sta_observed(link_status: StaLinkStatus, link_net: Option<&StaNetwork>) -> ObservedTree {
    let mut sta = StaState::default();
    sta.link.status = link_status;
    if let Some(net) = link_net {
        sta.link.bssid = net.bssid;
        sta.link.ssid = net.ssid.clone();
        sta.link.wpa = net.wpa;
        sta.link.multi_ap = net.multi_ap;
        sta.link.bridge_if_name = net.bridge_if_name.clone();
    }
    let mut vifs = BTreeMap::new();
    vifs.insert(
        "bhaul-sta-5".to_string(),
        VifState {
            status: VifStatus::Enabled,
            vif_type: VifType::Sta,
            tx_power_dbm: 0,
            kind: VifStateKind::Sta(sta),
        },
    );
    let mut phys = BTreeMap::new();
    phys.insert(
        "phy0".to_string(),
        PhyInfo {
            state: PhyState {
                exists: true,
                enabled: true,
                ..Default::default()
            },
            vifs,
        },
    );
    ObservedTree { phys }
}

fn psk_net(ssid: &str) -> StaNetwork {
    StaNetwork {
        bssid: HwAddr::ZERO,
        ssid: Ssid::from_str(ssid),
        psk: "secret".to_string(),
        wpa: Wpa {
            rsn: true,
            pairwise_ccmp: true,
            akm_psk: true,
            ..Default::default()
        },
        multi_ap: false,
        bridge_if_name: String::new(),
    }
}

#[test]
fn sta_disconnected_with_config_connects() {
    let net = psk_net("MeshBackhaul");
    let conf = sta_conf_tree(vec![net]);
    let observed = sta_observed(StaLinkStatus::Disconnected, None);

    let mut cs = ConfSync::new().with_strict_network_changes(false);
    let plan = cs.build_plan(&conf, &observed, 0);
    let sta = plan
        .phy("phy0")
        .unwrap()
        .vif("bhaul-sta-5")
        .unwrap()
        .sta()
        .unwrap();
    assert_eq!(sta.operation, StaOperation::Connect);
}

#[test]
fn sta_connected_without_config_disconnects() {
    let net = psk_net("MeshBackhaul");
    let conf = sta_conf_tree(vec![]);
    let observed = sta_observed(StaLinkStatus::Connected, Some(&net));

    let mut cs = ConfSync::new().with_strict_network_changes(false);
    let plan = cs.build_plan(&conf, &observed, 0);
    let sta = plan
        .phy("phy0")
        .unwrap()
        .vif("bhaul-sta-5")
        .unwrap()
        .sta()
        .unwrap();
    assert_eq!(sta.operation, StaOperation::Disconnect);
}

#[test]
fn sta_connected_to_matching_network_is_nop() {
    let net = psk_net("MeshBackhaul");
    let conf = sta_conf_tree(vec![net.clone()]);
    // Driver doesn't report network blocks back, only the link; the NOP
    // shortcut keeps that from looking like a divergence.
    let observed = sta_observed(StaLinkStatus::Connected, Some(&net));

    let mut cs = ConfSync::new().with_strict_network_changes(false);
    let plan = cs.build_plan(&conf, &observed, 0);
    let vif = plan.phy("phy0").unwrap().vif("bhaul-sta-5").unwrap();
    let sta = vif.sta().unwrap();
    assert_eq!(sta.operation, StaOperation::Nop);
    assert!(!sta.network_changed);
    assert!(!vif.changed);
}

#[test]
fn sta_strict_mode_keeps_network_changes() {
    let net = psk_net("MeshBackhaul");
    let conf = sta_conf_tree(vec![net.clone()]);
    let observed = sta_observed(StaLinkStatus::Connected, Some(&net));

    let mut cs = ConfSync::new().with_strict_network_changes(true);
    let plan = cs.build_plan(&conf, &observed, 0);
    let sta = plan
        .phy("phy0")
        .unwrap()
        .vif("bhaul-sta-5")
        .unwrap()
        .sta()
        .unwrap();
    assert_eq!(sta.operation, StaOperation::Nop);
    assert!(sta.network_changed, "strict mode reports the list delta");
}

#[test]
fn sta_mismatched_link_reconnects() {
    let net = psk_net("MeshBackhaul");
    let other = psk_net("SomeOtherSsid");
    let conf = sta_conf_tree(vec![net]);
    let observed = sta_observed(StaLinkStatus::Connected, Some(&other));

    let mut cs = ConfSync::new().with_strict_network_changes(false);
    let plan = cs.build_plan(&conf, &observed, 0);
    let sta = plan
        .phy("phy0")
        .unwrap()
        .vif("bhaul-sta-5")
        .unwrap()
        .sta()
        .unwrap();
    assert_eq!(sta.operation, StaOperation::Reconnect);
}

#[test]
fn state_machine_requests_waits_verifies_idles() {
    let c = chan(5180, 40, 5190);
    let conf = conf_tree_one_ap("phy0", "home-ap-5", ap_conf("NewWifi", c));
    let observed = observed_one_ap("phy0", "home-ap-5", ap_state("HomeWifi", c), vec![]);
    let mut env = TestEnv::new(conf, observed);

    let mut cs = ConfSync::new().with_strict_network_changes(false);
    assert_eq!(cs.state(), SyncState::Idle);

    cs.on_conf_changed(0);
    assert_eq!(cs.state(), SyncState::Requesting);
    cs.poll(0, true, &mut env);
    assert_eq!(cs.state(), SyncState::Waiting);
    assert_eq!(env.requests.len(), 1);
    assert!(env.requests[0].any_changed());

    // Driver applied the config; pretend the state now matches.
    env.observed = observed_one_ap("phy0", "home-ap-5", ap_state("NewWifi", c), vec![]);
    cs.on_state_changed(100);
    assert_eq!(cs.state(), SyncState::Verifying);
    cs.poll(100, true, &mut env);
    assert_eq!(cs.state(), SyncState::Idle);
    assert!(cs.is_settled());
}

#[test]
fn retry_fires_when_driver_does_not_converge() {
    let c = chan(5180, 40, 5190);
    let conf = conf_tree_one_ap("phy0", "home-ap-5", ap_conf("NewWifi", c));
    let observed = observed_one_ap("phy0", "home-ap-5", ap_state("HomeWifi", c), vec![]);
    let mut env = TestEnv::new(conf, observed);

    let mut cs = ConfSync::new().with_strict_network_changes(false);
    cs.on_conf_changed(0);
    cs.poll(0, true, &mut env);
    assert_eq!(cs.state(), SyncState::Waiting);

    // Nothing came back from the driver: the retry forces a new round.
    cs.poll(30_000, true, &mut env);
    // The cached tree is identical, so the round short-circuits into
    // verification, which still shows divergence -> WAITING again.
    assert_eq!(cs.state(), SyncState::Waiting);
    assert_eq!(env.requests.len(), 1, "identical request is not re-sent");
}

#[test]
fn rejected_request_without_deferrals_goes_idle() {
    let c = chan(5180, 40, 5190);
    let conf = conf_tree_one_ap("phy0", "home-ap-5", ap_conf("NewWifi", c));
    let observed = observed_one_ap("phy0", "home-ap-5", ap_state("HomeWifi", c), vec![]);
    let mut env = TestEnv::new(conf, observed);
    env.accept = false;

    let mut cs = ConfSync::new().with_strict_network_changes(false);
    cs.on_conf_changed(0);
    cs.poll(0, true, &mut env);
    assert_eq!(cs.state(), SyncState::Idle);
}

#[test]
fn subscriber_fires_on_registration_and_transitions() {
    let seen: Rc<RefCell<Vec<SyncState>>> = Rc::new(RefCell::new(Vec::new()));
    let mut cs = ConfSync::new().with_strict_network_changes(false);
    let sink = seen.clone();
    let token = cs.register_changed_fn(Box::new(move |s| sink.borrow_mut().push(s)));
    assert_eq!(seen.borrow().as_slice(), &[SyncState::Idle]);

    cs.on_conf_changed(0);
    assert_eq!(
        seen.borrow().as_slice(),
        &[SyncState::Idle, SyncState::Requesting]
    );

    cs.unregister_changed_fn(token);
    cs.on_conf_changed(0);
    assert_eq!(seen.borrow().len(), 2);
}

// Defer-vif-down scenarios.

fn defer_tree(phy_enabled: bool, vif_enabled: bool) -> ConfTree {
    let c = chan(5180, 40, 5190);
    let mut tree = conf_tree_one_ap("phy0", "bhaul-ap-24", ap_conf("Mesh", c));
    let phy = tree.phys.get_mut("phy0").unwrap();
    phy.enabled = phy_enabled;
    phy.vifs.get_mut("bhaul-ap-24").unwrap().enabled = vif_enabled;
    tree
}

#[test]
fn grace_period_holds_vif_up_until_it_expires() {
    let mut defer = DeferVifDown::new();
    assert!(defer.add_rule("bhaul-ap-24", 120));
    defer.on_sta_connected("bhaul-ap-24");

    let events: Rc<RefCell<Vec<DeferEvent>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = events.clone();
    defer.register_observer(
        "bhaul-ap-24",
        Box::new(move |ev| sink.borrow_mut().push(ev)),
        0,
    );

    // Establish the enabled baseline.
    let mut tree = defer_tree(true, true);
    defer.mutate(&mut tree, 0);
    assert!(tree.phys["phy0"].vifs["bhaul-ap-24"].enabled);

    // Config takes the vif down: the override keeps it up.
    let mut tree = defer_tree(true, false);
    defer.mutate(&mut tree, 1_000);
    assert!(tree.phys["phy0"].vifs["bhaul-ap-24"].enabled);
    assert!(defer.grace_active("bhaul-ap-24", 1_000));
    assert_eq!(events.borrow().as_slice(), &[DeferEvent::GraceStarted]);

    // Sixty seconds in: still held, about sixty left.
    let mut tree = defer_tree(true, false);
    defer.mutate(&mut tree, 61_000);
    assert!(tree.phys["phy0"].vifs["bhaul-ap-24"].enabled);
    let remaining = defer.remaining_ms("bhaul-ap-24", 61_000);
    assert!((59_000..=60_000).contains(&remaining), "remaining {remaining}");

    // Past the grace period the override clears.
    defer.poll(121_001);
    assert!(defer.take_invalidated());
    let mut tree = defer_tree(true, false);
    defer.mutate(&mut tree, 121_002);
    assert!(!tree.phys["phy0"].vifs["bhaul-ap-24"].enabled);
    assert_eq!(
        events.borrow().as_slice(),
        &[DeferEvent::GraceStarted, DeferEvent::GraceStopped]
    );
}

#[test]
fn grace_period_cancels_when_stations_leave() {
    let mut defer = DeferVifDown::new();
    assert!(defer.add_rule("bhaul-ap-24", 120));
    defer.on_sta_connected("bhaul-ap-24");

    let mut tree = defer_tree(true, true);
    defer.mutate(&mut tree, 0);

    let mut tree = defer_tree(true, false);
    defer.mutate(&mut tree, 1_000);
    assert!(tree.phys["phy0"].vifs["bhaul-ap-24"].enabled);

    // Last station leaves before the window runs out: down immediately.
    defer.on_sta_disconnected("bhaul-ap-24");
    let mut tree = defer_tree(true, false);
    defer.mutate(&mut tree, 30_000);
    assert!(!tree.phys["phy0"].vifs["bhaul-ap-24"].enabled);
    assert!(!defer.grace_active("bhaul-ap-24", 30_000));
}

#[test]
fn grace_period_cancels_when_config_reenables() {
    let mut defer = DeferVifDown::new();
    assert!(defer.add_rule("bhaul-ap-24", 120));
    defer.on_sta_connected("bhaul-ap-24");

    let mut tree = defer_tree(true, true);
    defer.mutate(&mut tree, 0);
    let mut tree = defer_tree(false, false);
    defer.mutate(&mut tree, 1_000);
    assert!(tree.phys["phy0"].enabled, "phy held up with the vif");
    assert!(tree.phys["phy0"].vifs["bhaul-ap-24"].enabled);

    let mut tree = defer_tree(true, true);
    defer.mutate(&mut tree, 2_000);
    assert!(tree.phys["phy0"].vifs["bhaul-ap-24"].enabled);
    assert!(!defer.grace_active("bhaul-ap-24", 2_000));
}
