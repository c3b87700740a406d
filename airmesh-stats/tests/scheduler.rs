use airmesh_stats::{
    publish_pending, EntryParams, MemorySink, RadioType, ScanDecision, ScanType, StatsConf,
    StatsType, SurveyRecord,
};

fn survey_params() -> EntryParams {
    EntryParams {
        radio_type: RadioType::Band5G,
        scan_type: ScanType::OnChan,
        stats_type: StatsType::Survey,
        sample_seconds: 10.0,
        report_seconds: 60.0,
        ..Default::default()
    }
}

fn survey_rec(ts_ms: u64, channel: u32) -> SurveyRecord {
    SurveyRecord {
        timestamp_ms: ts_ms,
        channel,
        duration_ms: 50,
        busy_percent: 12,
        busy_tx_percent: 3,
        busy_rx_percent: 6,
        busy_self_percent: 2,
        noise_floor_dbm: -95,
    }
}

fn setup_5g(conf: &mut StatsConf) {
    conf.set_band("phy1", RadioType::Band5G, 0x0f);
    conf.set_oper_freq("phy1", 5180);
}

#[test]
fn entry_starts_on_first_run_and_reports_on_cadence() {
    let mut conf = StatsConf::new();
    setup_5g(&mut conf);
    conf.configure("survey-5g", survey_params());

    conf.run(0.0, 1_000_000);
    assert!(conf.is_running("survey-5g"));

    // Six samples over the minute.
    for i in 0..6 {
        let now = 5.0 + (i as f64) * 10.0;
        conf.push_survey("phy1", 5180, now, survey_rec((now * 1e3) as u64, 36));
    }

    conf.run(60.0, 1_060_000);
    assert_eq!(conf.pending_reports(), 1);
    let mut sink = MemorySink::default();
    assert_eq!(publish_pending(&mut conf, &mut sink), 1);
    let report = &sink.reports[0];
    assert_eq!(report.surveys.len(), 6);
    assert_eq!(report.report_type, "raw");
    assert_eq!(report.timestamp_ms, 1_060_000);
    assert_eq!(conf.reports_sent(), 1);
}

#[test]
fn samples_filtered_by_band_scan_type_and_channel() {
    let mut conf = StatsConf::new();
    setup_5g(&mut conf);
    conf.set_band("phy0", RadioType::Band2G, 0x03);
    let mut params = survey_params();
    params.channels = vec![36];
    conf.configure("survey-5g", params);
    conf.run(0.0, 0);

    // Wrong band.
    conf.push_survey("phy0", 2412, 1.0, survey_rec(1_000, 1));
    // Off-channel sample on an on-chan entry.
    conf.push_survey("phy1", 5200, 2.0, survey_rec(2_000, 40));
    // Channel not in the list (oper freq moved).
    conf.set_oper_freq("phy1", 5200);
    conf.push_survey("phy1", 5200, 3.0, survey_rec(3_000, 40));
    conf.set_oper_freq("phy1", 5180);
    // The one that matches, fresh enough for the report tick.
    conf.push_survey("phy1", 5180, 59.0, survey_rec(59_000, 36));

    conf.run(60.0, 60_000);
    let mut sink = MemorySink::default();
    publish_pending(&mut conf, &mut sink);
    assert_eq!(sink.reports.len(), 1);
    assert_eq!(sink.reports[0].surveys.len(), 1);
    assert_eq!(sink.reports[0].surveys[0].channel, 36);
}

#[test]
fn report_limit_stops_the_entry() {
    let mut conf = StatsConf::new();
    setup_5g(&mut conf);
    let mut params = survey_params();
    params.report_limit = 2;
    conf.configure("survey-5g", params);
    conf.run(0.0, 0);

    for round in 1..=3u64 {
        let now = 60.0 * round as f64;
        conf.push_survey("phy1", 5180, now - 1.0, survey_rec(0, 36));
        conf.run(now, now as u64 * 1000);
    }
    // Third round: the limit was reached after two reports; the entry
    // stops instead of reporting again.
    assert_eq!(conf.drain_reports().len(), 2);
    assert!(!conf.is_running("survey-5g"));
}

#[test]
fn invalidated_entry_is_freed() {
    let mut conf = StatsConf::new();
    setup_5g(&mut conf);
    conf.configure("survey-5g", survey_params());
    conf.run(0.0, 0);
    assert!(conf.has_entry("survey-5g"));

    conf.invalidate("survey-5g");
    conf.run(1.0, 1_000);
    assert!(!conf.has_entry("survey-5g"));
}

#[test]
fn holdoff_defers_scans_until_delay_elapses() {
    let mut conf = StatsConf::new();
    setup_5g(&mut conf);
    let mut params = survey_params();
    params.scan_type = ScanType::OffChan;
    params.holdoff_busy_threshold = 50;
    params.holdoff_delay_seconds = 30;
    conf.configure("survey-offchan", params);
    conf.run(0.0, 0);

    // Idle channel: scans flow.
    conf.report_util("survey-offchan", 10);
    assert_eq!(conf.scan_filter("survey-offchan", 10.0), ScanDecision::Allow);

    // Busy channel: first check starts the delay, later checks hold.
    conf.report_util("survey-offchan", 80);
    assert_eq!(conf.scan_filter("survey-offchan", 20.0), ScanDecision::Deny);
    assert_eq!(conf.scan_filter("survey-offchan", 30.0), ScanDecision::Deny);

    // Delay elapsed: scan goes ahead even though the channel is busy.
    assert_eq!(conf.scan_filter("survey-offchan", 51.0), ScanDecision::Allow);

    // Utilization recovered: delay resets.
    conf.report_util("survey-offchan", 10);
    assert_eq!(conf.scan_filter("survey-offchan", 60.0), ScanDecision::Allow);
}

#[test]
fn device_entry_samples_thermal_records() {
    let mut conf = StatsConf::new();
    conf.set_band("phy0", RadioType::Band2G, 0x03);
    conf.set_band("phy1", RadioType::Band5G, 0x0f);
    let params = EntryParams {
        radio_type: RadioType::Band5G,
        stats_type: StatsType::Device,
        sample_seconds: 10.0,
        report_seconds: 30.0,
        ..Default::default()
    };
    conf.configure("device", params);
    conf.run(0.0, 0);

    conf.run(10.0, 10_000);
    conf.run(20.0, 20_000);
    conf.run(30.0, 30_000);
    let mut sink = MemorySink::default();
    publish_pending(&mut conf, &mut sink);
    assert_eq!(sink.reports.len(), 1);
    let thermal = &sink.reports[0].thermal;
    assert!(!thermal.is_empty());
    assert_eq!(thermal[0].radio_txchainmasks.len(), 2);
    assert_eq!(thermal[0].fan_rpm, -1);
}

#[test]
fn device_poll_still_samples_when_marked_for_removal() {
    let mut conf = StatsConf::new();
    conf.set_band("phy1", RadioType::Band5G, 0x0f);
    let params = EntryParams {
        radio_type: RadioType::Band5G,
        stats_type: StatsType::Device,
        sample_seconds: 10.0,
        report_seconds: 30.0,
        ..Default::default()
    };
    conf.configure("device", params);
    conf.run(0.0, 0);
    conf.run(10.0, 10_000);

    // Invalidate, then run with a due poll: the sample is still taken
    // before the entry is freed.
    conf.invalidate("device");
    conf.run(20.0, 20_000);
    assert!(!conf.has_entry("device"));
}

#[test]
fn next_at_tracks_earliest_deadline() {
    let mut conf = StatsConf::new();
    setup_5g(&mut conf);
    conf.configure("survey-5g", survey_params());
    // Unadopted params: run immediately.
    assert_eq!(conf.next_at(), Some(0.0));
    conf.run(0.0, 0);
    let at = conf.next_at().expect("report deadline scheduled");
    assert!(at > 0.0 && at <= 60.0, "next_at {at}");
}
