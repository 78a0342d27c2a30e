use std::{sync::atomic::Ordering, time::Duration};

use j1939_84::{
    BusService, BusServiceOptions, CatalogDecoder, J1939Error, ParameterCatalog, QueryFinding, SpnValue,
    ack::AckKind,
    channel::J1939Id,
    hardware::simulation::{SimResponse, SimulatedBus, SimulatedClock},
    listener::{Outcome, RecordingListener},
    registry::{ObdModule, VehicleModules},
};

const ENGINE: u8 = 0x00;
const AFTERTREATMENT: u8 = 0x3D;

const EEC2: u32 = 61443;
const EEC7: u32 = 64916;
const HOURS: u32 = 65253;
const CI: u32 = 65259;
const ET1: u32 = 65262;

fn vehicle(clock: &SimulatedClock) -> SimulatedBus {
    let mut bus = SimulatedBus::new(clock.clone());
    bus.add_broadcast(ENGINE, ET1, Duration::from_secs(1), Duration::from_millis(3), &[0x78, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]);
    bus.add_broadcast(ENGINE, EEC2, Duration::from_millis(50), Duration::ZERO, &[0xFF, 0xFF, 0x32, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]);
    bus.respond(ENGINE, HOURS, SimResponse::Data(vec![0x10, 0x27, 0, 0, 0xFF, 0xFF, 0xFF, 0xFF]));
    bus.respond_sequence(
        ENGINE,
        CI,
        false,
        vec![SimResponse::Silent, SimResponse::Data(b"ACME*E1*0001*".to_vec())],
    );
    bus.respond(AFTERTREATMENT, HOURS, SimResponse::Ack(AckKind::Nack));
    bus
}

#[test]
fn passive_read_reports_every_second() {
    let _ = env_logger::try_init();
    let catalog = ParameterCatalog::builtin();
    let decoder = CatalogDecoder::new(&catalog);
    let clock = SimulatedClock::new();
    let mut bus = SimulatedBus::new(clock.clone());
    bus.add_broadcast(ENGINE, ET1, Duration::from_secs(1), Duration::from_millis(100), &[0x78; 8]);

    let mut service = BusService::new(&mut bus, &decoder, &catalog, &clock, BusServiceOptions::default());
    let mut listener = RecordingListener::new();
    let packets = service.passive_read(Duration::from_secs(3), &mut listener).unwrap();

    assert_eq!(
        listener.progress,
        vec![
            "Reading bus for 3 seconds",
            "Reading bus for 2 seconds",
            "Reading bus for 1 seconds"
        ]
    );
    assert_eq!(packets.len(), 3);
    assert!(packets.windows(2).all(|w| w[0].timestamp() < w[1].timestamp()));
    assert_eq!(packets[0].value_of(110), Some(&SpnValue::Value(80.0)));
    assert!(bus.sent_frames().is_empty());
}

#[test]
fn request_progress_lines() {
    let _ = env_logger::try_init();
    let catalog = ParameterCatalog::builtin();
    let decoder = CatalogDecoder::new(&catalog);
    let clock = SimulatedClock::new();
    let mut bus = vehicle(&clock);

    let mut service = BusService::new(&mut bus, &decoder, &catalog, &clock, BusServiceOptions::default());
    let mut listener = RecordingListener::new();
    service.global_pull(HOURS, &mut listener).unwrap();
    let ds = service.targeted_pull(CI, ENGINE, &mut listener).unwrap();

    // One line per request, the retry does not add another
    assert!(ds.retry_used);
    assert_eq!(
        listener.progress,
        vec!["Global Request for PGN 65253", "DS Request for PGN 65259 to Engine #1 (0)"]
    );
}

#[test]
fn full_sweep() {
    let _ = env_logger::try_init();
    let catalog = ParameterCatalog::builtin();
    let decoder = CatalogDecoder::new(&catalog);
    let clock = SimulatedClock::new();
    let mut bus = vehicle(&clock);
    let modules = VehicleModules::new([
        ObdModule::new(ENGINE, &[110, 92, 247, 586]),
        ObdModule::new(AFTERTREATMENT, &[247, 27]),
    ]);

    let mut service = BusService::new(&mut bus, &decoder, &catalog, &clock, BusServiceOptions::default());
    let mut listener = RecordingListener::new();
    let sweep = service
        .collect_parameters(&[110, 92, 247, 586, 27], &modules, &mut listener)
        .unwrap();

    // Passive read lasts for the slowest broadcast in the catalog
    assert_eq!(listener.progress[0], "Reading bus for 10 seconds");
    assert_eq!(sweep.broadcast.iter().filter(|p| p.pgn() == ET1).count(), 10);

    // SPNs 110 and 92 were broadcast, so only the rest are requested globally
    assert_eq!(sweep.global.keys().copied().collect::<Vec<_>>(), vec![EEC7, HOURS, CI]);
    assert!(sweep.global[&EEC7].is_silent());
    assert_eq!(sweep.global[&HOURS].packets.len(), 1);
    assert_eq!(sweep.global[&HOURS].acks.len(), 1);

    // Engine only still owes CI, the aftertreatment ECU owes everything
    assert_eq!(
        sweep.targeted.keys().copied().collect::<Vec<_>>(),
        vec![(ENGINE, CI), (AFTERTREATMENT, EEC7), (AFTERTREATMENT, HOURS)]
    );
    assert!(sweep.targeted[&(ENGINE, CI)].retry_used);
    assert_eq!(
        sweep.value_of(ENGINE, 586),
        Some(&SpnValue::Text("ACME".into()))
    );
    assert_eq!(sweep.value_of(ENGINE, 247), Some(&SpnValue::Value(500.0)));

    assert_eq!(
        sweep.findings,
        vec![
            QueryFinding::RetryRequired { pgn: CI, address: ENGINE },
            QueryFinding::RetryExhausted { pgn: EEC7, address: AFTERTREATMENT },
            QueryFinding::NoResponse { pgn: EEC7, address: AFTERTREATMENT },
            QueryFinding::NegativeAcknowledged { pgn: HOURS, address: AFTERTREATMENT },
        ]
    );
    assert_eq!(sweep.unresolved[&ENGINE], Vec::<u32>::new());
    assert_eq!(sweep.unresolved[&AFTERTREATMENT], vec![247, 27]);
    assert!(!sweep.is_complete());

    service.report_findings(&sweep.findings, &mut listener, 1, 12);
    assert_eq!(listener.outcomes_of(Outcome::Fail).len(), 1);
    assert_eq!(
        listener.outcomes_of(Outcome::Fail)[0].message,
        "6.1.12 - No response from Exhaust Emission Controller (61) for PGN 64916"
    );
    assert_eq!(listener.outcomes_of(Outcome::Info).len(), 1);
    assert_eq!(listener.outcomes_of(Outcome::Warn).len(), 2);

    // 3 global requests, 1 + retry to the engine, 2 + retry to the aftertreatment ECU
    assert_eq!(bus.sent_frames().len(), 8);
}

#[test]
fn denied_and_busy_are_warnings() {
    let _ = env_logger::try_init();
    let catalog = ParameterCatalog::builtin();
    let decoder = CatalogDecoder::new(&catalog);
    let clock = SimulatedClock::new();
    let mut bus = SimulatedBus::new(clock.clone());
    bus.respond(ENGINE, HOURS, SimResponse::Ack(AckKind::Denied));
    bus.respond(ENGINE, CI, SimResponse::Ack(AckKind::Busy));
    let modules = VehicleModules::new([ObdModule::new(ENGINE, &[247, 586])]);

    let mut service = BusService::new(&mut bus, &decoder, &catalog, &clock, BusServiceOptions::default());
    let mut listener = RecordingListener::new();
    let sweep = service.collect_parameters(&[247, 586], &modules, &mut listener).unwrap();

    assert_eq!(
        sweep.findings,
        vec![
            QueryFinding::Denied { pgn: HOURS, address: ENGINE },
            QueryFinding::Busy { pgn: CI, address: ENGINE },
        ]
    );
    // Neither answer is repeated
    assert!(!sweep.targeted[&(ENGINE, HOURS)].retry_used);
    assert!(!sweep.targeted[&(ENGINE, CI)].retry_used);
    assert_eq!(sweep.unresolved[&ENGINE], vec![247, 586]);

    service.report_findings(&sweep.findings, &mut listener, 1, 12);
    assert_eq!(listener.outcomes_of(Outcome::Warn).len(), 2);
    assert_eq!(
        listener.results,
        vec![
            "6.1.12 - Engine #1 (0) denied access to PGN 65253",
            "6.1.12 - Engine #1 (0) responded busy to PGN 65259"
        ]
    );
    // 2 global requests, 2 DS requests
    assert_eq!(bus.sent_frames().len(), 4);
}

#[test]
fn malformed_ds_response_is_retried_then_exhausted() {
    let _ = env_logger::try_init();
    let catalog = ParameterCatalog::builtin();
    let decoder = CatalogDecoder::new(&catalog);
    let clock = SimulatedClock::new();
    let mut bus = SimulatedBus::new(clock.clone());
    // HOURS needs 8 bytes
    bus.respond_sequence(ENGINE, HOURS, false, vec![SimResponse::Data(vec![0x10, 0x27])]);
    let modules = VehicleModules::new([ObdModule::new(ENGINE, &[247])]);

    let mut service = BusService::new(&mut bus, &decoder, &catalog, &clock, BusServiceOptions::default());
    let mut listener = RecordingListener::new();
    let sweep = service.collect_parameters(&[247], &modules, &mut listener).unwrap();

    assert_eq!(sweep.findings.len(), 4);
    for finding in &sweep.findings[..2] {
        assert!(matches!(
            finding,
            QueryFinding::MalformedFrame { pgn: HOURS, address: ENGINE, .. }
        ));
    }
    assert_eq!(sweep.findings[2], QueryFinding::RetryExhausted { pgn: HOURS, address: ENGINE });
    assert_eq!(sweep.findings[3], QueryFinding::NoResponse { pgn: HOURS, address: ENGINE });
    assert!(sweep.targeted[&(ENGINE, HOURS)].is_silent());
    assert_eq!(sweep.targeted[&(ENGINE, HOURS)].malformed.len(), 2);

    service.report_findings(&sweep.findings, &mut listener, 1, 12);
    assert_eq!(listener.outcomes_of(Outcome::Warn).len(), 3);
    assert_eq!(listener.outcomes_of(Outcome::Fail).len(), 1);
}

#[test]
fn passive_read_skips_malformed_frames() {
    let _ = env_logger::try_init();
    let catalog = ParameterCatalog::builtin();
    let decoder = CatalogDecoder::new(&catalog);
    let clock = SimulatedClock::new();
    let mut bus = SimulatedBus::new(clock.clone());
    bus.add_broadcast(ENGINE, ET1, Duration::from_secs(1), Duration::ZERO, &[0x78; 8]);
    bus.inject(J1939Id::new(6, HOURS, None, ENGINE), &[0x10, 0x27], Duration::from_millis(1500));

    let mut service = BusService::new(&mut bus, &decoder, &catalog, &clock, BusServiceOptions::default());
    let mut listener = RecordingListener::new();
    let packets = service.passive_read(Duration::from_secs(3), &mut listener).unwrap();

    assert_eq!(packets.len(), 3);
    assert!(packets.iter().all(|p| p.pgn() == ET1));
    assert_eq!(listener.progress.len(), 3);
}

#[test]
fn global_and_ds_disagree() {
    let _ = env_logger::try_init();
    let catalog = ParameterCatalog::builtin();
    let decoder = CatalogDecoder::new(&catalog);
    let clock = SimulatedClock::new();
    let mut bus = SimulatedBus::new(clock.clone());
    bus.respond_sequence(
        ENGINE,
        CI,
        true,
        vec![
            SimResponse::Data(b"ACME*E1*0001*".to_vec()),
            SimResponse::Data(b"ACME*E1*0002*".to_vec()),
        ],
    );
    bus.respond(0x01, CI, SimResponse::Ack(AckKind::Nack));
    let modules = VehicleModules::new([ObdModule::new(ENGINE, &[588]), ObdModule::new(0x01, &[588])]);

    let mut service = BusService::new(&mut bus, &decoder, &catalog, &clock, BusServiceOptions::default());
    let mut listener = RecordingListener::new();
    let findings = service.compare_global_and_ds(CI, &modules, &mut listener).unwrap();

    assert_eq!(
        findings,
        vec![
            QueryFinding::InconsistentResponse {
                pgn: CI,
                address: ENGINE,
                spn: 588,
                expected: SpnValue::Text("0001".into()),
                received: SpnValue::Text("0002".into()),
            },
            QueryFinding::NegativeAcknowledged { pgn: CI, address: 0x01 },
        ]
    );

    service.report_findings(&findings, &mut listener, 1, 4);
    assert_eq!(
        listener.results[0],
        "6.1.4 - Difference in SPN 588 of PGN 65259 from Engine #1 (0): 0001 vs DS 0002"
    );
    assert_eq!(listener.outcomes[0].outcome, Outcome::Fail);
}

#[test]
fn late_broadcast_is_reported() {
    let _ = env_logger::try_init();
    let catalog = ParameterCatalog::builtin();
    let decoder = CatalogDecoder::new(&catalog);
    let clock = SimulatedClock::new();
    let mut bus = SimulatedBus::new(clock.clone());
    bus.add_broadcast_at(ENGINE, ET1, &[Duration::ZERO, Duration::from_millis(3100)], &[0x78; 8]);
    bus.add_broadcast(0x01, ET1, Duration::from_secs(1), Duration::ZERO, &[0x78; 8]);

    let mut service = BusService::new(&mut bus, &decoder, &catalog, &clock, BusServiceOptions::default());
    let mut listener = RecordingListener::new();
    let packets = service.passive_read(Duration::from_secs(4), &mut listener).unwrap();

    let validator = service.validator();
    let engine = validator.group_by_pgn_and_node(&packets, ENGINE);
    let violations = validator.report_period(&engine, ENGINE, &mut listener, 1, 13);
    assert_eq!(violations.len(), 1);
    assert_eq!(violations[0].pgn, ET1);
    assert_eq!(violations[0].source, ENGINE);

    let other = validator.group_by_pgn_and_node(&packets, 0x01);
    assert!(validator.report_period(&other, 0x01, &mut listener, 1, 13).is_empty());

    let fails = listener.outcomes_of(Outcome::Fail);
    assert_eq!(fails.len(), 1);
    assert!(fails[0].message.contains("PGN 65262"));
    assert!(fails[0].message.contains("Engine #1 (0)"));
}

#[test]
fn stop_flag_aborts_sweep() {
    let _ = env_logger::try_init();
    let catalog = ParameterCatalog::builtin();
    let decoder = CatalogDecoder::new(&catalog);
    let clock = SimulatedClock::new();
    let mut bus = vehicle(&clock);
    let modules = VehicleModules::new([ObdModule::new(ENGINE, &[247])]);

    let mut service = BusService::new(&mut bus, &decoder, &catalog, &clock, BusServiceOptions::default());
    service.stop_flag().store(true, Ordering::Relaxed);
    let mut listener = RecordingListener::new();
    let res = service.collect_parameters(&[247], &modules, &mut listener);
    assert!(matches!(res, Err(J1939Error::Aborted)));
    assert!(listener.progress.is_empty());
}

#[test]
fn on_request_set_is_configurable() {
    let _ = env_logger::try_init();
    let catalog = ParameterCatalog::builtin();
    let decoder = CatalogDecoder::new(&catalog);
    let clock = SimulatedClock::new();
    let mut bus = SimulatedBus::new(clock.clone());
    let options = BusServiceOptions {
        on_request_pgns: vec![EEC2],
        ..Default::default()
    };

    let service = BusService::new(&mut bus, &decoder, &catalog, &clock, options);
    assert_eq!(service.pgns_needing_request(&[92, 247]), vec![HOURS]);
}
