//! Compiled in subset of the J1939 digital annex covering the parameter
//! groups used by the J1939-84 OBD procedures

use super::{Classification, PgnDefinition, SlotEncoding, SpnSlot};

fn num(spn: u32, label: &str, start_bit: u16, bit_length: u8, resolution: f64, offset: f64) -> SpnSlot {
    SpnSlot {
        spn,
        label: label.into(),
        encoding: SlotEncoding::Numeric {
            start_bit,
            bit_length,
            resolution,
            offset,
        },
    }
}

fn ascii(spn: u32, label: &str, start_byte: u16, field: u8) -> SpnSlot {
    SpnSlot {
        spn,
        label: label.into(),
        encoding: SlotEncoding::Ascii { start_byte, field },
    }
}

fn periodic(id: u32, acronym: &str, label: &str, rate_ms: u32, slots: Vec<SpnSlot>) -> PgnDefinition {
    PgnDefinition {
        id,
        label: label.into(),
        acronym: acronym.into(),
        classification: Classification::PeriodicBroadcast,
        transmission_rate_ms: Some(rate_ms),
        slots,
    }
}

fn on_request(id: u32, acronym: &str, label: &str, slots: Vec<SpnSlot>) -> PgnDefinition {
    PgnDefinition {
        id,
        label: label.into(),
        acronym: acronym.into(),
        classification: Classification::OnRequestOnly,
        transmission_rate_ms: None,
        slots,
    }
}

// Temperatures with 1 degree resolution start at -40, extended ones at -273
const T8: f64 = -40.0;
const T16: f64 = -273.0;

pub(super) fn definitions() -> Vec<PgnDefinition> {
    vec![
        on_request(3072, "EAI", "Engine Auxiliary Information", vec![
            num(20, "Engine Auxiliary Shutdown Request", 0, 8, 1.0, 0.0),
        ]),
        periodic(61443, "EEC2", "Electronic Engine Controller 2", 50, vec![
            num(91, "Accelerator Pedal Position 1", 8, 8, 0.4, 0.0),
            num(92, "Engine Percent Load At Current Speed", 16, 8, 1.0, 0.0),
        ]),
        periodic(61444, "EEC1", "Electronic Engine Controller 1", 20, vec![
            num(513, "Actual Engine - Percent Torque", 16, 8, 1.0, -125.0),
            num(190, "Engine Speed", 24, 16, 0.125, 0.0),
        ]),
        periodic(64916, "EEC7", "Electronic Engine Controller 7", 100, vec![
            num(27, "Engine Exhaust Gas Recirculation 1 Valve Position", 0, 16, 0.0025, 0.0),
        ]),
        on_request(64965, "ECUID", "ECU Identification Information", vec![
            ascii(2901, "ECU Part Number", 0, 0),
            ascii(2902, "ECU Serial Number", 0, 1),
            ascii(2903, "ECU Location", 0, 2),
            ascii(2904, "ECU Type", 0, 3),
        ]),
        periodic(65172, "EAC", "Engine Auxiliary Coolant", 500, vec![
            num(1203, "Engine Auxiliary Coolant Pressure", 0, 8, 4.0, 0.0),
            num(1212, "Engine Auxiliary Coolant Temperature", 8, 8, 1.0, T8),
        ]),
        periodic(65198, "AIR1", "Air Supply Pressure", 1000, vec![
            num(46, "Pneumatic Supply Pressure", 0, 8, 8.0, 0.0),
        ]),
        periodic(65226, "DM1", "Active Diagnostic Trouble Codes", 1000, vec![
            num(987, "Protect Lamp Status", 0, 2, 1.0, 0.0),
            num(624, "Amber Warning Lamp Status", 2, 2, 1.0, 0.0),
            num(623, "Red Stop Lamp Status", 4, 2, 1.0, 0.0),
            num(1213, "Malfunction Indicator Lamp Status", 6, 2, 1.0, 0.0),
        ]),
        on_request(65230, "DM5", "Diagnostic Readiness 1", vec![
            num(1218, "Active Trouble Code Count", 0, 8, 1.0, 0.0),
            num(1219, "Previously Active Trouble Code Count", 8, 8, 1.0, 0.0),
            num(1220, "OBD Compliance", 16, 8, 1.0, 0.0),
        ]),
        on_request(65242, "SOFT", "Software Identification", vec![
            num(965, "Number of Software Identification Fields", 0, 8, 1.0, 0.0),
            ascii(234, "Software Identification", 1, 0),
        ]),
        on_request(65253, "HOURS", "Engine Hours, Revolutions", vec![
            num(247, "Engine Total Hours of Operation", 0, 32, 0.05, 0.0),
            num(249, "Engine Total Revolutions", 32, 32, 1000.0, 0.0),
        ]),
        on_request(65257, "LFC", "Fuel Consumption (Liquid)", vec![
            num(182, "Engine Trip Fuel", 0, 32, 0.5, 0.0),
            num(250, "Engine Total Fuel Used", 32, 32, 0.5, 0.0),
        ]),
        on_request(65259, "CI", "Component Identification", vec![
            ascii(586, "Make", 0, 0),
            ascii(587, "Model", 0, 1),
            ascii(588, "Serial Number", 0, 2),
        ]),
        on_request(65260, "VI", "Vehicle Identification", vec![
            ascii(237, "Vehicle Identification Number", 0, 0),
        ]),
        periodic(65262, "ET1", "Engine Temperature 1", 1000, vec![
            num(110, "Engine Coolant Temperature", 0, 8, 1.0, T8),
            num(174, "Engine Fuel Temperature 1", 8, 8, 1.0, T8),
            num(175, "Engine Oil Temperature 1", 16, 16, 0.03125, T16),
        ]),
        periodic(65263, "EFL/P1", "Engine Fluid Level/Pressure 1", 500, vec![
            num(94, "Engine Fuel Delivery Pressure", 0, 8, 4.0, 0.0),
            num(22, "Engine Extended Crankcase Blow-by Pressure", 8, 8, 0.05, 0.0),
            num(98, "Engine Oil Level", 16, 8, 0.4, 0.0),
            num(100, "Engine Oil Pressure", 24, 8, 4.0, 0.0),
            num(101, "Engine Crankcase Pressure", 32, 16, 0.0078125, -250.0),
            num(109, "Engine Coolant Pressure", 48, 8, 2.0, 0.0),
            num(111, "Engine Coolant Level", 56, 8, 0.4, 0.0),
        ]),
        periodic(65264, "PTO", "Power Takeoff Information", 100, vec![
            num(90, "Power Takeoff Oil Temperature", 0, 8, 1.0, T8),
            num(186, "Power Takeoff Speed", 8, 16, 0.125, 0.0),
        ]),
        periodic(65265, "CCVS", "Cruise Control/Vehicle Speed", 100, vec![
            num(70, "Parking Brake Switch", 2, 2, 1.0, 0.0),
            num(84, "Wheel-Based Vehicle Speed", 8, 16, 0.00390625, 0.0),
            num(86, "Cruise Control Set Speed", 40, 8, 1.0, 0.0),
        ]),
        periodic(65266, "LFE", "Fuel Economy (Liquid)", 100, vec![
            num(183, "Engine Fuel Rate", 0, 16, 0.05, 0.0),
            num(184, "Engine Instantaneous Fuel Economy", 16, 16, 0.001953125, 0.0),
            num(51, "Engine Throttle Valve 1 Position", 48, 8, 0.4, 0.0),
        ]),
        periodic(65269, "AMB", "Ambient Conditions", 1000, vec![
            num(108, "Barometric Pressure", 0, 8, 0.5, 0.0),
            num(170, "Cab Interior Temperature", 8, 16, 0.03125, T16),
            num(171, "Ambient Air Temperature", 24, 16, 0.03125, T16),
            num(172, "Engine Air Inlet Temperature", 40, 8, 1.0, T8),
            num(79, "Road Surface Temperature", 48, 16, 0.03125, T16),
        ]),
        periodic(65270, "IC1", "Inlet/Exhaust Conditions 1", 500, vec![
            num(81, "Aftertreatment 1 Diesel Particulate Filter Intake Pressure", 0, 8, 0.5, 0.0),
            num(102, "Engine Intake Manifold #1 Pressure", 8, 8, 2.0, 0.0),
            num(105, "Engine Intake Manifold 1 Temperature", 16, 8, 1.0, T8),
            num(106, "Engine Air Inlet Pressure", 24, 8, 2.0, 0.0),
            num(107, "Engine Air Filter 1 Differential Pressure", 32, 8, 0.05, 0.0),
            num(173, "Engine Exhaust Temperature", 40, 16, 0.03125, T16),
            num(112, "Engine Coolant Filter Differential Pressure", 56, 8, 0.5, 0.0),
        ]),
        periodic(65273, "ECI2", "Engine Coolant Information 2", 500, vec![
            num(88, "Engine Coolant Pump Differential Pressure", 0, 8, 0.5, 0.0),
        ]),
        periodic(65276, "DD", "Dash Display", 1000, vec![
            num(80, "Washer Fluid Level", 0, 8, 0.4, 0.0),
            num(96, "Fuel Level 1", 8, 8, 0.4, 0.0),
            num(95, "Engine Fuel Filter Differential Pressure", 16, 8, 2.0, 0.0),
            num(99, "Engine Oil Filter Differential Pressure", 24, 8, 0.5, 0.0),
            num(169, "Cargo Ambient Temperature", 32, 16, 0.03125, T16),
        ]),
        periodic(65277, "A1", "Auxiliary Blower", 500, vec![
            num(72, "Engine Blower Bypass Valve Position", 0, 8, 0.4, 0.0),
        ]),
        periodic(65278, "AWPP", "Auxiliary Water Pump Pressure", 500, vec![
            num(73, "Auxiliary Pump Pressure", 0, 8, 4.0, 0.0),
        ]),
        periodic(65279, "WFI", "Water in Fuel Indicator", 10_000, vec![
            num(97, "Water In Fuel Indicator 1", 0, 2, 1.0, 0.0),
        ]),
    ]
}
