//! End-to-end motion scenarios: moves go in through the command source,
//! step pulses come out of the simulated platform.

use kiln::config::{Config, DRIVES};
use kiln::hardware::SimPlatform;
use kiln::motion::{MoveQueue, RequestedMove};
use kiln::printer::Printer;

fn make_printer() -> Printer<SimPlatform, MoveQueue> {
    let config = Config::default();
    let mut platform = SimPlatform::new(&config);
    platform.record_steps(true);
    Printer::new(&config, platform, MoveQueue::new())
}

fn xyz_move(x: f64, y: f64, z: f64, feed: f64, check_endstops: bool) -> RequestedMove {
    let mut end_point = [0.0; DRIVES];
    end_point[0] = x;
    end_point[1] = y;
    end_point[2] = z;
    RequestedMove { end_point, feed_rate: feed, check_endstops }
}

/// Step times for one drive, in firing order.
fn step_times(printer: &Printer<SimPlatform, MoveQueue>, drive: usize) -> Vec<f64> {
    printer
        .platform()
        .events()
        .iter()
        .filter(|e| e.drive == drive)
        .map(|e| e.time)
        .collect()
}

#[test]
fn single_move_emits_exact_step_count() {
    let mut printer = make_printer();
    printer.source_mut().push(xyz_move(10.0, 0.0, 0.0, 200.0, false));
    assert!(printer.run_until_idle(100_000));

    let counts = printer.platform().step_counts();
    assert_eq!(counts[0], 800);
    for drive in 1..DRIVES {
        assert_eq!(counts[drive], 0, "drive {drive} stepped");
    }

    let live = printer.motion().live_coordinates();
    assert!((live[0] - 10.0).abs() < 1e-9);
}

#[test]
fn short_move_runs_as_a_triangle_profile() {
    // 10 mm at a requested 200 mm/s with 1000 mm/s^2 available: the
    // profile peaks at sqrt(a*d) = 100 mm/s and takes about 0.2 s.
    let mut printer = make_printer();
    printer.source_mut().push(xyz_move(10.0, 0.0, 0.0, 200.0, false));
    assert!(printer.run_until_idle(100_000));

    let times = step_times(&printer, 0);
    assert_eq!(times.len(), 800);
    let duration = times.last().unwrap() - times.first().unwrap();
    assert!(duration > 0.15 && duration < 0.25, "duration {duration}");

    // Peak implied velocity stays at or under the requested feedrate and
    // comes close to the 100 mm/s triangle peak.
    let step_mm = 1.0 / 80.0;
    let mut peak: f64 = 0.0;
    for pair in times.windows(2) {
        let dt = pair[1] - pair[0];
        assert!(dt > 0.0);
        peak = peak.max(step_mm / dt);
    }
    assert!(peak <= 200.0 * 1.05, "peak {peak}");
    assert!(peak > 85.0, "peak {peak}");
}

#[test]
fn colinear_moves_keep_speed_through_the_junction() {
    let mut printer = make_printer();
    printer.source_mut().push(xyz_move(10.0, 0.0, 0.0, 200.0, false));
    printer.source_mut().push(xyz_move(20.0, 0.0, 0.0, 200.0, false));
    assert!(printer.run_until_idle(200_000));

    let counts = printer.platform().step_counts();
    assert_eq!(counts[0], 1600);

    // The carriage is still at speed on both sides of the segment
    // boundary: no deceleration to the floor between the two moves.
    // (The hand-off itself costs one standby timer period, so measure
    // within each segment rather than across the gap.)
    let times = step_times(&printer, 0);
    let step_mm = 1.0 / 80.0;
    let exit_velocity = step_mm / (times[799] - times[798]);
    let entry_velocity = step_mm / (times[802] - times[801]);
    assert!(exit_velocity > 100.0, "exit velocity {exit_velocity}");
    assert!(entry_velocity > 100.0, "entry velocity {entry_velocity}");
    assert!((exit_velocity - entry_velocity).abs() < 20.0);
}

#[test]
fn right_angle_junction_decelerates_to_the_floor() {
    let mut printer = make_printer();
    printer.source_mut().push(xyz_move(10.0, 0.0, 0.0, 200.0, false));
    printer.source_mut().push(xyz_move(10.0, 10.0, 0.0, 200.0, false));
    assert!(printer.run_until_idle(200_000));

    let counts = printer.platform().step_counts();
    assert_eq!(counts[0], 800);
    assert_eq!(counts[1], 800);

    // Moves execute strictly in order.
    let x_times = step_times(&printer, 0);
    let y_times = step_times(&printer, 1);
    assert!(y_times.first().unwrap() >= x_times.last().unwrap());

    // Into the corner the speed has fallen to the instant-Dv floor of
    // the junction pair (15 mm/s for X/Y here).
    let step_mm = 1.0 / 80.0;
    let corner_dt = x_times[799] - x_times[798];
    let corner_velocity = step_mm / corner_dt;
    assert!(corner_velocity < 25.0, "corner velocity {corner_velocity}");
    assert!(corner_velocity > 5.0, "corner velocity {corner_velocity}");
}

#[test]
fn low_endstop_preempts_a_homing_move() {
    let mut printer = make_printer();
    // The machine thinks it is at Z=10; the probe trips at the
    // configured stop height of 0.7 mm.
    let mut positions = [0.0; DRIVES + 1];
    positions[2] = 10.0;
    printer.motion_mut().set_positions(&positions);
    printer.platform_mut().set_position_mm(2, 10.0);
    printer.platform_mut().set_low_trigger(2, Some(0.7));

    printer.source_mut().push(xyz_move(0.0, 0.0, -100.0, 4.0, true));
    assert!(printer.run_until_idle(500_000));

    // (10 - 0.7) mm at 400 steps/mm, then the rest was discarded.
    let counts = printer.platform().step_counts();
    assert_eq!(counts[2], 3720);
    let live = printer.motion().live_coordinates();
    assert!((live[2] - 0.7).abs() < 1e-9);
    assert!(printer.motion().axis_is_homed(2));
}

#[test]
fn probing_records_the_bed_height() {
    let mut printer = make_printer();
    let mut positions = [0.0; DRIVES + 1];
    positions[2] = 5.0;
    printer.motion_mut().set_positions(&positions);
    printer.platform_mut().set_position_mm(2, 5.0);
    // The probe triggers 0.7 mm (the configured stop height) above a bed
    // bump sitting at 0.6 mm.
    printer.platform_mut().set_low_trigger(2, Some(1.3));
    printer.motion_mut().set_axis_is_homed(2, true);
    printer.motion_mut().set_z_probing(true);

    printer.source_mut().push(xyz_move(0.0, 0.0, -10.0, 2.0, true));
    assert!(printer.run_until_idle(500_000));

    assert!((printer.motion().last_probed_z() - 0.6).abs() < 0.01);
    let live = printer.motion().live_coordinates();
    assert!((live[2] - 1.3).abs() < 0.01);
}

#[test]
fn bed_compensation_shifts_machine_z() {
    let mut printer = make_printer();
    {
        let transform = printer.motion_mut().transform_mut();
        transform.set_x_bed_probe_point(0, 0.0);
        transform.set_y_bed_probe_point(0, 0.0);
        transform.set_z_bed_probe_point(0, 0.0);
        transform.set_x_bed_probe_point(1, 100.0);
        transform.set_y_bed_probe_point(1, 0.0);
        transform.set_z_bed_probe_point(1, 0.5);
        transform.set_x_bed_probe_point(2, 0.0);
        transform.set_y_bed_probe_point(2, 100.0);
        transform.set_z_bed_probe_point(2, -0.2);
        transform.set_probed_bed_equation();
    }

    printer.source_mut().push(xyz_move(50.0, 50.0, 5.0, 100.0, false));
    assert!(printer.run_until_idle(500_000));

    // Machine Z carries the plane offset: 5 + 0.25 - 0.10 = 5.15 mm.
    assert!((printer.platform().position_mm(2) - 5.15).abs() < 0.01);
    // Reported user coordinates have it taken back out.
    let live = printer.motion().live_coordinates();
    assert!((live[2] - 5.0).abs() < 0.01);

    // Cancelling compensation takes effect from the next move on.
    printer.motion_mut().set_identity_transform();
    printer.source_mut().push(xyz_move(60.0, 50.0, 5.0, 100.0, false));
    assert!(printer.run_until_idle(500_000));
    assert!((printer.platform().position_mm(2) - 5.0).abs() < 0.01);
    let live = printer.motion().live_coordinates();
    assert!((live[2] - 5.0).abs() < 0.01);
}

#[test]
fn extrusion_steps_alongside_the_axes() {
    let mut printer = make_printer();
    let mut end_point = [0.0; DRIVES];
    end_point[0] = 10.0;
    end_point[3] = 0.5; // relative extruder delta
    printer.source_mut().push(RequestedMove { end_point, feed_rate: 40.0, check_endstops: false });
    assert!(printer.run_until_idle(200_000));

    let counts = printer.platform().step_counts();
    assert_eq!(counts[0], 800);
    assert_eq!(counts[3], 210);

    // A second identical move extrudes the same amount again: the
    // extruder slot is a delta, not an absolute target.
    printer.source_mut().push(RequestedMove {
        end_point: {
            let mut ep = [0.0; DRIVES];
            ep[0] = 20.0;
            ep[3] = 0.5;
            ep
        },
        feed_rate: 40.0,
        check_endstops: false,
    });
    assert!(printer.run_until_idle(200_000));
    assert_eq!(printer.platform().step_counts()[3], 420);
}
