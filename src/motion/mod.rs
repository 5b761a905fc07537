//! The motion pipeline: a look-ahead ring of planned moves feeding a ring
//! of DDA stepping slots executed from the timer interrupt.
//!
//! The foreground [`Motion::spin`] tick does a bounded amount of work:
//! plan junction and reachability velocities across the queue, transfer one
//! completed entry to the stepping ring, and pull one new move from the
//! command source. [`Motion::interrupt`] is the timer handler: it Bresenham-
//! steps the current move, integrates the velocity profile and re-arms the
//! timer with the next step interval.

pub mod dda;
pub mod lookahead;
pub mod transform;
pub mod vector;

use std::collections::VecDeque;

use crate::config::{Config, AXES, DRIVES, Z_AXIS};
use crate::hardware::{EndStopHit, Platform};

use dda::{DdaRing, MovementProfile};
use lookahead::{LookAheadRing, COMPLETE, UNPROCESSED, V_COSINE_SET};
use transform::Transform;

/// One requested move from the command source. Axis slots are absolute
/// user-frame coordinates in mm; extruder slots are relative deltas. The
/// core rejects nothing here: the source must already have expanded tool
/// moves into per-drive extrusion (see `Tool::mix_deltas`).
#[derive(Debug, Clone)]
pub struct RequestedMove {
    pub end_point: [f64; DRIVES],
    pub feed_rate: f64,
    pub check_endstops: bool,
}

/// Where moves come from. `have_incoming_data` tells the planner whether
/// more moves are likely to follow; without any, the queue is planned down
/// to a safe stop.
pub trait MoveSource {
    fn read_move(&mut self) -> Option<RequestedMove>;
    fn have_incoming_data(&self) -> bool;
}

/// A pre-filled move list, for tests and canned jobs.
#[derive(Debug, Default)]
pub struct MoveQueue {
    queue: VecDeque<RequestedMove>,
}

impl MoveQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, m: RequestedMove) {
        self.queue.push_back(m);
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl MoveSource for MoveQueue {
    fn read_move(&mut self) -> Option<RequestedMove> {
        self.queue.pop_front()
    }

    fn have_incoming_data(&self) -> bool {
        !self.queue.is_empty()
    }
}

pub struct Motion {
    look_ahead: LookAheadRing,
    dda_ring: DdaRing,
    /// Index of the move the interrupt context is stepping, if any.
    /// Touched only from the interrupt context.
    current_dda: Option<usize>,
    transform: Transform,

    steps_per_unit: [f64; DRIVES],
    instant_dvs: [f64; DRIVES],
    accelerations: [f64; DRIVES],
    max_feedrates: [f64; DRIVES],
    /// Euclidean length of a combined step, indexed by the bitmask of
    /// drives that stepped together.
    step_distances: Vec<f64>,

    /// Machine-frame coordinates at the end of the last finished move,
    /// written from the interrupt context. Plus the feedrate.
    live_coordinates: [f64; DRIVES + 1],

    look_ahead_threshold: usize,
    standby_interrupt: f64,
    add_no_more_moves: bool,
    active: bool,

    z_probing: bool,
    last_z_hit: f64,
    axes_homed: [bool; AXES],
}

impl Motion {
    pub fn new<P: Platform>(config: &Config, platform: &mut P) -> Self {
        let mut steps_per_unit = [0.0; DRIVES];
        let mut instant_dvs = [0.0; DRIVES];
        let mut accelerations = [0.0; DRIVES];
        let mut max_feedrates = [0.0; DRIVES];
        for drive in 0..DRIVES {
            steps_per_unit[drive] = platform.drive_steps_per_unit(drive);
            instant_dvs[drive] = platform.instant_dv(drive);
            accelerations[drive] = platform.acceleration(drive);
            max_feedrates[drive] = platform.max_feedrate(drive);
            platform.set_direction(drive, true);
        }

        let mut look_ahead = LookAheadRing::new(config.motion.look_ahead_ring_length);
        let slowest = platform.slowest_drive();
        look_ahead.seed_origin(
            platform.home_feedrate(slowest),
            platform.instant_dv(slowest),
            platform.max_feedrate(slowest),
            platform.acceleration(slowest),
        );

        let mut live_coordinates = [0.0; DRIVES + 1];
        live_coordinates[DRIVES] = platform.home_feedrate(slowest);

        let mut motion = Self {
            look_ahead,
            dda_ring: DdaRing::new(config.motion.dda_ring_length),
            current_dda: None,
            transform: Transform::new(platform.axis_length(0), platform.axis_length(1)),
            steps_per_unit,
            instant_dvs,
            accelerations,
            max_feedrates,
            step_distances: Vec::new(),
            live_coordinates,
            look_ahead_threshold: config.motion.look_ahead,
            standby_interrupt: config.motion.standby_interrupt,
            add_no_more_moves: false,
            active: true,
            z_probing: false,
            last_z_hit: 0.0,
            axes_homed: [false; AXES],
        };
        motion.set_step_hypotenuse();
        platform.set_interrupt(motion.standby_interrupt);
        motion
    }

    /// Tabulate the distance covered by one combined step of each subset
    /// of drives.
    fn set_step_hypotenuse(&mut self) {
        let mut distances = vec![0.0; 1 << DRIVES];
        for mask in 1..(1usize << DRIVES) {
            let mut d = 0.0;
            for drive in 0..DRIVES {
                if mask & (1 << drive) != 0 {
                    let e = 1.0 / self.steps_per_unit[drive];
                    d += e * e;
                }
            }
            distances[mask] = d.sqrt();
        }
        // Never used when nothing moved, but keep it nonzero just in case.
        distances[0] = 1.0 / self.steps_per_unit[AXES];
        self.step_distances = distances;
    }

    /// One cooperative tick: plan, hand one move to the stepping ring, and
    /// pull one new move from the source. Never blocks.
    pub fn spin<P: Platform, S: MoveSource>(&mut self, platform: &mut P, source: &mut S) {
        if !self.active {
            return;
        }

        self.do_look_ahead(platform, source.have_incoming_data());

        // Move a completed entry over to the stepping ring, and retire
        // slots the interrupt context has finished with.
        if self.dda_ring.try_lock() {
            self.dda_ring.reclaim();
            if !self.dda_ring.is_full() {
                if let Some(index) = self.look_ahead.take_completed() {
                    let slot = self.dda_ring.add;
                    if self.dda_ring.slots[slot].is_active() {
                        tracing::warn!("Attempt to overwrite an active stepping slot");
                    } else {
                        let previous = self.look_ahead.prev(index);
                        let prepared = dda::prepare(
                            self.look_ahead.entry(index),
                            self.look_ahead.entry(previous),
                            &self.steps_per_unit,
                        );
                        match prepared.plan {
                            Some(plan) => {
                                self.dda_ring.slots[slot].load(&plan, index);
                                self.dda_ring.slots[slot].publish();
                                self.dda_ring.add = self.dda_ring.next(slot);
                            }
                            None => self.look_ahead.entry(index).release(),
                        }
                    }
                }
            }
            self.dda_ring.unlock();
        }

        if self.add_no_more_moves || self.look_ahead.is_full() {
            return;
        }

        if let Some(requested) = source.read_move() {
            let isolated = !source.have_incoming_data();
            self.ingest(requested, isolated);
        }
    }

    /// Transform a requested move into machine coordinates, derive its
    /// feasible-speed envelope and append it to the look-ahead ring.
    fn ingest(&mut self, requested: RequestedMove, isolated: bool) {
        let mut next_move = requested.end_point;
        self.transform.apply(&mut next_move);

        let mut machine = [0i64; DRIVES];
        let mut direction = [0.0f64; DRIVES];
        let mut no_move = true;
        let last = self.look_ahead.last;
        for drive in 0..DRIVES {
            machine[drive] = (next_move[drive] * self.steps_per_unit[drive]).round() as i64;
            if drive < AXES {
                if machine[drive] != self.look_ahead.entry(last).end_point()[drive] {
                    no_move = false;
                }
                direction[drive] = next_move[drive]
                    - self.look_ahead.entry(last).machine_to_end_point(drive, &self.steps_per_unit);
            } else {
                if machine[drive] != 0 {
                    no_move = false;
                }
                direction[drive] = next_move[drive];
            }
        }

        if no_move {
            return;
        }

        vector::absolute(&mut direction);
        if vector::normalise(&mut direction).is_none() {
            tracing::warn!("Attempt to normalise a zero-length move");
            return;
        }

        let min_speed = vector::box_intersection(&direction, &self.instant_dvs);
        let acceleration = vector::box_intersection(&direction, &self.accelerations);
        let max_speed = vector::box_intersection(&direction, &self.max_feedrates);

        if !self.look_ahead.add_move(
            machine,
            requested.feed_rate,
            min_speed,
            max_speed,
            acceleration,
            requested.check_endstops,
            isolated,
        ) {
            tracing::warn!("Can't add to a non-full look-ahead ring");
        }
    }

    /// The planner passes. Junction cosines first set each new entry's
    /// exit velocity; the up/down reachability passes then shave entry and
    /// exit velocities until every segment fits its own acceleration.
    fn do_look_ahead<P: Platform>(&mut self, platform: &P, have_incoming: bool) {
        if self.look_ahead.is_empty() {
            return;
        }

        if self.add_no_more_moves || !have_incoming || self.look_ahead.count > 1 {
            // Set the end speed of each new entry from the junction angle
            // to its successor.
            let mut n1 = self.look_ahead.get;
            let mut n2 = self.look_ahead.next(n1);
            while n2 != self.look_ahead.add {
                if self.look_ahead.entry(n1).processed() == UNPROCESSED {
                    let cosine = self.look_ahead.cosine(n1, &self.steps_per_unit);
                    let c = self.look_ahead.entry(n1).v() * cosine;
                    let floor = self
                        .look_ahead
                        .entry(n1)
                        .min_speed()
                        .min(self.look_ahead.entry(n2).min_speed());
                    self.look_ahead.entry_mut(n1).set_v(c.max(floor));
                    self.look_ahead.entry(n1).set_processed(V_COSINE_SET);
                }
                n1 = n2;
                n2 = self.look_ahead.next(n2);
            }

            // With nothing more coming, the final move must run down to a
            // speed any follow-up could start from.
            if self.add_no_more_moves || !have_incoming {
                let stop = platform.instant_dv(platform.slowest_drive());
                self.look_ahead.entry_mut(n1).set_v(stop);
                self.look_ahead.entry(n1).set_processed(COMPLETE);
            }
        }

        let planning_due = self.add_no_more_moves
            || !have_incoming
            || self.look_ahead.count > self.look_ahead_threshold;

        if planning_due {
            // Run up the queue, pulling exit velocities down to what the
            // following segment can absorb.
            let mut n1 = self.look_ahead.get;
            let mut n0 = self.look_ahead.prev(n1);
            let mut n2 = self.look_ahead.next(n1);
            while n2 != self.look_ahead.add {
                self.smooth_junction(n0, n1, false);
                n0 = n1;
                n1 = n2;
                n2 = self.look_ahead.next(n2);
            }
            // And back down, marking entries complete as they freeze.
            loop {
                self.smooth_junction(n0, n1, true);
                n1 = n0;
                n0 = self.look_ahead.prev(n0);
                if n0 == self.look_ahead.get {
                    break;
                }
            }
            self.look_ahead.entry(n0).set_processed(COMPLETE);
        }
    }

    /// Dry-run the profile for `n1` entered at `n0`'s exit velocity; if
    /// the two cannot be connected within the segment, write the reduced
    /// velocities back.
    fn smooth_junction(&mut self, n0: usize, n1: usize, mark_complete: bool) {
        let state = self.look_ahead.entry(n1).processed();
        if state & COMPLETE != 0 || state & V_COSINE_SET == 0 {
            return;
        }
        let u0 = self.look_ahead.entry(n0).v();
        let v0 = self.look_ahead.entry(n1).v();
        let prepared = dda::prepare(
            self.look_ahead.entry(n1),
            self.look_ahead.entry(n0),
            &self.steps_per_unit,
        );
        if prepared.profile == MovementProfile::Change {
            if prepared.u != u0 {
                self.look_ahead.entry_mut(n0).set_v(prepared.u);
            }
            if prepared.v != v0 {
                self.look_ahead.entry_mut(n1).set_v(prepared.v);
            }
        }
        if mark_complete {
            self.look_ahead.entry(n1).set_processed(COMPLETE);
        }
    }

    /// Timer interrupt entry point: step the current move, or pick up the
    /// next published one. Re-arms the timer on every path.
    pub fn interrupt<P: Platform>(&mut self, platform: &mut P) {
        if !self.active {
            return;
        }
        if let Some(index) = self.current_dda {
            if self.dda_ring.slots[index].is_active() {
                self.step_current(index, platform);
                return;
            }
            self.current_dda = None;
        }
        let head = self.dda_ring.get;
        if head != self.dda_ring.add && self.dda_ring.slots[head].is_active() {
            self.current_dda = Some(head);
            self.dda_ring.slots[head].start(platform);
        } else {
            platform.set_interrupt(self.standby_interrupt);
        }
    }

    fn step_current<P: Platform>(&mut self, index: usize, platform: &mut P) {
        let mut moved = 0usize;
        let mut hit: Option<(usize, EndStopHit)> = None;
        {
            let dda = &mut self.dda_ring.slots[index];
            for drive in 0..DRIVES {
                dda.counter[drive] += dda.delta[drive];
                if dda.counter[drive] > 0 {
                    platform.step(drive);
                    dda.counter[drive] -= dda.total_steps;
                    moved |= 1 << drive;
                    if dda.check_endstops {
                        let stop = platform.stopped(drive);
                        if stop != EndStopHit::NoStop {
                            hit = Some((drive, stop));
                            break;
                        }
                    }
                }
            }
        }

        if let Some((drive, stop)) = hit {
            match stop {
                EndStopHit::LowHit => self.hit_low_stop(drive, index, platform),
                EndStopHit::HighHit => self.hit_high_stop(drive, index, platform),
                EndStopHit::NoStop => {}
            }
            self.dda_ring.slots[index].deactivate();
        }

        if self.dda_ring.slots[index].is_active() {
            let dda = &mut self.dda_ring.slots[index];
            // Euler integration over the distance this combined step
            // actually covered.
            dda.time_step = self.step_distances[moved] / dda.velocity;
            if dda.step_count < dda.stop_a_step {
                dda.velocity += dda.acceleration * dda.time_step;
            }
            if dda.step_count >= dda.start_d_step {
                dda.velocity -= dda.acceleration * dda.time_step;
            }
            if dda.velocity < dda.instant_dv {
                dda.velocity = dda.instant_dv;
            }
            dda.step_count += 1;
            if dda.step_count < dda.total_steps {
                platform.set_interrupt(dda.time_step);
            } else {
                dda.deactivate();
            }
        }

        if !self.dda_ring.slots[index].is_active() {
            // Publish where we ended up and hand the slot back.
            let la_index = self.dda_ring.slots[index].look_ahead_index();
            for drive in 0..DRIVES {
                self.live_coordinates[drive] = self
                    .look_ahead
                    .entry(la_index)
                    .machine_to_end_point(drive, &self.steps_per_unit);
            }
            self.live_coordinates[DRIVES] =
                self.look_ahead.entry(la_index).requested_feed_rate();
            self.look_ahead.entry(la_index).release();
            platform.set_interrupt(self.standby_interrupt);
        }
    }

    /// Machine coordinate of `drive` at the current point of a running
    /// move, interpolated from the Bresenham progress.
    fn current_interpolated_coordinate(&self, drive: usize, dda_index: usize) -> f64 {
        let dda = &self.dda_ring.slots[dda_index];
        let la_index = dda.look_ahead_index();
        let previous = self
            .look_ahead
            .entry(self.look_ahead.prev(la_index))
            .machine_to_end_point(drive, &self.steps_per_unit);
        if dda.total_steps <= 0 {
            return previous;
        }
        let target = self
            .look_ahead
            .entry(la_index)
            .machine_to_end_point(drive, &self.steps_per_unit);
        previous + (target - previous) * dda.step_count as f64 / dda.total_steps as f64
    }

    fn hit_low_stop<P: Platform>(&mut self, drive: usize, dda_index: usize, platform: &P) {
        let la_index = self.dda_ring.slots[dda_index].look_ahead_index();
        if drive == Z_AXIS {
            if self.z_probing {
                if self.axes_homed[Z_AXIS] {
                    // Probing a known bed: record where the probe fired.
                    let z = self.current_interpolated_coordinate(drive, dda_index);
                    self.look_ahead.entry_mut(la_index).set_drive_coordinate_and_zero_end_speed(
                        z,
                        drive,
                        &self.steps_per_unit,
                    );
                    self.last_z_hit = z - platform.z_probe_stop_height();
                } else {
                    // First contact doubles as homing.
                    self.look_ahead.entry_mut(la_index).set_drive_coordinate_and_zero_end_speed(
                        platform.z_probe_stop_height(),
                        drive,
                        &self.steps_per_unit,
                    );
                    self.last_z_hit = 0.0;
                    self.axes_homed[Z_AXIS] = true;
                }
                return;
            }
            self.last_z_hit = platform.z_probe_stop_height();
            self.look_ahead.entry_mut(la_index).set_drive_coordinate_and_zero_end_speed(
                platform.z_probe_stop_height(),
                drive,
                &self.steps_per_unit,
            );
            self.axes_homed[Z_AXIS] = true;
            return;
        }
        self.look_ahead.entry_mut(la_index).set_drive_coordinate_and_zero_end_speed(
            0.0,
            drive,
            &self.steps_per_unit,
        );
        if drive < AXES {
            self.axes_homed[drive] = true;
        }
    }

    fn hit_high_stop<P: Platform>(&mut self, drive: usize, dda_index: usize, platform: &P) {
        let la_index = self.dda_ring.slots[dda_index].look_ahead_index();
        let length = if drive < AXES { platform.axis_length(drive) } else { 0.0 };
        self.look_ahead.entry_mut(la_index).set_drive_coordinate_and_zero_end_speed(
            length,
            drive,
            &self.steps_per_unit,
        );
        if drive < AXES {
            self.axes_homed[drive] = true;
        }
    }

    /// Stop accepting moves and report whether everything queued has run
    /// dry. Call repeatedly; pair with [`Motion::resume_moving`].
    pub fn all_moves_are_finished(&mut self) -> bool {
        self.add_no_more_moves = true;
        self.look_ahead.is_empty() && self.no_live_movement()
    }

    pub fn resume_moving(&mut self) {
        self.add_no_more_moves = false;
    }

    fn no_live_movement(&self) -> bool {
        self.current_dda.is_none()
            && self.dda_ring.is_empty()
            && self.dda_ring.slots.iter().all(|slot| !slot.is_active())
    }

    pub fn is_idle(&self) -> bool {
        self.look_ahead.is_empty() && self.no_live_movement()
    }

    /// Machine position at the end of the last executed move, mapped back
    /// to the user frame. The trailing slot is the feedrate.
    pub fn live_coordinates(&self) -> [f64; DRIVES + 1] {
        let mut m = self.live_coordinates;
        self.transform.invert(&mut m);
        m
    }

    /// The planning position (the last appended move), user frame. `None`
    /// while the look-ahead ring is full, because the result could not be
    /// used as the basis for a next move anyway.
    pub fn current_user_position(&self) -> Option<[f64; DRIVES + 1]> {
        if self.look_ahead.is_full() {
            return None;
        }
        let last = self.look_ahead.entry(self.look_ahead.last);
        let mut m = [0.0; DRIVES + 1];
        for drive in 0..DRIVES {
            if drive < AXES {
                m[drive] = last.machine_to_end_point(drive, &self.steps_per_unit);
            }
        }
        m[DRIVES] = last.requested_feed_rate();
        self.transform.invert(&mut m);
        Some(m)
    }

    /// Overwrite the planning position without motion; used after homing.
    /// The values are machine-frame and are not transformed.
    pub fn set_positions(&mut self, positions: &[f64; DRIVES + 1]) {
        let last = self.look_ahead.last;
        for drive in 0..DRIVES {
            self.look_ahead.entry_mut(last).set_drive_coordinate_and_zero_end_speed(
                positions[drive],
                drive,
                &self.steps_per_unit,
            );
        }
        self.look_ahead.entry_mut(last).set_feed_rate(positions[DRIVES]);
    }

    pub fn set_live_coordinates(&mut self, coordinates: &[f64; DRIVES + 1]) {
        self.live_coordinates = *coordinates;
    }

    pub fn set_axis_is_homed(&mut self, axis: usize, homed: bool) {
        self.axes_homed[axis] = homed;
    }

    pub fn axis_is_homed(&self, axis: usize) -> bool {
        self.axes_homed[axis]
    }

    pub fn set_z_probing(&mut self, probing: bool) {
        self.z_probing = probing;
    }

    pub fn last_probed_z(&self) -> f64 {
        self.last_z_hit
    }

    pub fn transform(&self) -> &Transform {
        &self.transform
    }

    pub fn transform_mut(&mut self) -> &mut Transform {
        &mut self.transform
    }

    /// Cancel bed compensation; subsequent moves use the user frame's Z
    /// unmodified (the axis skew still applies).
    pub fn set_identity_transform(&mut self) {
        self.transform.set_identity();
    }

    pub fn exit<P: Platform>(&mut self, platform: &mut P) {
        for drive in 0..DRIVES {
            platform.disable(drive);
        }
        tracing::info!("Motion shut down");
        self.active = false;
    }
}

impl std::fmt::Debug for Motion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Motion")
            .field("queued", &self.look_ahead.count)
            .field("current_dda", &self.current_dda)
            .field("add_no_more_moves", &self.add_no_more_moves)
            .field("z_probing", &self.z_probing)
            .field("axes_homed", &self.axes_homed)
            .finish()
    }
}
