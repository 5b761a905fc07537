//! Per-move stepping state: the Bresenham counters, the trapezoidal
//! velocity profile, and the ring the interrupt context executes from.
//!
//! Profile preparation is split in two. [`prepare`] is a pure dry run: it
//! derives the step deltas and the accelerate/cruise/decelerate boundaries
//! for a candidate (entry velocity, exit velocity) pair, reducing whichever
//! cannot be reached within the segment. The planner calls it repeatedly
//! while smoothing the queue. [`Dda::load`] then installs a prepared
//! profile into a ring slot for execution.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::config::{AXES, DRIVES};
use crate::hardware::Platform;

use super::lookahead::LookAheadEntry;

/// Shape of the velocity profile a segment ends up with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MovementProfile {
    /// Ordinary trapezoid: accelerate, cruise, decelerate.
    Moving,
    /// Triangle: the cruise phase vanished.
    NoFlat,
    /// The requested entry and/or exit velocity had to change to fit.
    Change,
}

/// Everything [`prepare`] works out about a segment.
#[derive(Debug, Clone)]
pub struct DdaPlan {
    pub delta: [i64; DRIVES],
    pub directions: [bool; DRIVES],
    pub total_steps: i64,
    /// Euclidean length in the combined axis/extruder space, mm.
    pub distance: f64,
    pub acceleration: f64,
    pub instant_dv: f64,
    /// Master-axis step index at which acceleration stops.
    pub stop_a_step: i64,
    /// Master-axis step index at which deceleration starts.
    pub start_d_step: i64,
    pub velocity: f64,
    pub time_step: f64,
    pub check_endstops: bool,
}

/// Outcome of a dry run: the plan (absent for a null move) and the entry
/// and exit velocities, reduced where the distance could not connect them.
#[derive(Debug)]
pub struct Prepared {
    pub plan: Option<DdaPlan>,
    pub u: f64,
    pub v: f64,
    pub profile: MovementProfile,
}

/// Work out stepping and profile parameters for `entry`, entered at the
/// previous entry's exit velocity. Pure: nothing outside the return value
/// is touched.
pub fn prepare(
    entry: &LookAheadEntry,
    previous: &LookAheadEntry,
    steps_per_unit: &[f64; DRIVES],
) -> Prepared {
    let mut u = previous.v();
    let mut v = entry.v();

    let mut delta = [0i64; DRIVES];
    let mut directions = [true; DRIVES];
    let mut total_steps = 0i64;
    let mut master = 0usize;
    let mut distance = 0.0;

    for drive in 0..DRIVES {
        // Axes carry absolute targets; extruders carry the delta directly.
        let raw = if drive < AXES {
            entry.end_point()[drive] - previous.end_point()[drive]
        } else {
            entry.end_point()[drive]
        };
        let mm = raw as f64 / steps_per_unit[drive];
        distance += mm * mm;
        directions[drive] = raw >= 0;
        delta[drive] = raw.abs();
        if delta[drive] > total_steps {
            total_steps = delta[drive];
            master = drive;
        }
    }

    if total_steps <= 0 {
        tracing::debug!("Null movement reached profile preparation");
        return Prepared { plan: None, u, v, profile: MovementProfile::Moving };
    }

    let distance = distance.sqrt();
    let acceleration = entry.acceleration();
    let instant_dv = entry.min_speed();
    let feed_rate = entry.requested_feed_rate();
    let steps_per_mm = total_steps as f64 / distance;

    let mut profile = MovementProfile::Moving;

    // Where does acceleration towards the requested feedrate stop?
    let mut d = 0.5 * (feed_rate * feed_rate - u * u) / acceleration;
    let mut stop_a_step = (d * steps_per_mm).round() as i64;

    // And where must deceleration towards the exit velocity start?
    d = 0.5 * (v * v - feed_rate * feed_rate) / acceleration;
    let mut start_d_step = total_steps + (d * steps_per_mm).round() as i64;

    if stop_a_step >= start_d_step {
        // Not enough distance to reach the requested feedrate: a triangle.
        profile = MovementProfile::NoFlat;
        let mut d_cross = 0.5 * (0.5 * (v * v - u * u) / acceleration + distance);
        if d_cross < 0.0 || d_cross > distance {
            // u and v cannot even be connected within the distance.
            // Reduce the larger one to the value that exactly fits.
            profile = MovementProfile::Change;
            let reachable = 2.0 * acceleration * distance;
            if v > u {
                v = (u * u + reachable).sqrt();
                d_cross = distance;
            } else {
                u = (v * v + reachable).sqrt();
                d_cross = 0.0;
            }
        }
        stop_a_step = (d_cross * steps_per_mm) as i64;
        start_d_step = stop_a_step + 1;
    } else if total_steps > 5 && stop_a_step <= 1 && start_d_step >= total_steps - 1 {
        // Reaching speed within a single step makes the Euler integration
        // produce silly velocities; run the whole move at the feedrate.
        profile = MovementProfile::Change;
        u = feed_rate;
        v = feed_rate;
        stop_a_step = 0;
        start_d_step = total_steps;
    }

    let velocity = if u > instant_dv { u } else { instant_dv };
    let time_step = 1.0 / (steps_per_unit[master] * velocity);

    Prepared {
        plan: Some(DdaPlan {
            delta,
            directions,
            total_steps,
            distance,
            acceleration,
            instant_dv,
            stop_a_step,
            start_d_step,
            velocity,
            time_step,
            check_endstops: entry.check_endstops(),
        }),
        u,
        v,
        profile,
    }
}

/// One slot of the stepping ring. The foreground loads and publishes it;
/// the interrupt context steps it and clears `active` when done.
#[derive(Debug)]
pub struct Dda {
    look_ahead_index: usize,
    pub(crate) counter: [i64; DRIVES],
    pub(crate) delta: [i64; DRIVES],
    directions: [bool; DRIVES],
    pub(crate) total_steps: i64,
    pub(crate) step_count: i64,
    pub(crate) check_endstops: bool,
    pub(crate) time_step: f64,
    pub(crate) velocity: f64,
    pub(crate) stop_a_step: i64,
    pub(crate) start_d_step: i64,
    pub(crate) acceleration: f64,
    pub(crate) instant_dv: f64,
    active: AtomicBool,
}

impl Dda {
    fn idle() -> Self {
        Self {
            look_ahead_index: 0,
            counter: [0; DRIVES],
            delta: [0; DRIVES],
            directions: [true; DRIVES],
            total_steps: 0,
            step_count: 0,
            check_endstops: false,
            time_step: 0.0,
            velocity: 0.0,
            stop_a_step: 0,
            start_d_step: 0,
            acceleration: 0.0,
            instant_dv: 0.0,
            active: AtomicBool::new(false),
        }
    }

    /// Install a prepared profile. The slot is not visible to the
    /// interrupt context until [`Dda::publish`].
    pub fn load(&mut self, plan: &DdaPlan, look_ahead_index: usize) {
        self.look_ahead_index = look_ahead_index;
        self.delta = plan.delta;
        self.directions = plan.directions;
        self.total_steps = plan.total_steps;
        self.counter = [-plan.total_steps / 2; DRIVES];
        self.step_count = 0;
        self.check_endstops = plan.check_endstops;
        self.time_step = plan.time_step;
        self.velocity = plan.velocity;
        self.stop_a_step = plan.stop_a_step;
        self.start_d_step = plan.start_d_step;
        self.acceleration = plan.acceleration;
        self.instant_dv = plan.instant_dv;
    }

    /// Make a fully-loaded slot visible to the interrupt context.
    pub fn publish(&self) {
        self.active.store(true, Ordering::Release);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }

    /// Latch the travel directions and arm the first step. Runs in the
    /// interrupt frame that picks the move up.
    pub fn start<P: Platform>(&self, platform: &mut P) {
        for drive in 0..DRIVES {
            platform.set_direction(drive, self.directions[drive]);
        }
        platform.set_interrupt(self.time_step);
    }

    pub fn look_ahead_index(&self) -> usize {
        self.look_ahead_index
    }
}

/// Circular buffer of [`Dda`] slots. Both cursors belong to the
/// foreground; the interrupt context only ever flips the head slot's
/// `active` flag, so it never needs the lock.
#[derive(Debug)]
pub struct DdaRing {
    pub(crate) slots: Vec<Dda>,
    pub(crate) add: usize,
    pub(crate) get: usize,
    locked: AtomicBool,
}

impl DdaRing {
    pub fn new(length: usize) -> Self {
        assert!(length >= 3, "stepping ring too short to hold its safety gap");
        Self {
            slots: (0..length).map(|_| Dda::idle()).collect(),
            add: 0,
            get: 0,
            locked: AtomicBool::new(false),
        }
    }

    pub fn next(&self, index: usize) -> usize {
        (index + 1) % self.slots.len()
    }

    /// Leave a gap of two: the head may still be executing.
    pub fn is_full(&self) -> bool {
        self.next(self.next(self.add)) == self.get
    }

    pub fn is_empty(&self) -> bool {
        self.get == self.add
    }

    pub fn try_lock(&self) -> bool {
        !self.locked.swap(true, Ordering::Acquire)
    }

    pub fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }

    /// Advance the read cursor past slots the interrupt context has
    /// finished with. Call with the lock held.
    pub fn reclaim(&mut self) {
        while self.get != self.add && !self.slots[self.get].is_active() {
            self.get = self.next(self.get);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motion::lookahead::LookAheadRing;

    const SPU: [f64; DRIVES] = [80.0, 80.0, 400.0, 420.0, 420.0];

    /// Ring with an origin seed at v=`u`, plus one X move of `steps` at
    /// `feed` with exit velocity forced to `v`.
    fn segment(u: f64, v: f64, steps: i64, feed: f64) -> (LookAheadRing, usize, usize) {
        let mut ring = LookAheadRing::new(8);
        ring.seed_origin(u, 0.0, 300.0, 1000.0);
        let seed = ring.last;
        ring.entry_mut(seed).set_v(u);
        let mut ep = [0; DRIVES];
        ep[0] = steps;
        assert!(ring.add_move(ep, feed, 0.0, 300.0, 1000.0, false, false));
        let index = ring.last;
        ring.entry_mut(index).set_v(v);
        (ring, index, seed)
    }

    #[test]
    fn short_move_becomes_triangle() {
        // 10 mm at 80 steps/mm: 200 mm/s needs 20 mm to reach, so the
        // profile peaks at sqrt(2*a*d/2) = 100 mm/s half way.
        let (ring, index, seed) = segment(0.0, 0.0, 800, 200.0);
        let prepared = prepare(ring.entry(index), ring.entry(seed), &SPU);
        assert_eq!(prepared.profile, MovementProfile::NoFlat);
        let plan = prepared.plan.unwrap();
        assert_eq!(plan.total_steps, 800);
        assert_eq!(plan.stop_a_step, 400);
        assert_eq!(plan.start_d_step, 401);
        assert_eq!(prepared.u, 0.0);
        assert_eq!(prepared.v, 0.0);
    }

    #[test]
    fn long_move_keeps_cruise_phase() {
        // 50 mm: 20 mm accelerating, 10 cruising, 20 braking.
        let (ring, index, seed) = segment(0.0, 0.0, 4000, 200.0);
        let prepared = prepare(ring.entry(index), ring.entry(seed), &SPU);
        assert_eq!(prepared.profile, MovementProfile::Moving);
        let plan = prepared.plan.unwrap();
        assert_eq!(plan.stop_a_step, 1600);
        assert_eq!(plan.start_d_step, 2400);
    }

    #[test]
    fn unreachable_exit_velocity_is_reduced() {
        // From rest over 10 mm the best exit is sqrt(2*1000*10) mm/s.
        let (ring, index, seed) = segment(0.0, 200.0, 800, 200.0);
        let prepared = prepare(ring.entry(index), ring.entry(seed), &SPU);
        assert_eq!(prepared.profile, MovementProfile::Change);
        assert_eq!(prepared.u, 0.0);
        assert!((prepared.v - 20000.0_f64.sqrt()).abs() < 1e-9);
        let plan = prepared.plan.unwrap();
        assert_eq!(plan.stop_a_step, 800);
        assert_eq!(plan.start_d_step, 801);
    }

    #[test]
    fn unreachable_entry_velocity_is_reduced() {
        let (ring, index, seed) = segment(200.0, 0.0, 800, 200.0);
        let prepared = prepare(ring.entry(index), ring.entry(seed), &SPU);
        assert_eq!(prepared.profile, MovementProfile::Change);
        assert!((prepared.u - 20000.0_f64.sqrt()).abs() < 1e-9);
        assert_eq!(prepared.v, 0.0);
        let plan = prepared.plan.unwrap();
        assert_eq!(plan.stop_a_step, 0);
        assert_eq!(plan.start_d_step, 1);
    }

    #[test]
    fn single_step_ramp_snaps_to_feed_rate() {
        let (ring, index, seed) = segment(100.0, 100.0, 10, 100.0);
        let prepared = prepare(ring.entry(index), ring.entry(seed), &SPU);
        assert_eq!(prepared.profile, MovementProfile::Change);
        assert_eq!(prepared.u, 100.0);
        assert_eq!(prepared.v, 100.0);
        let plan = prepared.plan.unwrap();
        assert_eq!(plan.stop_a_step, 0);
        assert_eq!(plan.start_d_step, 10);
    }

    #[test]
    fn null_move_yields_no_plan() {
        let (mut ring, index, seed) = segment(0.0, 0.0, 0, 100.0);
        ring.entry_mut(index).set_v(0.0);
        let prepared = prepare(ring.entry(index), ring.entry(seed), &SPU);
        assert!(prepared.plan.is_none());
    }

    #[test]
    fn extruder_delta_is_relative() {
        let mut ring = LookAheadRing::new(8);
        ring.seed_origin(2.0, 0.0, 300.0, 1000.0);
        let seed = ring.last;
        let mut ep = [0; DRIVES];
        ep[AXES] = 420; // 1 mm of filament
        assert!(ring.add_move(ep, 10.0, 0.0, 40.0, 1000.0, false, false));
        let prepared = prepare(ring.entry(ring.last), ring.entry(seed), &SPU);
        let plan = prepared.plan.unwrap();
        assert_eq!(plan.delta[AXES], 420);
        assert_eq!(plan.total_steps, 420);
        assert!((plan.distance - 1.0).abs() < 1e-9);
    }

    #[test]
    fn bresenham_counters_start_at_half_total() {
        let (ring, index, seed) = segment(0.0, 0.0, 800, 200.0);
        let prepared = prepare(ring.entry(index), ring.entry(seed), &SPU);
        let mut dda = Dda::idle();
        dda.load(prepared.plan.as_ref().unwrap(), index);
        assert_eq!(dda.counter, [-400; DRIVES]);
        assert!(!dda.is_active());
        dda.publish();
        assert!(dda.is_active());
    }

    #[test]
    fn ring_gap_and_reclaim() {
        let mut ring = DdaRing::new(5);
        assert!(ring.is_empty());
        // Publish three slots: the fourth would close the gap.
        for _ in 0..3 {
            assert!(!ring.is_full());
            ring.slots[ring.add].publish();
            ring.add = ring.next(ring.add);
        }
        assert!(ring.is_full());
        // Finish the first; reclaim frees exactly one slot.
        ring.slots[ring.get].deactivate();
        ring.reclaim();
        assert!(!ring.is_full());
        assert_eq!(ring.get, 1);
    }
}
