//! The look-ahead ring: planned linear moves waiting for the junction and
//! reachability passes before they are handed to the stepping ring.
//!
//! Entries live in a fixed circular array. `add` is the write cursor, `get`
//! the read cursor, and `last` remembers the most recently appended entry so
//! the next move can plan against it. A slot is reusable only once its
//! `RELEASED` flag is set, which happens when the interrupt context finishes
//! stepping the move.

use std::sync::atomic::{AtomicU8, Ordering};

use crate::config::DRIVES;

pub const UNPROCESSED: u8 = 0;
pub const V_COSINE_SET: u8 = 1;
pub const UP_PASS: u8 = 2;
pub const COMPLETE: u8 = 4;
pub const RELEASED: u8 = 8;

/// One planned move: target machine coordinates (absolute for axes,
/// relative deltas for extruders), the feasible-speed envelope, and the
/// planned exit velocity `v`, which the planner passes mutate.
#[derive(Debug)]
pub struct LookAheadEntry {
    end_point: [i64; DRIVES],
    requested_feed_rate: f64,
    min_speed: f64,
    max_speed: f64,
    acceleration: f64,
    v: f64,
    cosine: Option<f64>,
    check_endstops: bool,
    processed: AtomicU8,
}

impl LookAheadEntry {
    fn idle() -> Self {
        Self {
            end_point: [0; DRIVES],
            requested_feed_rate: 0.0,
            min_speed: 0.0,
            max_speed: 0.0,
            acceleration: 0.0,
            v: 0.0,
            cosine: None,
            check_endstops: false,
            processed: AtomicU8::new(RELEASED),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn init(
        &mut self,
        end_point: [i64; DRIVES],
        feed_rate: f64,
        min_speed: f64,
        max_speed: f64,
        acceleration: f64,
        check_endstops: bool,
        isolated: bool,
    ) {
        self.end_point = end_point;
        self.min_speed = min_speed;
        self.max_speed = max_speed;
        self.acceleration = acceleration;
        self.requested_feed_rate = feed_rate.clamp(min_speed, max_speed);
        self.v = self.requested_feed_rate;
        self.check_endstops = check_endstops;
        // Cosines are evaluated lazily
        self.cosine = None;
        // An isolated move has nothing following to plan against, so it
        // skips the planner passes entirely.
        let state = if isolated { COMPLETE | V_COSINE_SET | UP_PASS } else { UNPROCESSED };
        self.processed.store(state, Ordering::Release);
    }

    pub fn v(&self) -> f64 {
        self.v
    }

    pub fn set_v(&mut self, v: f64) {
        self.v = v;
    }

    pub fn requested_feed_rate(&self) -> f64 {
        self.requested_feed_rate
    }

    pub fn set_feed_rate(&mut self, feed_rate: f64) {
        self.requested_feed_rate = feed_rate;
    }

    pub fn min_speed(&self) -> f64 {
        self.min_speed
    }

    pub fn max_speed(&self) -> f64 {
        self.max_speed
    }

    pub fn acceleration(&self) -> f64 {
        self.acceleration
    }

    pub fn check_endstops(&self) -> bool {
        self.check_endstops
    }

    pub fn end_point(&self) -> &[i64; DRIVES] {
        &self.end_point
    }

    /// Machine coordinate of one drive in mm.
    pub fn machine_to_end_point(&self, drive: usize, steps_per_unit: &[f64; DRIVES]) -> f64 {
        self.end_point[drive] as f64 / steps_per_unit[drive]
    }

    /// Overwrite one drive's target and force the move to end at rest.
    /// Used when an endstop preempts the move.
    pub fn set_drive_coordinate_and_zero_end_speed(
        &mut self,
        mm: f64,
        drive: usize,
        steps_per_unit: &[f64; DRIVES],
    ) {
        self.end_point[drive] = (mm * steps_per_unit[drive]).round() as i64;
        self.cosine = None;
        self.v = 0.0;
    }

    pub fn processed(&self) -> u8 {
        self.processed.load(Ordering::Acquire)
    }

    pub fn set_processed(&self, state: u8) {
        if state == UNPROCESSED {
            self.processed.store(UNPROCESSED, Ordering::Release);
        } else {
            self.processed.fetch_or(state, Ordering::AcqRel);
        }
    }

    pub fn release(&self) {
        self.processed.store(RELEASED, Ordering::Release);
    }

    pub fn is_released(&self) -> bool {
        self.processed() & RELEASED != 0
    }

    pub fn is_complete(&self) -> bool {
        self.processed() & COMPLETE != 0
    }
}

#[derive(Debug)]
pub struct LookAheadRing {
    entries: Vec<LookAheadEntry>,
    pub(crate) add: usize,
    pub(crate) get: usize,
    pub(crate) count: usize,
    pub(crate) last: usize,
}

impl LookAheadRing {
    pub fn new(length: usize) -> Self {
        assert!(length >= 4, "look-ahead ring too short to hold its safety gap");
        let entries = (0..length).map(|_| LookAheadEntry::idle()).collect();
        Self {
            entries,
            add: 0,
            get: 0,
            count: 0,
            last: length - 1,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn next(&self, index: usize) -> usize {
        (index + 1) % self.entries.len()
    }

    pub fn prev(&self, index: usize) -> usize {
        (index + self.entries.len() - 1) % self.entries.len()
    }

    pub fn entry(&self, index: usize) -> &LookAheadEntry {
        &self.entries[index]
    }

    pub fn entry_mut(&mut self, index: usize) -> &mut LookAheadEntry {
        &mut self.entries[index]
    }

    /// Leave a gap of two slots: the last dequeued entry may still be
    /// executing, and its predecessor is the planning reference.
    pub fn is_full(&self) -> bool {
        if !self.entries[self.add].is_released() {
            return true;
        }
        self.next(self.next(self.add)) == self.get
    }

    /// Seed the slot before the first real move as an already-released
    /// origin pseudo-move, giving the planner its initial "previous" entry.
    pub fn seed_origin(&mut self, feed_rate: f64, min_speed: f64, max_speed: f64, acceleration: f64) {
        let seed = self.prev(self.add);
        self.entries[seed].init(
            [0; DRIVES],
            feed_rate,
            min_speed,
            max_speed,
            acceleration,
            false,
            false,
        );
        self.entries[seed].release();
        self.last = seed;
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add_move(
        &mut self,
        end_point: [i64; DRIVES],
        feed_rate: f64,
        min_speed: f64,
        max_speed: f64,
        acceleration: f64,
        check_endstops: bool,
        isolated: bool,
    ) -> bool {
        if self.is_full() {
            return false;
        }
        if !self.entries[self.add].is_released() {
            tracing::warn!("Attempt to overwrite a look-ahead entry that is still in use");
            return false;
        }
        self.entries[self.add].init(
            end_point,
            feed_rate,
            min_speed,
            max_speed,
            acceleration,
            check_endstops,
            isolated,
        );
        self.last = self.add;
        self.add = self.next(self.add);
        self.count += 1;
        true
    }

    /// Take the head entry if the planner has finished with it. The slot
    /// stays allocated until the stepping code releases it.
    pub fn take_completed(&mut self) -> Option<usize> {
        if self.count == 0 {
            return None;
        }
        if !self.entries[self.get].is_complete() {
            return None;
        }
        let index = self.get;
        self.get = self.next(self.get);
        self.count -= 1;
        Some(index)
    }

    /// Cosine of the junction angle at `index`, between the incoming and
    /// outgoing move directions. Evaluated lazily and cached until the
    /// entry is reused.
    pub fn cosine(&mut self, index: usize, steps_per_unit: &[f64; DRIVES]) -> f64 {
        if let Some(c) = self.entries[index].cosine {
            return c;
        }
        let previous = self.prev(index);
        let next = self.next(index);
        let mut dot = 0.0;
        let mut a2 = 0.0;
        let mut b2 = 0.0;
        for drive in 0..DRIVES {
            let here = self.entries[index].machine_to_end_point(drive, steps_per_unit);
            let m1 = here - self.entries[previous].machine_to_end_point(drive, steps_per_unit);
            let m2 = self.entries[next].machine_to_end_point(drive, steps_per_unit) - here;
            a2 += m1 * m1;
            b2 += m2 * m2;
            dot += m1 * m2;
        }
        let cosine = if a2 <= 0.0 || b2 <= 0.0 {
            0.0
        } else {
            dot / (a2.sqrt() * b2.sqrt())
        };
        self.entries[index].cosine = Some(cosine);
        cosine
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPU: [f64; DRIVES] = [80.0, 80.0, 400.0, 420.0, 420.0];

    fn ring() -> LookAheadRing {
        let mut r = LookAheadRing::new(8);
        r.seed_origin(2.0, 0.5, 4.0, 100.0);
        r
    }

    fn add(r: &mut LookAheadRing, x_steps: i64, feed: f64) -> bool {
        let mut ep = [0; DRIVES];
        ep[0] = x_steps;
        r.add_move(ep, feed, 1.0, 200.0, 1000.0, false, false)
    }

    #[test]
    fn fills_to_capacity_minus_gap() {
        let mut r = ring();
        let mut added = 0;
        while add(&mut r, (added + 1) as i64 * 100, 50.0) {
            added += 1;
        }
        // Two slots are kept free behind the write cursor.
        assert_eq!(added, 6);
        assert!(r.is_full());
    }

    #[test]
    fn head_not_taken_until_complete() {
        let mut r = ring();
        assert!(add(&mut r, 100, 50.0));
        assert_eq!(r.take_completed(), None);
        r.entry(r.get).set_processed(COMPLETE);
        let taken = r.take_completed().unwrap();
        assert!(!r.entry(taken).is_released());
        assert_eq!(r.count, 0);
    }

    #[test]
    fn released_slot_is_reusable() {
        let mut r = ring();
        assert!(add(&mut r, 100, 50.0));
        r.entry(r.get).set_processed(COMPLETE);
        let taken = r.take_completed().unwrap();
        r.entry(taken).release();
        // Wrap the cursor all the way round; every add succeeds because
        // each slot is released before reuse.
        for i in 0..12 {
            assert!(add(&mut r, 200 + i, 50.0));
            r.entry(r.get).set_processed(COMPLETE);
            let t = r.take_completed().unwrap();
            r.entry(t).release();
        }
    }

    #[test]
    fn feed_rate_clamped_into_envelope() {
        let mut r = ring();
        let mut ep = [0; DRIVES];
        ep[0] = 100;
        r.add_move(ep, 500.0, 1.0, 200.0, 1000.0, false, false);
        assert_eq!(r.entry(r.last).requested_feed_rate(), 200.0);
        assert_eq!(r.entry(r.last).v(), 200.0);

        ep[0] = 200;
        r.add_move(ep, 0.1, 1.0, 200.0, 1000.0, false, false);
        assert_eq!(r.entry(r.last).v(), 1.0);
    }

    #[test]
    fn isolated_moves_skip_planning() {
        let mut r = ring();
        let mut ep = [0; DRIVES];
        ep[0] = 100;
        r.add_move(ep, 50.0, 1.0, 200.0, 1000.0, false, true);
        assert!(r.entry(r.last).is_complete());
    }

    #[test]
    fn colinear_junction_cosine_is_one() {
        let mut r = ring();
        assert!(add(&mut r, 800, 50.0));
        let first = r.last;
        assert!(add(&mut r, 1600, 50.0));
        let c = r.cosine(first, &SPU);
        assert!((c - 1.0).abs() < 1e-9);
    }

    #[test]
    fn right_angle_junction_cosine_is_zero() {
        let mut r = ring();
        assert!(add(&mut r, 800, 50.0));
        let first = r.last;
        let mut ep = [0; DRIVES];
        ep[0] = 800;
        ep[1] = 800;
        assert!(r.add_move(ep, 50.0, 1.0, 200.0, 1000.0, false, false));
        let c = r.cosine(first, &SPU);
        assert!(c.abs() < 1e-9);
    }

    #[test]
    fn endstop_snap_zeroes_exit_speed() {
        let mut r = ring();
        assert!(add(&mut r, 800, 50.0));
        let index = r.last;
        r.entry_mut(index).set_drive_coordinate_and_zero_end_speed(0.8, 2, &SPU);
        assert_eq!(r.entry(index).end_point()[2], 320);
        assert_eq!(r.entry(index).v(), 0.0);
    }
}
