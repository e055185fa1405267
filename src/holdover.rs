//! Holdover detection.
//!
//! The machine only decides; the controller carries out the returned
//! [`HoldoverAction`] (accumulate, suspend, discard a false alarm, or
//! recalibrate after lock returns).
//!
//! Known limitation: a spike only clears when the PPS delta comes back near
//! its pre-spike value. A phase step that persists (a GPS receiver reset,
//! say) keeps the machine in `SpikeSuspect` until lock is lost and regained,
//! and the drift loop stays postponed meanwhile. This sits alongside the
//! unbounded zero-confirmation wait in calibration when no
//! `wait_poll_limit` is set.

use crate::dds::DdsState;
use log::{info, warn};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HoldoverState {
    Normal,
    /// A PPS jump was seen; waiting to learn whether it was a glitch.
    SpikeSuspect,
    /// The rubidium reported lock bad; running on the last DDS value.
    LockLost,
}

/// Substate codes stored in holdover records. `Run` is never produced by
/// the control loop and is kept for record compatibility.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum HoldoverSubstate {
    #[default]
    Off,
    Start,
    RbLock,
    Run,
}

impl From<HoldoverState> for HoldoverSubstate {
    fn from(state: HoldoverState) -> Self {
        match state {
            HoldoverState::Normal => HoldoverSubstate::Off,
            HoldoverState::SpikeSuspect => HoldoverSubstate::Start,
            HoldoverState::LockLost => HoldoverSubstate::RbLock,
        }
    }
}

/// Record slots. Only `Start` is written by the control loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoldoverSlot {
    Start,
    Current,
    Short,
    Longer,
    Forever,
}

impl HoldoverSlot {
    pub const COUNT: usize = 5;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct HoldoverRecord {
    pub tick_counter_at_entry: u64,
    pub dds_at_entry: f64,
    pub old_dds_at_entry: f64,
    /// Corrected PPS delta of the sample that triggered entry.
    pub current_pps_delta: i64,
    /// Corrected PPS delta of the sample before it.
    pub previous_pps_delta: i64,
    pub substate: HoldoverSubstate,
}

/// One PPS tick as seen by the holdover logic.
#[derive(Debug, Clone, Copy)]
pub struct HoldoverSample {
    pub lock_bad: bool,
    /// corrected(previous) - corrected(current)
    pub diff: i64,
    pub current: i64,
    pub previous: i64,
    pub sample_counter: u64,
    pub dds: DdsState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoldoverAction {
    /// Normal operation: feed the sample to the accumulators.
    Accumulate,
    /// Holding over: push a placeholder, touch nothing else.
    Suspend,
    /// The spike cleared: drop CalcSlope and push a placeholder.
    DiscardSpike,
    /// Lock is back: recalibrate, then call `complete_recovery`.
    Recover,
}

#[derive(Debug, Clone)]
pub struct HoldoverMachine {
    state: HoldoverState,
    records: [HoldoverRecord; HoldoverSlot::COUNT],
    pps_trigger: i64,
}

impl HoldoverMachine {
    pub fn new(pps_trigger: i64) -> Self {
        HoldoverMachine {
            state: HoldoverState::Normal,
            records: [HoldoverRecord::default(); HoldoverSlot::COUNT],
            pps_trigger,
        }
    }

    pub fn state(&self) -> HoldoverState {
        self.state
    }

    pub fn is_holding(&self) -> bool {
        self.state != HoldoverState::Normal
    }

    pub fn record(&self, slot: HoldoverSlot) -> &HoldoverRecord {
        &self.records[slot as usize]
    }

    pub fn evaluate(&mut self, sample: &HoldoverSample) -> HoldoverAction {
        let spike = sample.diff.abs() >= self.pps_trigger;

        match self.state {
            HoldoverState::Normal => {
                if sample.lock_bad {
                    warn!("*** Rubidium lock bad, going into holdover (counter {})",
                          sample.sample_counter);
                    self.enter(HoldoverState::LockLost, sample);
                    HoldoverAction::Suspend
                } else if spike {
                    warn!("*** PPS spike / loss detected (diff {}), going into holdover",
                          sample.diff);
                    self.enter(HoldoverState::SpikeSuspect, sample);
                    HoldoverAction::Suspend
                } else {
                    HoldoverAction::Accumulate
                }
            }
            HoldoverState::SpikeSuspect => {
                if sample.lock_bad {
                    warn!("*** Rubidium lock bad during spike holdover");
                    self.state = HoldoverState::LockLost;
                    HoldoverAction::Suspend
                } else if self.spike_cleared(sample) {
                    info!("*** PPS back at {} (pre-spike {}), leaving holdover",
                          sample.current, self.records[HoldoverSlot::Start as usize].previous_pps_delta);
                    self.reset_record(HoldoverSlot::Start);
                    self.state = HoldoverState::Normal;
                    HoldoverAction::DiscardSpike
                } else {
                    HoldoverAction::Suspend
                }
            }
            HoldoverState::LockLost => {
                if sample.lock_bad {
                    HoldoverAction::Suspend
                } else {
                    info!("*** Rubidium lock is good, leaving holdover");
                    HoldoverAction::Recover
                }
            }
        }
    }

    /// Close out a lock-loss holdover after recalibration succeeded.
    pub fn complete_recovery(&mut self) {
        self.reset_record(HoldoverSlot::Start);
        self.state = HoldoverState::Normal;
    }

    pub fn reset_record(&mut self, slot: HoldoverSlot) {
        self.records[slot as usize] = HoldoverRecord::default();
    }

    fn enter(&mut self, next: HoldoverState, sample: &HoldoverSample) {
        self.records[HoldoverSlot::Start as usize] = HoldoverRecord {
            tick_counter_at_entry: sample.sample_counter,
            dds_at_entry: sample.dds.value,
            old_dds_at_entry: sample.dds.previous,
            current_pps_delta: sample.current,
            previous_pps_delta: sample.previous,
            substate: self.state.into(),
        };
        self.state = next;
    }

    // The spike is over once the delta is back near where it was before it.
    fn spike_cleared(&self, sample: &HoldoverSample) -> bool {
        let before = self.records[HoldoverSlot::Start as usize].previous_pps_delta;
        (sample.current - before).abs() < self.pps_trigger
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TRIGGER: i64 = 10_000;

    fn sample(lock_bad: bool, previous: i64, current: i64) -> HoldoverSample {
        HoldoverSample {
            lock_bad,
            diff: previous - current,
            current,
            previous,
            sample_counter: 1234,
            dds: DdsState { value: -10.2, previous: -10.4 },
        }
    }

    #[test]
    fn test_normal_stays_normal_on_good_samples() {
        let mut m = HoldoverMachine::new(TRIGGER);
        assert_eq!(m.evaluate(&sample(false, 3, 5)), HoldoverAction::Accumulate);
        assert_eq!(m.state(), HoldoverState::Normal);
        assert!(!m.is_holding());
    }

    #[test]
    fn test_lock_bad_enters_lock_lost_and_records_entry() {
        let mut m = HoldoverMachine::new(TRIGGER);
        assert_eq!(m.evaluate(&sample(true, 3, 5)), HoldoverAction::Suspend);
        assert_eq!(m.state(), HoldoverState::LockLost);

        let rec = m.record(HoldoverSlot::Start);
        assert_eq!(rec.tick_counter_at_entry, 1234);
        assert_eq!(rec.dds_at_entry, -10.2);
        assert_eq!(rec.old_dds_at_entry, -10.4);
        assert_eq!(rec.current_pps_delta, 5);
        assert_eq!(rec.previous_pps_delta, 3);
        assert_eq!(rec.substate, HoldoverSubstate::Off);
        // Reserved slots never written
        assert_eq!(*m.record(HoldoverSlot::Forever), HoldoverRecord::default());
    }

    #[test]
    fn test_lock_bad_takes_priority_over_spike() {
        let mut m = HoldoverMachine::new(TRIGGER);
        m.evaluate(&sample(true, 0, 50_000));
        assert_eq!(m.state(), HoldoverState::LockLost);
    }

    #[test]
    fn test_spike_enters_suspect() {
        let mut m = HoldoverMachine::new(TRIGGER);
        assert_eq!(m.evaluate(&sample(false, 10, 10 - TRIGGER)), HoldoverAction::Suspend);
        assert_eq!(m.state(), HoldoverState::SpikeSuspect);
        // Just below trigger is not a spike
        let mut m = HoldoverMachine::new(TRIGGER);
        assert_eq!(m.evaluate(&sample(false, 10, 10 - TRIGGER + 1)), HoldoverAction::Accumulate);
    }

    #[test]
    fn test_spike_stays_suspect_while_displaced() {
        let mut m = HoldoverMachine::new(TRIGGER);
        m.evaluate(&sample(false, 20, 40_020));
        assert_eq!(m.evaluate(&sample(false, 40_020, 40_025)), HoldoverAction::Suspend);
        assert_eq!(m.state(), HoldoverState::SpikeSuspect);
    }

    #[test]
    fn test_persistent_phase_step_never_clears() {
        let mut m = HoldoverMachine::new(TRIGGER);
        m.evaluate(&sample(false, 20, 40_020));
        let mut prev = 40_020;
        for i in 1..5000 {
            let current = 40_020 + i % 7;
            assert_eq!(m.evaluate(&sample(false, prev, current)), HoldoverAction::Suspend);
            prev = current;
        }
        assert_eq!(m.state(), HoldoverState::SpikeSuspect);
        // Only a lock cycle gets it out
        m.evaluate(&sample(true, prev, prev));
        assert_eq!(m.evaluate(&sample(false, prev, prev)), HoldoverAction::Recover);
    }

    #[test]
    fn test_spike_clears_as_false_alarm() {
        let mut m = HoldoverMachine::new(TRIGGER);
        m.evaluate(&sample(false, 20, 40_020));
        assert_eq!(m.evaluate(&sample(false, 40_020, 22)), HoldoverAction::DiscardSpike);
        assert_eq!(m.state(), HoldoverState::Normal);
        assert_eq!(*m.record(HoldoverSlot::Start), HoldoverRecord::default());
    }

    #[test]
    fn test_suspect_escalates_to_lock_lost() {
        let mut m = HoldoverMachine::new(TRIGGER);
        m.evaluate(&sample(false, 20, 40_020));
        assert_eq!(m.evaluate(&sample(true, 40_020, 22)), HoldoverAction::Suspend);
        assert_eq!(m.state(), HoldoverState::LockLost);
    }

    #[test]
    fn test_lock_lost_recovers_only_when_lock_clears() {
        let mut m = HoldoverMachine::new(TRIGGER);
        m.evaluate(&sample(true, 0, 0));
        assert_eq!(m.evaluate(&sample(true, 0, 0)), HoldoverAction::Suspend);
        assert_eq!(m.evaluate(&sample(false, 0, 0)), HoldoverAction::Recover);
        // Still LockLost until the caller finishes recalibrating
        assert_eq!(m.state(), HoldoverState::LockLost);

        m.complete_recovery();
        assert_eq!(m.state(), HoldoverState::Normal);
        assert_eq!(*m.record(HoldoverSlot::Start), HoldoverRecord::default());
    }

    #[test]
    fn test_substate_codes() {
        assert_eq!(HoldoverSubstate::from(HoldoverState::Normal), HoldoverSubstate::Off);
        assert_eq!(HoldoverSubstate::from(HoldoverState::SpikeSuspect), HoldoverSubstate::Start);
        assert_eq!(HoldoverSubstate::from(HoldoverState::LockLost), HoldoverSubstate::RbLock);
    }
}
