//! Shutter motion sequencing.
//!
//! A move request covers one side or both. Both sides are never driven together: opening
//! starts with the A side (three shutters, top shutter first), closing with the B side so
//! the top shutter goes over last. Each side runs to completion before the next starts.
//!
//! [`ActiveMove::poll`] is a pure step function: given a fresh dome reading it returns the
//! single hardware action the worker should perform next.

use obs_core::capabilities::{DomeSide, DomeStatus, MoveDirection, SideState};
use obs_core::error::{ObsError, ObsResult};
use obs_core::retry::Deadline;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::info;

/// Which sides a move request covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MoveSide {
    ASide,
    BSide,
    Both,
}

impl std::str::FromStr for MoveSide {
    type Err = ObsError;

    fn from_str(s: &str) -> ObsResult<Self> {
        match s {
            "a_side" => Ok(MoveSide::ASide),
            "b_side" => Ok(MoveSide::BSide),
            "both" => Ok(MoveSide::Both),
            _ => Err(ObsError::InvalidArgument(
                "Side must be one of \"a_side\", \"b_side\" or \"both\"".to_string(),
            )),
        }
    }
}

impl std::fmt::Display for MoveSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            MoveSide::ASide => "a_side",
            MoveSide::BSide => "b_side",
            MoveSide::Both => "both",
        })
    }
}

impl MoveSide {
    /// Sides in the order they are driven.
    pub fn sequence(self, direction: MoveDirection) -> Vec<DomeSide> {
        match (self, direction) {
            (MoveSide::ASide, _) => vec![DomeSide::ASide],
            (MoveSide::BSide, _) => vec![DomeSide::BSide],
            (MoveSide::Both, MoveDirection::Open) => vec![DomeSide::ASide, DomeSide::BSide],
            (MoveSide::Both, MoveDirection::Close) => vec![DomeSide::BSide, DomeSide::ASide],
        }
    }

    /// Drop sides that are already where `direction` would take them.
    ///
    /// Returns `None` when nothing needs to move.
    pub fn narrow(self, direction: MoveDirection, a_side: SideState, b_side: SideState) -> Option<Self> {
        let done = |state: SideState| at_end(direction, state);
        match self {
            MoveSide::ASide => (!done(a_side)).then_some(MoveSide::ASide),
            MoveSide::BSide => (!done(b_side)).then_some(MoveSide::BSide),
            MoveSide::Both => match (done(a_side), done(b_side)) {
                (true, true) => None,
                (true, false) => Some(MoveSide::BSide),
                (false, true) => Some(MoveSide::ASide),
                (false, false) => Some(MoveSide::Both),
            },
        }
    }
}

fn at_end(direction: MoveDirection, state: SideState) -> bool {
    match direction {
        MoveDirection::Open => state == SideState::FullOpen,
        MoveDirection::Close => state == SideState::Closed,
    }
}

/// A validated request to move the shutters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MoveRequest {
    pub direction: MoveDirection,
    pub side: MoveSide,
    /// Fraction of full travel, in `(0, 1]`.
    pub frac: f64,
}

impl MoveRequest {
    pub fn new(direction: MoveDirection, side: MoveSide, frac: f64) -> ObsResult<Self> {
        if !(frac > 0.0 && frac <= 1.0) {
            return Err(ObsError::InvalidArgument(
                "Fraction must be between 0 and 1".to_string(),
            ));
        }
        Ok(Self {
            direction,
            side,
            frac,
        })
    }

    /// Full travel of both sides.
    pub fn full(direction: MoveDirection) -> Self {
        Self {
            direction,
            side: MoveSide::Both,
            frac: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    /// Pick the next side from the queue.
    Next,
    /// Alarm sounded, waiting before starting `side`.
    Settling { side: DomeSide, until: Instant },
    /// `from` is the side's state when the start was sent.
    Moving {
        side: DomeSide,
        deadline: Deadline,
        from: SideState,
        seen_moving: bool,
    },
}

/// Published phase of the current move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MovePhase {
    Starting,
    Settling,
    Moving,
}

/// Snapshot view of the current move.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MotionInfo {
    pub direction: MoveDirection,
    pub side: MoveSide,
    pub frac: f64,
    pub phase: MovePhase,
    pub current_side: Option<DomeSide>,
}

/// What the worker should do after polling the active move.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MoveAction {
    Wait,
    SoundAlarm(DomeSide),
    Start {
        side: DomeSide,
        direction: MoveDirection,
        frac: f64,
    },
    /// Every side reached its target.
    Finished,
    /// `side` did not arrive before the per-side timeout.
    TimedOut(DomeSide),
    /// `side` reported an error state.
    Failed(DomeSide),
}

/// A move in progress, owned by the dome worker.
#[derive(Debug, Clone)]
pub struct ActiveMove {
    request: MoveRequest,
    remaining: VecDeque<DomeSide>,
    phase: Phase,
}

impl ActiveMove {
    pub fn new(request: MoveRequest) -> Self {
        Self {
            remaining: request.side.sequence(request.direction).into(),
            request,
            phase: Phase::Next,
        }
    }

    pub fn request(&self) -> &MoveRequest {
        &self.request
    }

    pub fn direction(&self) -> MoveDirection {
        self.request.direction
    }

    pub fn info(&self) -> MotionInfo {
        let (phase, current_side) = match self.phase {
            Phase::Next => (MovePhase::Starting, None),
            Phase::Settling { side, .. } => (MovePhase::Settling, Some(side)),
            Phase::Moving { side, .. } => (MovePhase::Moving, Some(side)),
        };
        MotionInfo {
            direction: self.request.direction,
            side: self.request.side,
            frac: self.request.frac,
            phase,
            current_side,
        }
    }

    /// A partial move has no end stop to detect, so it only counts once the side has
    /// moved and stopped again.
    fn reached(&self, state: SideState, from: SideState, seen_moving: bool) -> bool {
        if self.request.frac >= 1.0 {
            at_end(self.request.direction, state)
        } else {
            !state.is_moving() && state != SideState::Error && (seen_moving || state != from)
        }
    }

    /// Advance the move against a fresh dome reading.
    ///
    /// With `alarm` set every side start is preceded by [`MoveAction::SoundAlarm`] and a
    /// wait of `settle`. A side that is already at its end position is skipped.
    pub fn poll(
        &mut self,
        status: &DomeStatus,
        alarm: bool,
        settle: Duration,
        timeout: Duration,
        now: Instant,
    ) -> MoveAction {
        let direction = self.request.direction;
        loop {
            match self.phase {
                Phase::Next => {
                    let Some(side) = self.remaining.pop_front() else {
                        return MoveAction::Finished;
                    };
                    if at_end(direction, status.side(side)) {
                        info!(%side, "Side already {}", end_name(direction));
                        continue;
                    }
                    if alarm {
                        self.phase = Phase::Settling {
                            side,
                            until: now + settle,
                        };
                        return MoveAction::SoundAlarm(side);
                    }
                    return self.start(side, status.side(side), timeout);
                }
                Phase::Settling { side, until } => {
                    if now < until {
                        return MoveAction::Wait;
                    }
                    return self.start(side, status.side(side), timeout);
                }
                Phase::Moving {
                    side,
                    deadline,
                    from,
                    seen_moving,
                } => {
                    let state = status.side(side);
                    let seen_moving = seen_moving || state.is_moving();
                    self.phase = Phase::Moving {
                        side,
                        deadline,
                        from,
                        seen_moving,
                    };
                    if self.reached(state, from, seen_moving) {
                        if self.request.frac >= 1.0 {
                            info!(%side, "Side {}", end_name(direction));
                        } else {
                            info!(%side, frac = self.request.frac, "Side moved requested fraction");
                        }
                        self.phase = Phase::Next;
                        continue;
                    }
                    if state == SideState::Error {
                        return MoveAction::Failed(side);
                    }
                    if deadline.expired() {
                        return MoveAction::TimedOut(side);
                    }
                    return MoveAction::Wait;
                }
            }
        }
    }

    fn start(&mut self, side: DomeSide, from: SideState, timeout: Duration) -> MoveAction {
        info!(%side, "{} side", capitalise(self.request.direction.verb_ing()));
        self.phase = Phase::Moving {
            side,
            deadline: Deadline::new(timeout),
            from,
            seen_moving: false,
        };
        MoveAction::Start {
            side,
            direction: self.request.direction,
            frac: self.request.frac,
        }
    }
}

fn end_name(direction: MoveDirection) -> &'static str {
    match direction {
        MoveDirection::Open => "open",
        MoveDirection::Close => "closed",
    }
}

fn capitalise(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(a: SideState, b: SideState) -> DomeStatus {
        DomeStatus {
            a_side: a,
            b_side: b,
            hatch_open: false,
        }
    }

    const LONG: Duration = Duration::from_secs(60);

    #[test]
    fn test_side_order() {
        assert_eq!(
            MoveSide::Both.sequence(MoveDirection::Open),
            vec![DomeSide::ASide, DomeSide::BSide]
        );
        assert_eq!(
            MoveSide::Both.sequence(MoveDirection::Close),
            vec![DomeSide::BSide, DomeSide::ASide]
        );
    }

    #[test]
    fn test_narrow() {
        use SideState::*;
        let open = MoveDirection::Open;
        assert_eq!(MoveSide::Both.narrow(open, FullOpen, FullOpen), None);
        assert_eq!(MoveSide::Both.narrow(open, FullOpen, Closed), Some(MoveSide::BSide));
        assert_eq!(MoveSide::Both.narrow(open, PartOpen, FullOpen), Some(MoveSide::ASide));
        assert_eq!(
            MoveSide::Both.narrow(MoveDirection::Close, PartOpen, Closing),
            Some(MoveSide::Both)
        );
        assert_eq!(MoveSide::ASide.narrow(MoveDirection::Close, Closed, FullOpen), None);
    }

    #[test]
    fn test_request_validation() {
        assert!(MoveRequest::new(MoveDirection::Open, MoveSide::Both, 0.0).is_err());
        assert!(MoveRequest::new(MoveDirection::Open, MoveSide::Both, 1.5).is_err());
        assert!(MoveRequest::new(MoveDirection::Open, MoveSide::Both, 0.5).is_ok());
        assert!("c_side".parse::<MoveSide>().is_err());
    }

    #[test]
    fn test_close_both_without_alarm() {
        use SideState::*;
        let now = Instant::now();
        let mut mv = ActiveMove::new(MoveRequest::full(MoveDirection::Close));

        let action = mv.poll(&status(FullOpen, FullOpen), false, Duration::ZERO, LONG, now);
        assert_eq!(
            action,
            MoveAction::Start {
                side: DomeSide::BSide,
                direction: MoveDirection::Close,
                frac: 1.0
            }
        );
        assert_eq!(
            mv.poll(&status(FullOpen, Closing), false, Duration::ZERO, LONG, now),
            MoveAction::Wait
        );
        // B closed, A starts in the same poll
        assert!(matches!(
            mv.poll(&status(FullOpen, Closed), false, Duration::ZERO, LONG, now),
            MoveAction::Start {
                side: DomeSide::ASide,
                ..
            }
        ));
        assert_eq!(
            mv.poll(&status(Closed, Closed), false, Duration::ZERO, LONG, now),
            MoveAction::Finished
        );
    }

    #[test]
    fn test_alarm_then_settle() {
        use SideState::*;
        let now = Instant::now();
        let settle = Duration::from_secs(5);
        let mut mv = ActiveMove::new(MoveRequest::full(MoveDirection::Open));
        let closed = status(Closed, Closed);

        assert_eq!(
            mv.poll(&closed, true, settle, LONG, now),
            MoveAction::SoundAlarm(DomeSide::ASide)
        );
        assert_eq!(mv.info().phase, MovePhase::Settling);
        assert_eq!(
            mv.poll(&closed, true, settle, LONG, now + Duration::from_secs(1)),
            MoveAction::Wait
        );
        assert!(matches!(
            mv.poll(&closed, true, settle, LONG, now + settle),
            MoveAction::Start {
                side: DomeSide::ASide,
                ..
            }
        ));
    }

    #[test]
    fn test_already_there_is_skipped() {
        use SideState::*;
        let mut mv = ActiveMove::new(MoveRequest::full(MoveDirection::Open));
        assert_eq!(
            mv.poll(&status(FullOpen, FullOpen), true, LONG, LONG, Instant::now()),
            MoveAction::Finished
        );
    }

    #[test]
    fn test_timeout() {
        use SideState::*;
        let mut mv = ActiveMove::new(MoveRequest::full(MoveDirection::Open));
        let now = Instant::now();
        let closed = status(Closed, Closed);
        assert!(matches!(
            mv.poll(&closed, false, Duration::ZERO, Duration::ZERO, now),
            MoveAction::Start { .. }
        ));
        // The side never leaves closed
        assert_eq!(
            mv.poll(&closed, false, Duration::ZERO, Duration::ZERO, now),
            MoveAction::TimedOut(DomeSide::ASide)
        );
    }

    #[test]
    fn test_partial_close_completes_when_stopped() {
        use SideState::*;
        let request = MoveRequest::new(MoveDirection::Close, MoveSide::ASide, 0.5).unwrap();
        let mut mv = ActiveMove::new(request);
        let now = Instant::now();
        assert!(matches!(
            mv.poll(&status(FullOpen, Closed), false, Duration::ZERO, LONG, now),
            MoveAction::Start { frac, .. } if frac == 0.5
        ));
        assert_eq!(
            mv.poll(&status(Closing, Closed), false, Duration::ZERO, LONG, now),
            MoveAction::Wait
        );
        assert_eq!(
            mv.poll(&status(PartOpen, Closed), false, Duration::ZERO, LONG, now),
            MoveAction::Finished
        );
    }

    #[test]
    fn test_partial_move_ignores_stale_reading() {
        use SideState::*;
        let request = MoveRequest::new(MoveDirection::Close, MoveSide::ASide, 0.5).unwrap();
        let mut mv = ActiveMove::new(request);
        let now = Instant::now();
        let open = status(FullOpen, Closed);
        assert!(matches!(
            mv.poll(&open, false, Duration::ZERO, LONG, now),
            MoveAction::Start { .. }
        ));
        // The first reading after the start still shows the old state
        assert_eq!(mv.poll(&open, false, Duration::ZERO, LONG, now), MoveAction::Wait);
        assert_eq!(
            mv.poll(&status(PartOpen, Closed), false, Duration::ZERO, LONG, now),
            MoveAction::Finished
        );
    }

    #[test]
    fn test_partial_move_of_stuck_side_times_out() {
        use SideState::*;
        let request = MoveRequest::new(MoveDirection::Open, MoveSide::BSide, 0.3).unwrap();
        let mut mv = ActiveMove::new(request);
        let now = Instant::now();
        let part = status(Closed, PartOpen);
        assert!(matches!(
            mv.poll(&part, false, Duration::ZERO, Duration::ZERO, now),
            MoveAction::Start { .. }
        ));
        assert_eq!(
            mv.poll(&part, false, Duration::ZERO, Duration::ZERO, now),
            MoveAction::TimedOut(DomeSide::BSide)
        );
    }

    #[test]
    fn test_partial_move_from_same_state_finishes_after_moving() {
        use SideState::*;
        let request = MoveRequest::new(MoveDirection::Open, MoveSide::BSide, 0.3).unwrap();
        let mut mv = ActiveMove::new(request);
        let now = Instant::now();
        let part = status(Closed, PartOpen);
        mv.poll(&part, false, Duration::ZERO, LONG, now);
        assert_eq!(
            mv.poll(&status(Closed, Opening), false, Duration::ZERO, LONG, now),
            MoveAction::Wait
        );
        assert_eq!(mv.poll(&part, false, Duration::ZERO, LONG, now), MoveAction::Finished);
    }
}
