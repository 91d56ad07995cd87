//! Request gates: a throttle check plus an optional challenge, composed into
//! a single guard for a sensitive operation.

mod challenge;
mod composer;
mod outcome;
mod request;

pub use challenge::{ChallengeVerdict, ChallengeVerifier};
pub use composer::{
    CheckOrder, Gate, GateComposer, GateOptions, KeyFn, StoreErrorPolicy,
    DEFAULT_CHALLENGE_TIMEOUT_MS,
};
pub use outcome::{Degradation, GateOutcome, GateReason, OutcomeBody};
pub use request::{keys, ActionRequest, GateRequest};
