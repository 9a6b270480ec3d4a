// SPDX-License-Identifier: AGPL-3.0-only
//! Request processing core: the per-request state machine, the multi-round
//! session state store, and reply status mapping. Wire I/O and policy
//! interpretation live in their own crates; this one drives them.

pub mod machine;
pub mod request;
pub mod state;
pub mod status;

pub use machine::{
    Hook, Interpretation, MachineCtx, Outcome, PolicyRunner, RunStatus, SectionId, Signal,
    state_add,
};
pub use request::{
    ConnectionId, MasterState, Packet, Phase, Request, RequestData, ScheduledSection, SessionData,
};
pub use state::{EntryInfo, StateStore, TOKEN_LEN, Token};
