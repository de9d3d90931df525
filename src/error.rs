use thiserror::Error;

use crate::arch::Word;
use crate::kernel::{PortId, TeamId, ThreadId};

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("out of breakpoint or watchpoint resources")]
    ResourceExhausted,
    #[error("breakpoint already exists for address {0:#x}")]
    DuplicateBreakpoint(Word),
    #[error("no breakpoint installed at {0:#x}")]
    NoBreakpoint(Word),
    #[error("address {0:#x} is not accessible")]
    BadAddress(Word),
    #[error("bad value")]
    BadValue,
    #[error("unable to set watchpoint using type {0:#x}")]
    InvalidWatchpointType(u32),
    #[error("unable to set watchpoint using length {0}")]
    InvalidWatchpointLength(usize),
    #[error("operation not allowed")]
    NotAllowed,
    #[error("resource busy")]
    Busy,
    #[error("thread `{0}` is not stopped")]
    StateError(ThreadId),
    #[error("no such port `{0}`")]
    BadPortId(PortId),
    #[error("no such team `{0}`")]
    BadTeamId(TeamId),
    #[error("no such thread `{0}`")]
    BadThreadId(ThreadId),
    #[error("no debugger installed for team `{0}`")]
    NoDebugger(TeamId),
    #[error("operation timed out")]
    TimedOut,
    #[error("interrupted by kill")]
    Interrupted,
}

pub type Result<T> = std::result::Result<T, Error>;
