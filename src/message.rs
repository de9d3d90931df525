use std::time::{Duration, Instant};

use crate::arch::{CpuState, Word};
use crate::error::Result;
use crate::kernel::{PortId, TeamId, ThreadId};
use crate::memory::AreaId;

/// Identifies where a debug event came from and where to send commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebugOrigin {
    pub thread: Option<ThreadId>,
    pub team: TeamId,
    pub nub_port: Option<PortId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionKind {
    NonMaskable,
    MachineCheck,
    Segmentation,
    BusError,
    Unaligned,
    IllegalInstruction,
    DivideByZero,
    FloatingPoint,
    GeneralProtection,
    PageFault,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInfo {
    pub id: i32,
    pub name: String,
    pub text: Word,
    pub text_size: usize,
    pub data: Word,
    pub data_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalHandler {
    Default,
    Ignore,
    Handler(Word),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalAction {
    pub handler: SignalHandler,
    pub mask: u64,
    pub flags: u32,
}

impl Default for SignalAction {
    fn default() -> Self {
        Self {
            handler: SignalHandler::Default,
            mask: 0,
            flags: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProfilerUpdate {
    pub image_event: u32,
    pub stack_depth: u32,
    pub variable_stack_depth: bool,
    pub sample_count: usize,
    pub dropped_ticks: u32,
    pub stopped: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DebugEvent {
    ThreadDebugged,
    DebuggerCall {
        message: Option<String>,
    },
    BreakpointHit {
        cpu: CpuState,
        software: bool,
    },
    WatchpointHit {
        cpu: CpuState,
        address: Word,
    },
    SingleStep {
        cpu: CpuState,
    },
    PreSyscall {
        syscall: u32,
        args: Vec<Word>,
    },
    PostSyscall {
        syscall: u32,
        args: Vec<Word>,
        return_value: u64,
        start_time: Instant,
        end_time: Instant,
    },
    SignalReceived {
        signal: i32,
        action: SignalAction,
        deadly: bool,
    },
    ExceptionOccurred {
        exception: ExceptionKind,
        signal: i32,
    },
    TeamCreated {
        new_team: TeamId,
    },
    TeamDeleted,
    TeamExec {
        image_event: u32,
    },
    ThreadCreated {
        new_thread: ThreadId,
    },
    ThreadDeleted,
    ImageCreated {
        info: ImageInfo,
        image_event: u32,
    },
    ImageDeleted {
        info: ImageInfo,
        image_event: u32,
    },
    ProfilerUpdate(ProfilerUpdate),
    HandedOver {
        debugger: TeamId,
        debugger_port: PortId,
        causing_thread: Option<ThreadId>,
    },
}

impl DebugEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ThreadDebugged => "thread debugged",
            Self::DebuggerCall { .. } => "debugger call",
            Self::BreakpointHit { .. } => "breakpoint hit",
            Self::WatchpointHit { .. } => "watchpoint hit",
            Self::SingleStep { .. } => "single step",
            Self::PreSyscall { .. } => "pre syscall",
            Self::PostSyscall { .. } => "post syscall",
            Self::SignalReceived { .. } => "signal received",
            Self::ExceptionOccurred { .. } => "exception occurred",
            Self::TeamCreated { .. } => "team created",
            Self::TeamDeleted => "team deleted",
            Self::TeamExec { .. } => "team exec",
            Self::ThreadCreated { .. } => "thread created",
            Self::ThreadDeleted => "thread deleted",
            Self::ImageCreated { .. } => "image created",
            Self::ImageDeleted { .. } => "image deleted",
            Self::ProfilerUpdate(_) => "profiler update",
            Self::HandedOver { .. } => "handed over",
        }
    }
}

/// Message delivered to a debugger's port.
#[derive(Debug, Clone, PartialEq)]
pub struct DebuggerMessage {
    pub origin: DebugOrigin,
    pub event: DebugEvent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalMaskOp {
    And,
    Or,
    Set,
}

impl SignalMaskOp {
    pub fn apply(self, mask: &mut u64, value: u64) {
        match self {
            Self::And => *mask &= value,
            Self::Or => *mask |= value,
            Self::Set => *mask = value,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventDisposition {
    /// Let the kernel process the event normally (deliver the signal, ...).
    Handle,
    /// Swallow the event.
    Ignore,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NubCommand {
    ReadMemory {
        address: Word,
        size: usize,
    },
    WriteMemory {
        address: Word,
        data: Vec<u8>,
    },
    SetTeamFlags {
        flags: u32,
    },
    SetThreadFlags {
        thread: ThreadId,
        flags: u32,
    },
    ContinueThread {
        thread: ThreadId,
        disposition: EventDisposition,
        single_step: bool,
    },
    SetCpuState {
        thread: ThreadId,
        cpu: CpuState,
    },
    GetCpuState {
        thread: ThreadId,
    },
    SetBreakpoint {
        address: Word,
    },
    ClearBreakpoint {
        address: Word,
    },
    SetWatchpoint {
        address: Word,
        kind: u32,
        length: usize,
    },
    ClearWatchpoint {
        address: Word,
    },
    SetSignalMasks {
        thread: ThreadId,
        ignore: u64,
        ignore_op: SignalMaskOp,
        ignore_once: u64,
        ignore_once_op: SignalMaskOp,
    },
    GetSignalMasks {
        thread: ThreadId,
    },
    SetSignalHandler {
        thread: ThreadId,
        signal: i32,
        action: SignalAction,
    },
    GetSignalHandler {
        thread: ThreadId,
        signal: i32,
    },
    PrepareHandover,
    HandedOver,
    StartProfiler {
        thread: ThreadId,
        interval: Duration,
        sample_area: AreaId,
        stack_depth: u32,
        variable_stack_depth: bool,
    },
    StopProfiler {
        thread: ThreadId,
    },
}

impl NubCommand {
    pub fn opcode(&self) -> &'static str {
        match self {
            Self::ReadMemory { .. } => "READ_MEMORY",
            Self::WriteMemory { .. } => "WRITE_MEMORY",
            Self::SetTeamFlags { .. } => "SET_TEAM_FLAGS",
            Self::SetThreadFlags { .. } => "SET_THREAD_FLAGS",
            Self::ContinueThread { .. } => "CONTINUE_THREAD",
            Self::SetCpuState { .. } => "SET_CPU_STATE",
            Self::GetCpuState { .. } => "GET_CPU_STATE",
            Self::SetBreakpoint { .. } => "SET_BREAKPOINT",
            Self::ClearBreakpoint { .. } => "CLEAR_BREAKPOINT",
            Self::SetWatchpoint { .. } => "SET_WATCHPOINT",
            Self::ClearWatchpoint { .. } => "CLEAR_WATCHPOINT",
            Self::SetSignalMasks { .. } => "SET_SIGNAL_MASKS",
            Self::GetSignalMasks { .. } => "GET_SIGNAL_MASKS",
            Self::SetSignalHandler { .. } => "SET_SIGNAL_HANDLER",
            Self::GetSignalHandler { .. } => "GET_SIGNAL_HANDLER",
            Self::PrepareHandover => "PREPARE_HANDOVER",
            Self::HandedOver => "HANDED_OVER",
            Self::StartProfiler { .. } => "START_PROFILER",
            Self::StopProfiler { .. } => "STOP_PROFILER",
        }
    }
}

/// Message sent by a debugger to a team's nub port.
#[derive(Debug, Clone, PartialEq)]
pub struct NubMessage {
    pub reply_port: Option<PortId>,
    pub command: NubCommand,
}

impl NubMessage {
    pub fn new(command: NubCommand) -> Self {
        Self {
            reply_port: None,
            command,
        }
    }

    pub fn with_reply(command: NubCommand, reply_port: PortId) -> Self {
        Self {
            reply_port: Some(reply_port),
            command,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalMasks {
    pub ignore: u64,
    pub ignore_once: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NubReply {
    /// Contains only the bytes actually read.
    ReadMemory(Result<Vec<u8>>),
    WriteMemory(Result<usize>),
    CpuState(Result<CpuState>),
    SignalMasks(Result<SignalMasks>),
    SignalHandler(Result<SignalAction>),
    StartProfiler(Result<Duration>),
    StopProfiler(Result<ProfilerUpdate>),
    Status(Result<()>),
}

impl NubReply {
    pub fn status(&self) -> Result<()> {
        match self {
            Self::ReadMemory(r) => r.as_ref().map(|_| ()).map_err(|e| *e),
            Self::WriteMemory(r) => r.map(|_| ()),
            Self::CpuState(r) => r.as_ref().map(|_| ()).map_err(|e| *e),
            Self::SignalMasks(r) => r.map(|_| ()),
            Self::SignalHandler(r) => r.map(|_| ()),
            Self::StartProfiler(r) => r.map(|_| ()),
            Self::StopProfiler(r) => r.map(|_| ()),
            Self::Status(r) => *r,
        }
    }
}

/// Command delivered to a stopped thread's private port.
#[derive(Debug, Clone, PartialEq)]
pub enum ThreadCommand {
    Continue {
        disposition: EventDisposition,
        single_step: bool,
    },
    SetCpuState(CpuState),
    GetCpuState {
        reply_port: PortId,
    },
    DebuggerChanged,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Debugger(DebuggerMessage),
    Nub(NubMessage),
    Reply(NubReply),
    Thread(ThreadCommand),
}

impl From<DebuggerMessage> for Message {
    fn from(m: DebuggerMessage) -> Self {
        Self::Debugger(m)
    }
}

impl From<NubMessage> for Message {
    fn from(m: NubMessage) -> Self {
        Self::Nub(m)
    }
}

impl From<NubReply> for Message {
    fn from(m: NubReply) -> Self {
        Self::Reply(m)
    }
}

impl From<ThreadCommand> for Message {
    fn from(m: ThreadCommand) -> Self {
        Self::Thread(m)
    }
}
