pub mod arch;
pub mod breakpoint;
pub mod config;
pub mod cpu;
pub mod dispatch;
pub mod error;
pub mod kernel;
pub mod memory;
pub mod message;
pub mod nub;
pub mod port;
pub mod profiler;
pub mod session;
pub mod team;
pub mod thread;

pub use breakpoint::BreakpointManager;
pub use config::Config;
pub use cpu::{Cpu, Step};
pub use dispatch::DebugEventDispatcher;
pub use error::{Error, Result};
pub use kernel::{Kernel, PortId, TeamId, ThreadId};
pub use nub::NubCommandLoop;
pub use session::DebuggerSessionController;
