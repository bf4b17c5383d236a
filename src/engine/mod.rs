//! Everything needed to run and talk to the external scan engine.

pub mod api;
pub mod process;
pub mod transport;

pub use api::EngineApi;
pub use process::{EngineLauncher, EngineProcess, LaunchSpec, ProcessSupervisor};
pub use transport::{CallKind, EngineTransport, HttpTransport};
