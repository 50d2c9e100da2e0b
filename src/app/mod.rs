pub mod config;
pub mod control;
pub mod events;
pub mod replay;

pub use config::{Config, MonitorConfig};
pub use control::{ControlLoop, LoopError, LoopState};
pub use events::{intent_for_key, HeadlessIntents, Intent, IntentSource, TerminalIntents};
pub use replay::replay;
