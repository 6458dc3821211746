pub mod browser;
pub mod captcha;
pub mod core;
pub mod notify;
pub mod orchestrator;
pub mod pacing;
pub mod poll;
pub mod session;

// --- Primary core exports ---
pub use self::core::config;
pub use self::core::types;
pub use self::core::types::*;
pub use self::core::{ErrorKind, SentinelError};

pub use browser::driver::{PageDriver, PageMarker};
pub use captcha::CaptchaSolver;
pub use notify::{Dispatcher, Notifier};
pub use orchestrator::Orchestrator;
pub use pacing::PollPacer;
pub use poll::{filter_slots, SlotPoller};
pub use session::{LoginState, SessionConfig, SessionHandle, SessionMachine};
