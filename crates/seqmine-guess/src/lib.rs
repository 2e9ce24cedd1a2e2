pub mod dispatch;
pub mod engine;
pub mod xref;

pub use dispatch::{DispatchConfig, Dispatcher};
pub use engine::{EngineError, GuessEngine, SandboxedEngine};
pub use xref::{pair_key, XrefMatcher, XrefReport};
