//! Listener side: polls the station and keeps a local playback engine in
//! step with it.

pub mod api;
pub mod engine;
pub mod listener;
pub mod session;

pub use api::{HttpRadioApi, RadioApi};
pub use engine::{EngineEvent, LoadId, PlaybackEngine, SimulatedEngine};
pub use listener::{query_status, run, Command, Status};
pub use session::{Action, Purpose, Session, SessionState, Tuning};
