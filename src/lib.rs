//! stationsync: a simulated radio station. The server answers "what is
//! playing now, and how far in" from a stored schedule reference; listeners
//! poll that answer and keep their own audio engine in step with it.

pub mod api;
pub mod client;
pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod playlist;
pub mod schedule;
pub mod station;
pub mod store;
pub mod track;
