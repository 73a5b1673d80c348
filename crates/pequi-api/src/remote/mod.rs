//! Wire models for peer-to-peer communication

pub mod model;

pub use model::{Frame, ObjectSnapshot, PeerCredentials};
