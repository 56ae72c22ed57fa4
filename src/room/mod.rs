//! Room session orchestration.

mod session;
mod state;

pub use session::RoomSession;
pub use state::{Roster, SessionState};
