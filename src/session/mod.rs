mod averager;
mod manager;

pub use averager::SegmentsAverager;
pub use manager::{BroadcastSession, SessionFactory, SessionManager};
