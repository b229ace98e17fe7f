//! Dashboard event fan-out.

pub mod hub;
pub mod model;
pub mod ws;

pub use hub::EventHub;
pub use model::DashboardEvent;
