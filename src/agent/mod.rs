//! Solder: the agent that claims and executes tasks on a worker machine.

pub mod client;
pub mod downloader;
pub mod executor;
pub mod heartbeat;
pub mod resources;
pub mod runner;
pub mod screen;
pub mod uploader;

pub use client::MothershipClient;
pub use executor::{EXIT_CANCELLED, EXIT_SIGNALED, EXIT_TIMEOUT, ExecutionResult, Executor};
pub use heartbeat::{RESOURCE_SYNC_EVERY, spawn_heartbeat};
pub use resources::ResourceDetector;
pub use runner::{ActiveTasks, Agent};
pub use screen::{CommandFrameSource, FrameSource, spawn_screen_capture};
