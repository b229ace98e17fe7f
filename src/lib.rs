//! Borg: a job queue with a control plane ("mothership") and agents ("solder").

pub mod agent;
pub mod api;
pub mod auth;
pub mod blob;
pub mod config;
pub mod error;
pub mod events;
pub mod jobs;
pub mod runners;
pub mod screen;
