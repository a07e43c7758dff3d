//! Scheduling core of the legal-aid clinic: appointments, invitations,
//! reminders, notifications and the optional Google Calendar mirror.

pub mod config;
pub mod error;
pub mod models;
pub mod routes;
pub mod services;
pub mod state;
pub mod utils;

pub use config::Config;
pub use error::{AppError, Result};
pub use state::AppState;
