pub mod appointment;
pub mod auth;
pub mod calendar;
pub mod database;
pub mod invite;
pub mod mailer;
pub mod notification;
pub mod reminder;
pub mod store;

// Commonly used types
pub use appointment::AppointmentService;
pub use auth::AuthService;
pub use calendar::{CalendarMirror, CalendarSync};
pub use database::Database;
pub use invite::InviteService;
pub use notification::{NotificationDispatcher, NotificationService};
pub use reminder::{ReminderHandle, ReminderScheduler};
pub use store::{AppointmentStore, NotificationStore};
