pub mod json_file;
pub mod middleware;
pub mod serde_helpers;
pub mod time;
pub mod validation;
