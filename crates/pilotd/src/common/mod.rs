pub mod error;
pub mod setup;
pub mod timeutils;
