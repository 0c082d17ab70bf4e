//! Background tasks

pub mod history_cleanup;
