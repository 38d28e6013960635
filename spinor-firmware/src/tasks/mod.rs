//! Embassy async tasks

pub mod journal;

pub use journal::journal_task;
