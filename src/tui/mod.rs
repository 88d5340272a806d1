//! Terminal dashboard for long-running commands

mod dashboard;

pub use dashboard::ProgressDashboard;
