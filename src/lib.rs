pub mod app;
pub mod process;
pub mod progress;
pub mod ui;
