pub mod allocations;
pub mod backup;
pub mod catalog;
pub mod classes;
pub mod core;
pub mod setup;
pub mod substitutions;
pub mod timetable;
