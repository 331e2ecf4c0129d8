pub mod classification;
pub mod event;
pub mod job;
