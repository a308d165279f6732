pub mod app;
pub mod broker;
pub mod listener;
pub mod notify;
