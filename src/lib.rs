//! Lead funnel: conversational quote funnel with durable lead delivery.

pub mod api;
pub mod config;
pub mod delivery;
pub mod error;
pub mod funnel;
pub mod lead;
pub mod services;
pub mod store;
