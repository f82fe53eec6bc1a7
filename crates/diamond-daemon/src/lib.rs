//! HTTP surface for the diamond pipeline: operator triggers, analytics
//! queries, pricing/rating rule management, and the storefront surface
//! (spec §6). A thin `main.rs` wires real adapters into `state::AppState`;
//! `routes::build_router` owns the actual route table.

pub mod analytics_query;
pub mod api_types;
pub mod auth;
pub mod error;
pub mod routes;
pub mod state;
