//! One module per API area, each exposing a `router()` nested under `/api`

pub mod admin;
pub mod analysis;
pub mod attachments;
pub mod auth;
pub mod dashboard;
pub mod gmail;
pub mod ip;
pub mod sandbox;
pub mod user;
