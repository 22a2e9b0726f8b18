pub mod agents;
pub mod config;
pub mod db;
pub mod decision;
pub mod errors;
pub mod messages;
pub mod models;
pub mod pipeline;
pub mod registry;
pub mod repo;
pub mod telemetry;
pub mod web;
