pub mod config;
pub mod dtos;
pub mod models;
pub mod services;
pub mod startup;
pub mod workers;
