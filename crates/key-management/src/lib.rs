pub mod config;
pub mod error;
pub mod logic;
pub mod repository;
