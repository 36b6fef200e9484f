pub mod api;
pub mod db;
pub mod models;
pub mod services;
pub mod utils;
