pub mod api;
pub mod config;
pub mod crypto;
pub mod db;
pub mod email;
pub mod error;
pub mod sync;
