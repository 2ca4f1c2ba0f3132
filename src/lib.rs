pub mod config;
pub mod errors;
pub mod explorer;
pub mod studio;
