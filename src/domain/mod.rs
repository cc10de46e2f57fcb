pub mod body_composition;
pub mod models;
pub mod settings;
