pub mod health;
pub mod jobs;
pub mod migrations;
pub mod origin;
pub mod videos;
