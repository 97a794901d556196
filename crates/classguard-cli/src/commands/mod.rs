pub mod agent;
pub mod check;
pub mod config;
pub mod helpers;
pub mod init;
pub mod manifest;
pub mod rules;
