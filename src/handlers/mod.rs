pub mod access;
pub mod generate;
pub mod health;
