pub mod clusters;
pub mod health;
