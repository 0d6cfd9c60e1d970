pub mod health;
pub mod pending;
pub mod registry;
pub mod relay_hub;
pub mod router;
