pub mod audit;
pub mod kill_switch;
pub mod operations;
pub mod relay;
