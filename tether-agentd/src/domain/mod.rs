pub mod audit;
pub mod grant;
pub mod output;
