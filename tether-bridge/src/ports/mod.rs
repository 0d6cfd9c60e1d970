pub mod agent_http;
pub mod credentials;
