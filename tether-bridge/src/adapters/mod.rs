pub mod credentials;
pub mod http_agent;
pub mod relay_socket;
