pub mod agent_client;
pub mod api;
pub mod command;
pub mod config;
pub mod dbus_service;
pub mod http_response;
pub mod middleware;
pub mod services;
