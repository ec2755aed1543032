mod session_endpoints;
mod terminal_endpoints;
mod usage_endpoints;
