pub mod loader;
pub mod member_event;
pub mod messenger;
pub mod net_search;
pub mod timeout;
