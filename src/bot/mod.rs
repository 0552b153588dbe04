pub mod handlers;
pub mod keyboards;
pub mod throttle;
