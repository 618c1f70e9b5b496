//! REST API controllers.

pub mod health_controller;
pub mod queues_controller;
