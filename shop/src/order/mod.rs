//! Orders: multi-resource checkout and the completion outbox.

mod command;
mod error;
mod event;
mod model;
mod service;

pub use command::CreateOrderCommand;
pub use error::OrderError;
pub use event::OrderCompleted;
pub use model::{Order, OrderItem, OrderStatus, OutboxEvent};
pub use service::OrderService;
