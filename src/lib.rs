//! Conveyor - message bus runtime
//!
//! Routes published and sent messages through an AMQP-style broker to
//! handlers, process managers (sagas), aggregators and request/reply
//! callbacks, with retry, dead-lettering and audit.

pub mod aggregator;
pub mod broker;
pub mod bus;
pub mod client;
pub mod config;
pub mod handlers;
pub mod message;
pub mod pipeline;
pub mod process_manager;
pub mod producer;
pub mod storage;
pub mod utils;

#[cfg(test)]
pub(crate) mod test_utils;

pub use bus::{Bus, BusBuilder, BusError};
pub use handlers::{ConsumeContext, HandlerError, MessageHandler};
pub use message::{Envelope, Message, MessageHeaders, MessageKind};
pub use process_manager::{
    ProcessInstance, ProcessManager, ProcessManagerData, ProcessManagerHandler,
    StartProcessManager,
};
