pub mod dispatcher;
pub mod state;
mod stats;
mod timers;

pub use dispatcher::{dispatch, dispatch_put, DispatchReply};
pub use state::Broker;
