mod error;
pub use error::{Error, ErrorResponse, FromUriError, H2ErrorCode, Outcome, Result, TransportError};

pub mod altsvc;
pub mod buffer;
pub mod channel;
pub mod connectors;
pub mod engine;
pub mod events;
pub mod http;
pub mod options;
pub mod origin;
pub mod pool;
pub mod request;
pub mod resolver;
pub mod selector;
pub mod timers;

#[cfg(test)]
mod testing;

pub use engine::{default_retry_policy, Engine};
pub use events::{Event, EventKind};
pub use options::{Options, Timeouts};
pub use origin::{Origin, Scheme};
pub use pool::Pool;
pub use request::{PendingRequest, RequestId};
