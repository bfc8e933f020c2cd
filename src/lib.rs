pub use callcore;

pub mod types {
    pub mod events;
}

pub mod calls;
pub mod config;
pub mod transport;

pub use calls::{CallController, CallControllerHandle, CallError};
pub use config::{CallControllerConfig, RejectPolicy};
