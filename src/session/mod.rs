//! Serial port session management

pub mod manager;
pub mod object;
pub mod registry;
pub mod state;

pub use manager::{BindRequest, Collaborators, ConnectRequest, PortManager, TeardownCause};
pub use object::{MethodReply, PortObject, PORT_INTERFACE_SPEC};
pub use registry::SessionRegistry;
pub use state::{Collection, Session, SessionSummary};
