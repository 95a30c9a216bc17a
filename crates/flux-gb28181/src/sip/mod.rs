// GB28181 SIP 信令

pub mod dispatcher;
pub mod manscdp;
pub mod message;
pub mod querier;
pub mod server;
pub mod transport;

pub use dispatcher::SipDispatcher;
pub use manscdp::{CmdType, ManscdpMessage};
pub use message::{Headers, SipMessage, SipMethod, SipRequest, SipResponse};
pub use querier::SipQuerier;
pub use server::SipServer;
pub use transport::SipTransport;
