//! PLC drivers, session, poll loop, command gateway and the realtime server of the batch plant bridge.

pub mod auth;
pub mod driver;
pub mod fanout;
pub mod gateway;
pub mod metrics;
pub mod modbus;
pub mod poller;
pub mod protocol;
pub mod s7;
pub mod server;
pub mod session;
pub mod sim;

pub use auth::{AuthConfig, AuthError, TokenClaims, TokenValidator};
pub use driver::{DriverError, PlcDriver};
pub use fanout::{ClientId, FanoutHub, Subscription};
pub use gateway::{CommandError, CommandEvent, CommandGateway, CommandObserver, GatewayConfig};
pub use metrics::{init_metrics, serve_metrics};
pub use modbus::{ModbusConfig, ModbusDriver};
pub use poller::{PollStats, Poller};
pub use protocol::{CommandReply, EchoEvent, InboundCommand, InboundMessage, OutboundMessage};
pub use s7::{S7Config, S7Driver};
pub use server::{ServerBuilder, ServerHandle};
pub use session::{Session, SessionConfig, SessionError};
pub use sim::{SimHandle, SimulatedPlc};
