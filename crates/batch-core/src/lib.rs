pub mod address;
pub mod address_map;
pub mod command;
pub mod session_state;
pub mod snapshot;
pub mod tags;
pub mod timebase;

pub use address::{
    AddressParseError, ModbusAddress, PhysicalAddress, Protocol, S7Address, S7Area, S7Width,
};
pub use address_map::{AddressMap, AddressMapError, UnknownTagError};
pub use command::{
    start_permitted, CommandKind, CommandLimits, Rejection, Unvalidated, Validated,
    ValidationError, WriteCommand,
};
pub use session_state::{SessionEvent, SessionState};
pub use snapshot::{PlantSnapshot, Reading, TagValue, ERROR_MARKER};
pub use tags::{LogicalTag, TagRole};
pub use timebase::TimeBase;
