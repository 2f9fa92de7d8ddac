pub mod event;
pub mod seat;
pub mod lease;

pub use event::{CountDelta, Event, NewEvent, SeatCounts};
pub use lease::{Confirmation, HoldReceipt, LeaseOwner, Released};
pub use seat::{Seat, SeatState};

pub type EventId = i64;
pub type SeatId = i64;
