//! Ports: the seams to the outside world (engine, time).

pub mod clock;
pub mod gateway;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::gateway::{EngineGateway, FetchRequest};
