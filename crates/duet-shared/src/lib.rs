//! Types shared by every duet crate: identifiers, signaling payloads,
//! constants and the clock abstraction.

pub mod clock;
pub mod constants;
pub mod error;
pub mod protocol;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::IdentityError;
pub use types::{ChatId, MessageId, UserId};
