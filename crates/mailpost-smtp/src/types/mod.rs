//! Core SMTP types.

mod address;
mod capability;
mod reply;

pub use address::{AddressListParser, Mailbox, SimpleAddressParser};
pub use capability::{AuthMechanism, Capabilities};
pub use reply::{Reply, ReplyCode};
