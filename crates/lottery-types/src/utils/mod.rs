//! Small helpers shared by every crate in the workspace.

pub mod formatting;
pub mod time;

pub use formatting::{is_address_like, truncate_id, with_0x_prefix, without_0x_prefix};
pub use time::{current_timestamp, current_timestamp_millis};
