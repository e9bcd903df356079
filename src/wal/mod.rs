// Write-ahead logging: record framing, the segmented log itself, and the
// mini-transaction unit that groups page modifications into one atomic
// log write.

pub mod log;
pub mod mtr;
pub mod record;

pub use log::{Wal, WalReader};
pub use mtr::MiniTransaction;
pub use record::{WalPayload, WalRecord, WalRecordType};
