pub mod dead_letter;
pub mod mailing;
pub mod mailing_entry;

pub use dead_letter::DeadLetter;
pub use mailing::{Mailing, MailingStatus};
pub use mailing_entry::{MailingEntry, MailingEntryStatus};
