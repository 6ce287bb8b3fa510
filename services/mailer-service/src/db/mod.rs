pub mod dead_letter_repository;
pub mod mailing_entry_repository;
pub mod mailing_repository;

pub use dead_letter_repository::{DeadLetterRepository, SqlxDeadLetterRepository};
pub use mailing_entry_repository::{
    MailingEntryRepository, SqlxMailingEntryRepository, StatusCounts,
};
pub use mailing_repository::{LockOutcome, MailingRepository, NewMailing, SqlxMailingRepository};
