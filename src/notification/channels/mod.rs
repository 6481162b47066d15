//! 具体投递渠道

pub mod local_file;
pub mod sendmail;

pub use local_file::LocalFileMailer;
pub use sendmail::{SendmailConfig, SendmailMailer};
