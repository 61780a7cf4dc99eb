pub mod contact;
pub mod email;
pub mod email_account;
