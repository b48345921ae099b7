pub mod deployment;
pub mod login;
