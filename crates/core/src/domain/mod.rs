pub mod credential;
pub mod policy;
pub mod request_log;
pub mod run;
pub mod team;
