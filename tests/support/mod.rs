pub mod helpers;
pub mod scripted;
