pub mod command;
pub mod records;
