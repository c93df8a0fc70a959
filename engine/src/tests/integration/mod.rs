pub mod persistence;
pub mod scenarios;
