pub mod driver;
pub mod matching;
pub mod ride;
