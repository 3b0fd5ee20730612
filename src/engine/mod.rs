pub mod alerts;
pub mod change;
pub mod matching;
pub mod notification;
pub mod pipeline;
#[cfg(test)]
pub(crate) mod testing;
