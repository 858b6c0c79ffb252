mod app;
mod dead_letters;

pub use app::{app, AppState};

#[cfg(test)]
pub(crate) mod testing;
