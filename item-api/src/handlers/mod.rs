mod app;
mod items;
mod process;

pub use app::{add_routes, AppState};
