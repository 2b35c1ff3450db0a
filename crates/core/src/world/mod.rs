//! Heat world model, file encodings and demo generation

mod generate;
mod grid;
pub mod io;

pub use generate::{generate_world, GeneratorConfig};
pub use grid::{CellFlags, HeatWorld};
pub use io::{load_world, read_world, save_world, write_world, WorldFormat};
