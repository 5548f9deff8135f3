/// Preserves codec for value trees
pub mod io_value;
