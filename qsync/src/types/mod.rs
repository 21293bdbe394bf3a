mod node;
mod queue;
mod table;

pub use node::*;
pub use queue::*;
pub use table::*;
