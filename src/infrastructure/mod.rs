// Infrastructure layer
pub mod file_system;
pub mod node_resolver;
pub mod oxc_compiler;

pub use file_system::*;
pub use node_resolver::*;
pub use oxc_compiler::*;
