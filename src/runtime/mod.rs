pub mod executor;
pub mod io;

pub use executor::{ExecutionContext, RuntimeError};
pub use io::{SocketConfigHook, SocketConfigurator};
