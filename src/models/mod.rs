pub mod batch;
pub mod enums;
pub mod intake;

pub use batch::*;
pub use enums::*;
pub use intake::*;
