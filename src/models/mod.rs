pub mod member;
pub mod round;
pub mod tournament;

pub use member::*;
pub use round::*;
pub use tournament::*;
