pub mod constraint_container;
pub mod long_range_constraints;
pub mod spring_constraints;
pub mod xpbd_spring_constraints;

pub use constraint_container::*;
pub use long_range_constraints::*;
pub use spring_constraints::*;
pub use xpbd_spring_constraints::*;
