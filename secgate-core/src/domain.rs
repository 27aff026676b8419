pub mod policy;
pub mod presets;
pub mod context;
pub mod decision;

pub use policy::*;
pub use presets::*;
pub use context::*;
pub use decision::*;
