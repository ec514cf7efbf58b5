pub mod ids;
pub mod options;
pub mod result;

pub use ids::RunId;
pub use options::*;
pub use result::*;
