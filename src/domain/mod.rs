pub mod forecast;
pub mod model;
pub mod series;
pub mod types;

pub use forecast::*;
pub use model::*;
pub use series::*;
pub use types::*;
