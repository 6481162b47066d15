//! CLI command handling

pub mod check;
pub mod output;
pub mod reconcile;
pub mod replay;
pub mod run;

pub use check::*;
pub use output::*;
pub use reconcile::*;
pub use replay::*;
pub use run::*;
