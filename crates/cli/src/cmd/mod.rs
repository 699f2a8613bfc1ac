mod apply;
mod check;
mod plan;

pub use apply::cmd_apply;
pub use check::cmd_check;
pub use plan::cmd_plan;
