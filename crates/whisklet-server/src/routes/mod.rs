pub mod diagnostics;
pub mod dispatch;
