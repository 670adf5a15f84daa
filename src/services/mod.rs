pub mod control;
pub mod descriptor;
pub mod ssh;
pub mod tunnel;
