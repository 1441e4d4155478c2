pub mod console;
pub mod list;
pub mod send;
pub mod watch;
