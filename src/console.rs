//! Kernel console output and the logging macros.
//!
//! On bare metal everything is mirrored to the VGA text buffer and the
//! first serial port; on hosted builds the sink is stdout, which is also
//! what lets the test harness capture kernel output.

use core::fmt;

#[doc(hidden)]
#[cfg(target_os = "none")]
pub fn _print(args: fmt::Arguments) {
    use core::fmt::Write;
    let _ = crate::vga::WRITER.lock().write_fmt(args);
    let _ = crate::serial::SERIAL1.lock().write_fmt(args);
}

#[doc(hidden)]
#[cfg(not(target_os = "none"))]
pub fn _print(args: fmt::Arguments) {
    std::print!("{}", args);
}

#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ($crate::console::_print(format_args!($($arg)*)));
}

#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::console::_print(format_args!("[INFO] "));
        $crate::console::_print(format_args!($($arg)*));
        $crate::console::_print(format_args!("\n"));
    };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        $crate::console::_print(format_args!("[WARN] "));
        $crate::console::_print(format_args!($($arg)*));
        $crate::console::_print(format_args!("\n"));
    };
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        $crate::console::_print(format_args!("[ERROR] "));
        $crate::console::_print(format_args!($($arg)*));
        $crate::console::_print(format_args!("\n"));
    };
}
