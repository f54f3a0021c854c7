/// Raw serial output, bypassing the `log` facade. The logger itself and the
/// test summary printer are the intended users; kernel code logs through
/// `log::info!` and friends.
#[macro_export]
macro_rules! serial_print {
    ($($arg:tt)*) => {
        $crate::machine::serial::_print(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! serial_println {
    () => { $crate::serial_print!("\n") };
    ($($arg:tt)*) => {
        $crate::machine::serial::_print(format_args!($($arg)*));
        $crate::serial_print!("\n");
    };
}
