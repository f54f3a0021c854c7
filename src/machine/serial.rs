/*
 * COM1 Serial Port
 *
 * Minimal 16550 UART driver used as the kernel's log sink. Polled transmit
 * only; the kernel never reads from the port.
 */

use lazy_static::lazy_static;
use spin::Mutex;
use x86_64::instructions::port::Port;

pub struct SerialPort {
    data: Port<u8>,
    int_en: Port<u8>,
    fifo_ctrl: Port<u8>,
    line_ctrl: Port<u8>,
    modem_ctrl: Port<u8>,
    line_sts: Port<u8>,
}

impl SerialPort {
    pub const unsafe fn new(base: u16) -> SerialPort {
        SerialPort {
            data: Port::new(base),
            int_en: Port::new(base + 1),
            fifo_ctrl: Port::new(base + 2),
            line_ctrl: Port::new(base + 3),
            modem_ctrl: Port::new(base + 4),
            line_sts: Port::new(base + 5),
        }
    }

    /// 38400 baud, 8N1, FIFOs on, interrupts off (we poll).
    pub fn init(&mut self) {
        unsafe {
            self.int_en.write(0x00);
            self.line_ctrl.write(0x80); // DLAB on
            self.data.write(0x03); // divisor low
            self.int_en.write(0x00); // divisor high
            self.line_ctrl.write(0x03); // 8N1, DLAB off
            self.fifo_ctrl.write(0xC7);
            self.modem_ctrl.write(0x0B);
        }
    }

    pub fn send(&mut self, byte: u8) {
        unsafe {
            while (self.line_sts.read() & 0x20) == 0 {}
            self.data.write(byte);
        }
    }
}

impl core::fmt::Write for SerialPort {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        for byte in s.bytes() {
            self.send(byte);
        }
        Ok(())
    }
}

lazy_static! {
    pub static ref COM1: Mutex<SerialPort> = {
        let mut port = unsafe { SerialPort::new(0x3F8) };
        port.init();
        Mutex::new(port)
    };
}

#[doc(hidden)]
pub fn _print(args: core::fmt::Arguments) {
    use core::fmt::Write;
    // Keep the alarm out of the port while a line is being emitted, so a
    // preempting thread cannot interleave its own output mid-line.
    x86_64::instructions::interrupts::without_interrupts(|| {
        COM1.lock().write_fmt(args).ok();
    });
}

pub fn init() {
    let _ = COM1.lock();
}
