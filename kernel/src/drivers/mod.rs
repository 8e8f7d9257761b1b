//! Device drivers: mini UART, mailbox, framebuffer, SD host, device tree.

pub mod dtb;
pub mod framebuffer;
pub mod mailbox;
pub mod mmio;
pub mod sdhost;
pub mod uart;
