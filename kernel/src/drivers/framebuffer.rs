//! Linear framebuffer brought up through the mailbox property interface.

use spin::Once;

use crate::drivers::mailbox::{self, MBOX_CH_PROP, MBOX_REQUEST, MBOX_TAG_LAST};

/// Geometry and mapping of the negotiated framebuffer.
#[derive(Debug, Clone, Copy)]
pub struct FbInfo {
    pub width: u32,
    pub height: u32,
    pub pitch: u32,
    pub isrgb: u32,
    /// Kernel virtual address of the linear framebuffer
    pub lfb: usize,
    pub size: usize,
}

static FB_INFO: Once<FbInfo> = Once::new();

/// Negotiated geometry, if the GPU granted one.
pub fn info() -> Option<FbInfo> {
    FB_INFO.get().copied()
}

/// Ask the GPU for a 1024x768x32 framebuffer. The reply may differ; the
/// granted values are what `info()` reports.
pub fn init() -> Result<(), ()> {
    let granted = {
        let mut mbox = mailbox::MBOX.lock();
        let m = &mut mbox.0;
        m.fill(0);
        m[0] = 35 * 4;
        m[1] = MBOX_REQUEST;

        m[2] = 0x48003; // set physical width/height
        m[3] = 8;
        m[4] = 8;
        m[5] = 1024;
        m[6] = 768;

        m[7] = 0x48004; // set virtual width/height
        m[8] = 8;
        m[9] = 8;
        m[10] = 1024;
        m[11] = 768;

        m[12] = 0x48009; // set virtual offset
        m[13] = 8;
        m[14] = 8;
        m[15] = 0;
        m[16] = 0;

        m[17] = 0x48005; // set depth
        m[18] = 4;
        m[19] = 4;
        m[20] = 32;

        m[21] = 0x48006; // set pixel order
        m[22] = 4;
        m[23] = 4;
        m[24] = 1; // RGB

        m[25] = 0x40001; // allocate buffer
        m[26] = 8;
        m[27] = 8;
        m[28] = 4096;
        m[29] = 0;

        m[30] = 0x40008; // get pitch
        m[31] = 4;
        m[32] = 4;
        m[33] = 0;

        m[34] = MBOX_TAG_LAST;
        drop(mbox);

        if !mailbox::call(MBOX_CH_PROP) {
            return Err(());
        }

        let mbox = mailbox::MBOX.lock();
        let m = &mbox.0;
        if m[20] != 32 || m[28] == 0 {
            return Err(());
        }
        FbInfo {
            width: m[5],
            height: m[6],
            pitch: m[33],
            isrgb: m[24],
            // Bus address to ARM physical, then to the kernel alias.
            lfb: (m[28] & 0x3FFF_FFFF) as usize + crate::config::KERNEL_VIRT_OFFSET,
            size: m[29] as usize,
        }
    };

    log::info!(
        "framebuffer: {}x{} pitch {} ({})",
        granted.width,
        granted.height,
        granted.pitch,
        if granted.isrgb != 0 { "rgb" } else { "bgr" }
    );
    FB_INFO.call_once(|| granted);
    Ok(())
}
